//! Host-level error type
//!
//! Component errors (compile, fetch, cache, config) have their own enums next
//! to the code that raises them. Fetch and cache failures are logged where
//! they happen; [`HostError`] covers what host operations return.

use crate::compiler::CompileError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by [`crate::ScriptHost`] operations
#[derive(Debug, Error)]
pub enum HostError {
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Compilation failed: {0}")]
    Compile(#[from] CompileError),

    #[error("Main context is closed or dropped the handoff")]
    MainContextClosed,

    #[error("Host was disposed")]
    Disposed,

    #[error("A load worker is still running")]
    Busy,

    #[error("Script {0} has no file on disk")]
    NotPersisted(String),

    #[error("No compiler configured")]
    NoCompiler,

    #[error("Failed to start background thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl HostError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
