//! Compiler backend contract
//!
//! A [`Compiler`] turns script source into a [`CompiledArtifact`] (off the
//! main context, results are cacheable) and later turns an artifact into the
//! [`ScriptDescriptor`]s it declares (on the main context). Descriptors carry
//! a factory instead of relying on runtime type discovery.

use hotscript_api::Script;
use std::path::Path;
use thiserror::Error;

/// Compiled image plus debug symbols, the two blobs of a cache entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledArtifact {
    pub image: Vec<u8>,
    pub symbols: Vec<u8>,
}

/// Errors from compiling or loading a script module
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Module {module} failed to compile: {message}")]
    Diagnostics { module: String, message: String },

    #[error("Failed to load compiled module: {0}")]
    Load(#[source] anyhow::Error),

    #[error("Module declares no scripts")]
    NoScripts,

    #[error("Compiler panicked: {0}")]
    Panicked(String),
}

type Factory = Box<dyn Fn() -> anyhow::Result<Box<dyn Script>> + Send + Sync>;

/// A script type declared by a loaded module
pub struct ScriptDescriptor {
    type_name: String,
    factory: Factory,
}

impl ScriptDescriptor {
    pub fn new<F>(type_name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<Box<dyn Script>> + Send + Sync + 'static,
    {
        Self {
            type_name: type_name.into(),
            factory: Box::new(factory),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Create a fresh instance of the declared script
    pub fn instantiate(&self) -> anyhow::Result<Box<dyn Script>> {
        (self.factory)()
    }
}

impl std::fmt::Debug for ScriptDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptDescriptor")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Toolchain that builds and loads script modules
pub trait Compiler: Send + Sync {
    /// File extension (without dot) of script sources, used when persisting
    /// and when scanning the scripts directory
    fn source_extension(&self) -> &str;

    /// Base type name a script declaration derives from (`Name : Contract`),
    /// used to derive module names from source text
    fn script_contract(&self) -> &str {
        "Script"
    }

    fn compile(
        &self,
        source: &str,
        module_name: &str,
        origin: Option<&Path>,
    ) -> Result<CompiledArtifact, CompileError>;

    fn load(&self, artifact: &CompiledArtifact) -> Result<Vec<ScriptDescriptor>, CompileError>;
}
