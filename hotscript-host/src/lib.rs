//! hotscript-host: Hot-pluggable script lifecycle engine
//!
//! This crate loads scripts from source at runtime, compiles them in a
//! background worker with a content-addressed cache, installs them on the
//! designated main context, gates them against a remote blacklist, pulls
//! newer versions from update manifests and dispatches host events to every
//! enabled script with per-script failure isolation.
//!
//! # Example
//!
//! ```ignore
//! use hotscript_host::{HostConfig, ScriptHost};
//!
//! let host = ScriptHost::builder(HostConfig::load_or_default(&HostConfig::default_path())?)
//!     .build()?;
//! host.reload_all()?;
//! loop {
//!     host.pump();
//!     host.dispatch(&HostEvent::Update);
//! }
//! ```

pub mod cache;
pub mod compiler;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fetch;
pub mod gate;
pub mod host;
mod install;
pub mod instance;
pub mod loader;
pub mod logging;
pub mod main_context;
pub mod registry;
pub mod source_scan;
pub mod state;
pub mod summary;
pub mod trust;
pub mod watcher;

#[cfg(feature = "wasm")]
pub mod wasm;

pub use cache::{CacheError, CacheKey, ScriptCache};
pub use compiler::{CompileError, CompiledArtifact, Compiler, ScriptDescriptor};
pub use config::{ConfigError, HostConfig, Settings};
pub use dispatch::{DispatchReport, HookFailure};
pub use error::HostError;
pub use fetch::{FetchError, Fetcher, HttpFetcher, StaticFetcher};
pub use gate::{BlacklistEntry, RefreshReport, UpdateEntry, UpdateGate};
pub use host::{ScriptHost, ScriptHostBuilder};
pub use instance::{HookOutcome, InternalData, ScriptInstance};
pub use loader::LoadRequest;
pub use main_context::{MainContext, MainContextHandle};
pub use registry::{ScriptRegistry, Snapshot};
pub use state::{GameContext, Transition};
pub use summary::{MemoryUpdateSummary, NullStatusSink, StatusSink, UpdateSummary, UpdatedScript};
pub use trust::TrustPolicy;
pub use watcher::{ScriptWatcher, WatcherConfig, WatcherError};

#[cfg(feature = "wasm")]
pub use wasm::{WasmCompiler, WasmError, WasmScript};

pub use hotscript_api::{
    HookResult, HostEvent, Script, ScriptContext, ScriptManifest, ScriptMetadata, API_VERSION,
};
