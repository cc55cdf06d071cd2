//! WebAssembly compiler backend using wasmtime
//!
//! Script sources are WebAssembly text. Compiling produces a serialized
//! wasmtime module (the cached image) and msgpack debug symbols. Loading
//! deserializes the module, reads its manifest and hands out a factory that
//! instantiates a fresh sandboxed [`WasmScript`] per script instance.

mod script;

pub use script::WasmScript;

use crate::compiler::{CompileError, CompiledArtifact, Compiler, ScriptDescriptor};
use hotscript_api::Script;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use wasmtime::{Config, Engine, Module};

/// Fuel granted to each guest call
pub const DEFAULT_FUEL: u64 = 10_000_000;

/// Errors from the wasm backend
#[derive(Debug, Error)]
pub enum WasmError {
    #[error("Engine creation failed: {0}")]
    EngineCreation(#[source] anyhow::Error),

    #[error("Instantiation failed: {0}")]
    Instantiation(#[source] anyhow::Error),

    #[error("Export not found: {0}")]
    ExportNotFound(String),

    #[error("Function call failed: {function} - {source}")]
    FunctionCall {
        function: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Hook {function} returned status {status}")]
    HookStatus { function: &'static str, status: i32 },

    #[error("API version mismatch: expected {expected}, got {actual}")]
    ApiVersionMismatch { expected: u32, actual: u32 },

    #[error("Deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    #[error("Memory access error: {0}")]
    MemoryAccess(String),

    #[error("Fuel exhausted (CPU limit exceeded)")]
    FuelExhausted,
}

/// Debug symbols stored next to the module image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSymbols {
    pub module: String,
    pub origin: Option<String>,
    pub exports: Vec<String>,
}

impl ModuleSymbols {
    pub fn decode(bytes: &[u8]) -> Result<Self, WasmError> {
        rmp_serde::from_slice(bytes).map_err(WasmError::Deserialization)
    }
}

/// [`Compiler`] for WebAssembly text scripts
#[derive(Clone)]
pub struct WasmCompiler {
    engine: Engine,
    fuel: u64,
}

impl WasmCompiler {
    pub fn new() -> Result<Self, WasmError> {
        let mut config = Config::new();
        config.consume_fuel(true);
        config.wasm_memory64(false);

        let engine = Engine::new(&config).map_err(WasmError::EngineCreation)?;
        Ok(Self {
            engine,
            fuel: DEFAULT_FUEL,
        })
    }

    /// Fuel budget for every guest call
    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = fuel;
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

impl std::fmt::Debug for WasmCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmCompiler")
            .field("fuel", &self.fuel)
            .finish_non_exhaustive()
    }
}

impl Compiler for WasmCompiler {
    fn source_extension(&self) -> &str {
        "wat"
    }

    fn compile(
        &self,
        source: &str,
        module_name: &str,
        origin: Option<&Path>,
    ) -> Result<CompiledArtifact, CompileError> {
        let module = Module::new(&self.engine, source).map_err(|e| CompileError::Diagnostics {
            module: module_name.to_string(),
            message: format!("{e:#}"),
        })?;
        let image = module.serialize().map_err(CompileError::Load)?;

        let symbols = ModuleSymbols {
            module: module_name.to_string(),
            origin: origin.map(|p| p.display().to_string()),
            exports: module.exports().map(|e| e.name().to_string()).collect(),
        };
        let symbols = rmp_serde::to_vec(&symbols).map_err(|e| CompileError::Load(e.into()))?;

        Ok(CompiledArtifact { image, symbols })
    }

    fn load(&self, artifact: &CompiledArtifact) -> Result<Vec<ScriptDescriptor>, CompileError> {
        // SAFETY: images are produced by `compile` above with an engine of
        // the same configuration, either directly or through the cache.
        // wasmtime rejects images from a different engine version or config.
        let module = unsafe { Module::deserialize(&self.engine, &artifact.image) }
            .map_err(CompileError::Load)?;

        // Probe once so a broken module fails the load, not the first hook
        let probe = WasmScript::instantiate(&self.engine, &module, self.fuel)
            .map_err(|e| CompileError::Load(e.into()))?;
        let type_name = probe.metadata().full_name();
        tracing::debug!(script = %type_name, "Wasm script module loaded");

        let engine = self.engine.clone();
        let fuel = self.fuel;
        let descriptor = ScriptDescriptor::new(type_name, move || {
            let script = WasmScript::instantiate(&engine, &module, fuel)?;
            Ok(Box::new(script) as Box<dyn Script>)
        });
        Ok(vec![descriptor])
    }
}
