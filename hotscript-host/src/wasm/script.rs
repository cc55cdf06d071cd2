//! Sandboxed script instance backed by a wasmtime store

use super::WasmError;
use hotscript_api::{
    HookResult, HostEvent, Script, ScriptContext, ScriptManifest, ScriptMetadata, API_VERSION,
};
use wasmtime::{Engine, Instance, Linker, Memory, Module, Store, Trap, TypedFunc, WasmParams, WasmResults};

/// Unpack ptr and len from a packed i64
#[inline]
pub(crate) fn unpack_ptr_len(packed: i64) -> (i32, i32) {
    let ptr = (packed >> 32) as i32;
    let len = (packed & 0xFFFFFFFF) as i32;
    (ptr, len)
}

/// Optional lifecycle exports
struct Hooks {
    setup: Option<TypedFunc<(), i32>>,
    enable: Option<TypedFunc<(), i32>>,
    disable: Option<TypedFunc<(), i32>>,
    reset: Option<TypedFunc<(), i32>>,
    updated: Option<TypedFunc<i32, i32>>,
    event: Option<TypedFunc<(i32, i32), i32>>,
}

impl Hooks {
    fn resolve(store: &mut Store<()>, instance: &Instance) -> Self {
        Self {
            setup: instance.get_typed_func(&mut *store, "script_setup").ok(),
            enable: instance.get_typed_func(&mut *store, "script_enable").ok(),
            disable: instance.get_typed_func(&mut *store, "script_disable").ok(),
            reset: instance.get_typed_func(&mut *store, "script_reset").ok(),
            updated: instance.get_typed_func(&mut *store, "script_updated").ok(),
            event: instance.get_typed_func(&mut *store, "script_event").ok(),
        }
    }
}

/// One live wasm script
pub struct WasmScript {
    metadata: ScriptMetadata,
    store: Store<()>,
    memory: Memory,
    alloc_fn: TypedFunc<i32, i32>,
    dealloc_fn: TypedFunc<(i32, i32), ()>,
    hooks: Hooks,
    fuel: u64,
}

impl WasmScript {
    /// Instantiate `module` in a fresh store and read its manifest
    pub fn instantiate(engine: &Engine, module: &Module, fuel: u64) -> Result<Self, WasmError> {
        let mut store = Store::new(engine, ());
        store.set_fuel(fuel).map_err(WasmError::EngineCreation)?;

        // No host imports: scripts only see what is passed to their exports
        let linker = Linker::new(engine);
        let instance = linker
            .instantiate(&mut store, module)
            .map_err(WasmError::Instantiation)?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| WasmError::ExportNotFound("memory".to_string()))?;
        let alloc_fn = instance
            .get_typed_func::<i32, i32>(&mut store, "script_alloc")
            .map_err(|_| WasmError::ExportNotFound("script_alloc".to_string()))?;
        let dealloc_fn = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, "script_dealloc")
            .map_err(|_| WasmError::ExportNotFound("script_dealloc".to_string()))?;
        let manifest_fn = instance
            .get_typed_func::<(), i64>(&mut store, "script_manifest")
            .map_err(|_| WasmError::ExportNotFound("script_manifest".to_string()))?;

        let packed = call_guest(&mut store, fuel, &manifest_fn, (), "script_manifest")?;
        let (ptr, len) = unpack_ptr_len(packed);
        let bytes = read_memory(&store, &memory, ptr, len)?;
        let manifest: ScriptManifest =
            rmp_serde::from_slice(&bytes).map_err(WasmError::Deserialization)?;
        if manifest.api_version != API_VERSION {
            return Err(WasmError::ApiVersionMismatch {
                expected: API_VERSION,
                actual: manifest.api_version,
            });
        }
        call_guest(&mut store, fuel, &dealloc_fn, (ptr, len), "script_dealloc")?;

        let hooks = Hooks::resolve(&mut store, &instance);
        Ok(Self {
            metadata: manifest.metadata,
            store,
            memory,
            alloc_fn,
            dealloc_fn,
            hooks,
            fuel,
        })
    }

    fn call_status<P: WasmParams>(
        &mut self,
        func: Option<TypedFunc<P, i32>>,
        params: P,
        function: &'static str,
    ) -> Result<(), WasmError> {
        let Some(func) = func else {
            return Ok(());
        };
        let status = call_guest(&mut self.store, self.fuel, &func, params, function)?;
        if status != 0 {
            return Err(WasmError::HookStatus { function, status });
        }
        Ok(())
    }

    fn send_event(&mut self, event: &HostEvent) -> Result<(), WasmError> {
        let Some(event_fn) = self.hooks.event.clone() else {
            return Ok(());
        };
        let bytes = rmp_serde::to_vec_named(event).map_err(WasmError::Serialization)?;
        let len = i32::try_from(bytes.len())
            .map_err(|_| WasmError::MemoryAccess(format!("Event too large: {} bytes", bytes.len())))?;

        let ptr = call_guest(&mut self.store, self.fuel, &self.alloc_fn, len, "script_alloc")?;
        self.memory
            .write(&mut self.store, ptr as usize, &bytes)
            .map_err(|e| WasmError::MemoryAccess(format!("Failed to write event: {e}")))?;

        let result = self.call_status(Some(event_fn), (ptr, len), "script_event");
        self.dealloc_fn.call(&mut self.store, (ptr, len)).ok();
        result
    }
}

impl std::fmt::Debug for WasmScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmScript")
            .field("metadata", &self.metadata)
            .field("fuel", &self.fuel)
            .finish_non_exhaustive()
    }
}

impl Script for WasmScript {
    fn metadata(&self) -> &ScriptMetadata {
        &self.metadata
    }

    fn on_setup(&mut self) -> HookResult {
        Ok(self.call_status(self.hooks.setup.clone(), (), "script_setup")?)
    }

    fn on_enable(&mut self) -> HookResult {
        Ok(self.call_status(self.hooks.enable.clone(), (), "script_enable")?)
    }

    fn on_disable(&mut self) -> HookResult {
        Ok(self.call_status(self.hooks.disable.clone(), (), "script_disable")?)
    }

    fn on_reset(&mut self) -> HookResult {
        Ok(self.call_status(self.hooks.reset.clone(), (), "script_reset")?)
    }

    fn on_script_updated(&mut self, previous_version: u32) -> HookResult {
        let previous = i32::try_from(previous_version).unwrap_or(i32::MAX);
        Ok(self.call_status(self.hooks.updated.clone(), previous, "script_updated")?)
    }

    fn handle_event(&mut self, _ctx: &mut ScriptContext<'_>, event: &HostEvent) -> HookResult {
        match event {
            HostEvent::Reset => self.on_reset(),
            _ => Ok(self.send_event(event)?),
        }
    }
}

/// Call a guest export with a fresh fuel budget
fn call_guest<P: WasmParams, R: WasmResults>(
    store: &mut Store<()>,
    fuel: u64,
    func: &TypedFunc<P, R>,
    params: P,
    function: &'static str,
) -> Result<R, WasmError> {
    store.set_fuel(fuel).map_err(WasmError::EngineCreation)?;
    func.call(&mut *store, params).map_err(|e| {
        if e.downcast_ref::<Trap>() == Some(&Trap::OutOfFuel) {
            WasmError::FuelExhausted
        } else {
            WasmError::FunctionCall {
                function,
                source: e,
            }
        }
    })
}

fn read_memory(store: &Store<()>, memory: &Memory, ptr: i32, len: i32) -> Result<Vec<u8>, WasmError> {
    let data = memory.data(store);
    let (start, len) = (ptr as u32 as usize, len as u32 as usize);
    match data.get(start..start.saturating_add(len)) {
        Some(bytes) => Ok(bytes.to_vec()),
        None => Err(WasmError::MemoryAccess(format!(
            "Out of bounds: ptr={}, len={}, memory_size={}",
            ptr,
            len,
            data.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        let ptr = 0x12345678_i32;
        let len = 0x00000100_i32;
        let packed = ((ptr as i64) << 32) | (len as i64 & 0xFFFFFFFF);
        let (up, ul) = unpack_ptr_len(packed);
        assert_eq!(up, ptr);
        assert_eq!(ul, len);
    }

    #[test]
    fn test_read_memory_bounds() {
        let engine = Engine::default();
        let mut store = Store::new(&engine, ());
        let memory = Memory::new(&mut store, wasmtime::MemoryType::new(1, None)).unwrap();

        assert_eq!(read_memory(&store, &memory, 0, 4).unwrap(), vec![0; 4]);
        assert!(matches!(
            read_memory(&store, &memory, 65_530, 10),
            Err(WasmError::MemoryAccess(_))
        ));
    }
}
