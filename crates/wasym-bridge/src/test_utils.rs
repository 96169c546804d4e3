//! Shared test doubles for unit tests
//!
//! `StubInstance` is a minimal module instance that records interactions;
//! `BumpAllocator` is a module allocator over a shared memory for codec
//! tests. Scripted end-to-end modules live in `tests/common`.

use crate::context::BridgeContext;
use crate::engine::{ModuleAllocator, ModuleInstance, ModuleTrap, WasmSlice};
use crate::memory::{LinearMemory, SharedMemory};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Bump allocator over a shared linear memory. Reallocation allocates a new
/// region and copies; nothing is freed.
pub struct BumpAllocator {
    memory: SharedMemory,
    top: Mutex<u32>,
    realloc_calls: AtomicU32,
}

impl BumpAllocator {
    pub fn new(memory: SharedMemory) -> Self {
        Self {
            memory,
            // Keep pointer 0 unused so it can stay a sentinel.
            top: Mutex::new(16),
            realloc_calls: AtomicU32::new(0),
        }
    }

    pub fn realloc_calls(&self) -> u32 {
        self.realloc_calls.load(Ordering::SeqCst)
    }

    fn bump(&self, len: u32) -> u32 {
        let mut top = self.top.lock().unwrap();
        let ptr = *top;
        let needed = ptr as usize + len as usize;
        let size = self.memory.len();
        if needed > size {
            self.memory.with_mut(|m| m.grow(needed - size + 1024));
        }
        *top += len;
        ptr
    }
}

impl ModuleAllocator for BumpAllocator {
    fn malloc(&self, len: u32, _align: u32) -> Result<u32, ModuleTrap> {
        Ok(self.bump(len))
    }

    fn realloc(
        &self,
        ptr: u32,
        old_len: u32,
        new_len: u32,
        _align: u32,
    ) -> Result<u32, ModuleTrap> {
        self.realloc_calls.fetch_add(1, Ordering::SeqCst);
        if new_len <= old_len {
            // Shrink in place.
            return Ok(ptr);
        }
        let new_ptr = self.bump(new_len);
        let data = self.memory.with(|m| {
            m.bytes()[ptr as usize..(ptr + old_len) as usize].to_vec()
        });
        self.memory.with_mut(|m| {
            m.bytes_mut()[new_ptr as usize..new_ptr as usize + data.len()]
                .copy_from_slice(&data);
        });
        Ok(new_ptr)
    }
}

/// Recording module instance for unit tests.
pub struct StubInstance {
    memory: SharedMemory,
    allocator: BumpAllocator,
    pub exceptions: Mutex<Vec<u32>>,
    /// (state_a, state_b, marshalled argument handles)
    pub invocations: Mutex<Vec<(u32, u32, Vec<u32>)>>,
    /// (destructor index, state_a, state_b)
    pub destroyed: Mutex<Vec<(u32, u32, u32)>>,
    pub trap_on_invoke: AtomicBool,
    /// Runs inside closure invocations, before returning.
    #[allow(clippy::type_complexity)]
    pub invoke_hook: Mutex<Option<Box<dyn Fn() + Send>>>,
}

impl StubInstance {
    pub fn new() -> Arc<Self> {
        let memory = SharedMemory::new(LinearMemory::new(4096));
        Arc::new(Self {
            allocator: BumpAllocator::new(memory.clone()),
            memory,
            exceptions: Mutex::new(Vec::new()),
            invocations: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
            trap_on_invoke: AtomicBool::new(false),
            invoke_hook: Mutex::new(None),
        })
    }

    /// Create a stub and install it as the context's instance.
    pub fn install(context: &Arc<BridgeContext>) -> Arc<Self> {
        let instance = Self::new();
        context.install_instance(instance.clone());
        instance
    }

    fn record_invocation(&self, state_a: u32, state_b: u32, args: Vec<u32>) -> Result<(), ModuleTrap> {
        if self.trap_on_invoke.load(Ordering::SeqCst) {
            return Err(ModuleTrap::new("scripted invocation trap"));
        }
        if state_a == 0 {
            return Err(ModuleTrap::new("closure invoked recursively or destroyed"));
        }
        self.invocations.lock().unwrap().push((state_a, state_b, args));
        if let Some(hook) = self.invoke_hook.lock().unwrap().as_ref() {
            hook();
        }
        Ok(())
    }
}

impl ModuleAllocator for StubInstance {
    fn malloc(&self, len: u32, align: u32) -> Result<u32, ModuleTrap> {
        self.allocator.malloc(len, align)
    }

    fn realloc(&self, ptr: u32, old_len: u32, new_len: u32, align: u32) -> Result<u32, ModuleTrap> {
        self.allocator.realloc(ptr, old_len, new_len, align)
    }
}

impl ModuleInstance for StubInstance {
    fn memory(&self) -> SharedMemory {
        self.memory.clone()
    }

    fn store_exception(&self, handle: u32) {
        self.exceptions.lock().unwrap().push(handle);
    }

    fn get_compact_symbol_table(
        &self,
        _debug_name: WasmSlice,
        _breakpad_id: WasmSlice,
        _helper: u32,
    ) -> Result<u32, ModuleTrap> {
        Err(ModuleTrap::new("stub instance has no entry points"))
    }

    fn query_api(
        &self,
        _url: WasmSlice,
        _request_json: WasmSlice,
        _helper: u32,
    ) -> Result<u32, ModuleTrap> {
        Err(ModuleTrap::new("stub instance has no entry points"))
    }

    fn invoke_closure1(&self, state_a: u32, state_b: u32, arg: u32) -> Result<(), ModuleTrap> {
        self.record_invocation(state_a, state_b, vec![arg])
    }

    fn invoke_closure2(
        &self,
        state_a: u32,
        state_b: u32,
        arg0: u32,
        arg1: u32,
    ) -> Result<(), ModuleTrap> {
        self.record_invocation(state_a, state_b, vec![arg0, arg1])
    }

    fn run_destructor(&self, index: u32, state_a: u32, state_b: u32) -> Result<(), ModuleTrap> {
        self.destroyed.lock().unwrap().push((index, state_a, state_b));
        Ok(())
    }
}
