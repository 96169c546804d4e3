//! Shared bridge state
//!
//! One `BridgeContext` exists per instantiated module. It owns the object
//! heap, the string codec, the scheduler and the ambient environment, and
//! holds the module instance once instantiation finishes. The import surface
//! and the closure adapter operate through it.
//!
//! Lock discipline: heap and memory locks are taken per operation and never
//! held across a call back into the module.

use crate::engine::{ModuleInstance, ModuleTrap};
use crate::codec::StringCodec;
use crate::heap::{Handle, HeapError, ObjectHeap};
use crate::memory::MemoryAccessor;
use crate::promise::Scheduler;
use crate::value::Value;
use std::sync::{Arc, Mutex, OnceLock};

/// The ambient execution contexts a module may probe for a global object,
/// in probe order: worker self, window, explicit global, globalThis.
///
/// A probe with no value behaves like a failed lookup: the import reports a
/// module-visible error instead of aborting the import surface.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub self_object: Option<Value>,
    pub window: Option<Value>,
    pub explicit_global: Option<Value>,
    pub global_this: Option<Value>,
}

impl Environment {
    /// An environment whose only available context is `globalThis`.
    pub fn with_global(global: Value) -> Self {
        Self {
            global_this: Some(global),
            ..Self::default()
        }
    }
}

/// Process-wide mutable state of one bridge instance.
pub struct BridgeContext {
    heap: Mutex<ObjectHeap>,
    pub codec: StringCodec,
    pub scheduler: Scheduler,
    pub environment: Environment,
    instance: OnceLock<Arc<dyn ModuleInstance>>,
    accessor: OnceLock<MemoryAccessor>,
}

impl BridgeContext {
    pub fn new(environment: Environment) -> Arc<Self> {
        Arc::new(Self {
            heap: Mutex::new(ObjectHeap::new()),
            codec: StringCodec::new(),
            scheduler: Scheduler::new(),
            environment,
            instance: OnceLock::new(),
            accessor: OnceLock::new(),
        })
    }

    /// Finalize initialization: install the instance and cache a fresh
    /// memory accessor. Called exactly once by the lifecycle manager.
    pub fn install_instance(&self, instance: Arc<dyn ModuleInstance>) {
        let accessor = MemoryAccessor::new(instance.memory());
        if self.instance.set(instance).is_err() {
            // Idempotent initialization never reaches a second install.
            unreachable!("module instance installed twice");
        }
        let _ = self.accessor.set(accessor);
    }

    pub fn instance(&self) -> Result<Arc<dyn ModuleInstance>, ModuleTrap> {
        self.instance
            .get()
            .cloned()
            .ok_or_else(|| ModuleTrap::new("module instance not installed"))
    }

    pub fn accessor(&self) -> Result<MemoryAccessor, ModuleTrap> {
        self.accessor
            .get()
            .cloned()
            .ok_or_else(|| ModuleTrap::new("module memory not available"))
    }

    fn with_heap<R>(&self, f: impl FnOnce(&mut ObjectHeap) -> R) -> R {
        let mut heap = self.heap.lock().expect("object heap lock poisoned");
        f(&mut heap)
    }

    /// Move a value into module-visible space, returning its handle.
    pub fn alloc_value(&self, value: Value) -> Handle {
        self.with_heap(|heap| heap.allocate(value))
    }

    pub fn get_value(&self, handle: u32) -> Result<Value, ModuleTrap> {
        self.with_heap(|heap| heap.get(Handle(handle))).map_err(trap_from_heap)
    }

    pub fn take_value(&self, handle: u32) -> Result<Value, ModuleTrap> {
        self.with_heap(|heap| heap.take(Handle(handle))).map_err(trap_from_heap)
    }

    pub fn drop_value(&self, handle: u32) -> Result<(), ModuleTrap> {
        self.with_heap(|heap| heap.drop_handle(Handle(handle)))
            .map_err(trap_from_heap)
    }

    pub fn clone_value(&self, handle: u32) -> Result<Handle, ModuleTrap> {
        self.with_heap(|heap| heap.clone_handle(Handle(handle)))
            .map_err(trap_from_heap)
    }

    /// Stash a caught host exception into the module's exception slot.
    pub fn stash_exception(&self, value: Value) -> Result<(), ModuleTrap> {
        let instance = self.instance()?;
        let handle = self.alloc_value(value);
        instance.store_exception(handle.0);
        Ok(())
    }

    /// Live non-reserved heap slots. Used by tests to verify release
    /// discipline across a full call.
    pub fn live_handles(&self) -> usize {
        self.with_heap(|heap| heap.live_count())
    }
}

fn trap_from_heap(err: HeapError) -> ModuleTrap {
    ModuleTrap::new(err.to_string())
}

impl std::fmt::Debug for BridgeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeContext")
            .field("live_handles", &self.live_handles())
            .field("initialized", &self.instance.get().is_some())
            .finish()
    }
}
