//! Wasym Bridge - host side of the symbolication module boundary
//!
//! This library lets a sandboxed WebAssembly symbolication module call
//! host-provided services while the host calls the module's exported entry
//! points with rich values. It provides:
//! - Typed access over the module's linear memory
//! - Strict string marshalling in and out of module memory
//! - An object heap mapping integer handles to host values
//! - Reference-counted wrapping of module closures
//! - The fixed host import surface the module may call
//! - Module lifecycle management and the two public entry points

/// Bridge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Public API modules
pub mod api;
pub mod closure;
pub mod codec;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod heap;
pub mod helper;
pub mod imports;
pub mod lifecycle;
pub mod memory;
pub mod promise;
pub mod value;

// Test utilities (only available in test builds)
#[cfg(test)]
pub mod test_utils;

// Re-export commonly used types
pub use api::{Bridge, CompactSymbolTable};
pub use closure::{make_closure, ClosureArity, ClosureState};
pub use codec::{CodecError, StringCodec};
pub use config::{companion_artifact, BridgeConfig};
pub use context::{BridgeContext, Environment};
pub use engine::{
    AbiArgs, AbiValue, CompileError, CompiledModule, ImportTable, ModuleAllocator, ModuleEngine,
    ModuleInstance, ModuleSource, ModuleTrap, StreamingError, StreamingSource, WasmSlice,
};
pub use error::BridgeError;
pub use heap::{Handle, HeapError, ObjectHeap};
pub use helper::{CandidateInfo, FileHandle, HelperError, SymbolicationHelper};
pub use imports::build_import_table;
pub use lifecycle::ModuleLifecycle;
pub use memory::{LinearMemory, MemoryAccessor, MemoryError, MemoryView, SharedMemory, ViewKind};
pub use promise::{Promise, PromiseState, Scheduler, Settled};
pub use value::{HostError, HostException, HostFn, HostFunction, Shared, Value};
