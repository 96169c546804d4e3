//! Module engine contract
//!
//! The symbol-table computation runs inside a sandboxed binary module. This
//! bridge never interprets that module itself; it talks to it through the
//! traits here. An engine compiles module bytes, a compiled module
//! instantiates against the host import table, and an instance exposes the
//! module's memory, allocator, exception store and typed entry points.
//!
//! Values crossing the boundary are abstract ABI words: handles, pointers and
//! lengths travel as `U32`, sizes as `F64`.

use crate::memory::SharedMemory;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// A module-side failure that aborts the current call into the module.
///
/// Traps never unwind as panics; they travel as error values and surface to
/// the caller as `BridgeError::Trap`.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("module trap: {message}")]
pub struct ModuleTrap {
    pub message: String,
}

impl ModuleTrap {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Module compilation failure.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("module compilation failed: {0}")]
pub struct CompileError(pub String);

/// A value crossing the module boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AbiValue {
    U32(u32),
    F64(f64),
    /// Returned by imports that produce no value.
    Unit,
}

/// Argument accessors for import implementations.
pub trait AbiArgs {
    fn u32_at(&self, index: usize) -> Result<u32, ModuleTrap>;
    fn f64_at(&self, index: usize) -> Result<f64, ModuleTrap>;
}

impl AbiArgs for [AbiValue] {
    fn u32_at(&self, index: usize) -> Result<u32, ModuleTrap> {
        match self.get(index) {
            Some(AbiValue::U32(v)) => Ok(*v),
            other => Err(ModuleTrap::new(format!(
                "expected u32 argument at index {index}, got {other:?}"
            ))),
        }
    }

    fn f64_at(&self, index: usize) -> Result<f64, ModuleTrap> {
        match self.get(index) {
            Some(AbiValue::F64(v)) => Ok(*v),
            other => Err(ModuleTrap::new(format!(
                "expected f64 argument at index {index}, got {other:?}"
            ))),
        }
    }
}

/// A marshalled string location in linear memory: not null-terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WasmSlice {
    pub ptr: u32,
    pub len: u32,
}

impl WasmSlice {
    pub fn new(ptr: u32, len: u32) -> Self {
        Self { ptr, len }
    }
}

/// One host operation callable from module code.
pub type ImportFn = Arc<dyn Fn(&[AbiValue]) -> Result<AbiValue, ModuleTrap> + Send + Sync>;

/// The fixed catalogue of host operations wired as the module's import table.
#[derive(Clone, Default)]
pub struct ImportTable {
    entries: HashMap<&'static str, ImportFn>,
}

impl ImportTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &'static str,
        f: impl Fn(&[AbiValue]) -> Result<AbiValue, ModuleTrap> + Send + Sync + 'static,
    ) {
        self.entries.insert(name, Arc::new(f));
    }

    pub fn get(&self, name: &str) -> Option<&ImportFn> {
        self.entries.get(name)
    }

    /// Invoke a host import by name. Unknown names trap.
    pub fn call(&self, name: &str, args: &[AbiValue]) -> Result<AbiValue, ModuleTrap> {
        match self.entries.get(name) {
            Some(f) => f(args),
            None => Err(ModuleTrap::new(format!("unknown host import: {name}"))),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered import names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.entries.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ImportTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportTable")
            .field("entries", &self.names())
            .finish()
    }
}

/// The module's allocation primitives, used for string marshalling.
pub trait ModuleAllocator: Send + Sync {
    fn malloc(&self, len: u32, align: u32) -> Result<u32, ModuleTrap>;
    fn realloc(&self, ptr: u32, old_len: u32, new_len: u32, align: u32)
        -> Result<u32, ModuleTrap>;
}

/// An instantiated module.
///
/// The two entry points return a handle to a promise-shaped value. The
/// closure entries and the destructor table back the closure adapter, and
/// `store_exception` is the module-side slot the host stashes caught
/// exceptions into.
pub trait ModuleInstance: ModuleAllocator {
    fn memory(&self) -> SharedMemory;

    /// Stash a caught host exception (by handle) for the module to retrieve.
    fn store_exception(&self, handle: u32);

    fn get_compact_symbol_table(
        &self,
        debug_name: WasmSlice,
        breakpad_id: WasmSlice,
        helper: u32,
    ) -> Result<u32, ModuleTrap>;

    fn query_api(
        &self,
        url: WasmSlice,
        request_json: WasmSlice,
        helper: u32,
    ) -> Result<u32, ModuleTrap>;

    /// Invoke a one-argument module closure identified by its state words.
    fn invoke_closure1(&self, state_a: u32, state_b: u32, arg: u32) -> Result<(), ModuleTrap>;

    /// Invoke a two-argument module closure identified by its state words.
    fn invoke_closure2(
        &self,
        state_a: u32,
        state_b: u32,
        arg0: u32,
        arg1: u32,
    ) -> Result<(), ModuleTrap>;

    /// Run entry `index` of the module's destructor table.
    fn run_destructor(&self, index: u32, state_a: u32, state_b: u32) -> Result<(), ModuleTrap>;
}

/// A compiled module, ready to instantiate against an import table.
pub trait CompiledModule: Send + Sync {
    fn instantiate(&self, imports: &ImportTable) -> Result<Arc<dyn ModuleInstance>, ModuleTrap>;
}

/// A streamed module artifact: transport content type plus byte chunks.
pub struct StreamingSource {
    pub content_type: Option<String>,
    pub stream: BoxStream<'static, std::io::Result<Vec<u8>>>,
}

/// Why a streaming compile did not produce a module.
#[derive(Debug, Error)]
pub enum StreamingError {
    /// The engine has no streaming path; callers fall back to buffering.
    #[error("streaming compilation not supported by this engine")]
    Unsupported,

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("failed to read module stream: {0}")]
    Transport(#[from] std::io::Error),
}

/// Compiles module bytes into instantiable modules.
pub trait ModuleEngine: Send + Sync {
    fn compile(&self, bytes: &[u8]) -> Result<Arc<dyn CompiledModule>, CompileError>;

    /// Compile while the artifact is still downloading. Engines without a
    /// streaming path keep the default, and the lifecycle manager buffers.
    fn compile_streaming(
        &self,
        source: StreamingSource,
    ) -> BoxFuture<'static, Result<Arc<dyn CompiledModule>, StreamingError>> {
        drop(source);
        Box::pin(futures_util::future::ready(Err(StreamingError::Unsupported)))
    }
}

/// Where the module artifact comes from.
pub enum ModuleSource {
    /// Fetch over HTTP, preferring streaming compilation.
    Url(String),
    /// A pre-fetched byte buffer.
    Bytes(Vec<u8>),
    /// An already-compiled module object.
    Compiled(Arc<dyn CompiledModule>),
}

impl std::fmt::Debug for ModuleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleSource::Url(url) => write!(f, "ModuleSource::Url({url})"),
            ModuleSource::Bytes(b) => write!(f, "ModuleSource::Bytes({} bytes)", b.len()),
            ModuleSource::Compiled(_) => write!(f, "ModuleSource::Compiled"),
        }
    }
}
