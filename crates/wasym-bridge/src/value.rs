//! Host value representation
//!
//! The dynamic value type stored in the object heap and handed to the module
//! by handle. Objects, arrays and owned buffers have reference semantics: a
//! cloned `Value` (and therefore a cloned handle) aliases the same underlying
//! storage, matching what module code expects from host objects.

use crate::closure::ClosureState;
use crate::engine::ModuleTrap;
use crate::helper::{FileHandle, SymbolicationHelper};
use crate::memory::{MemoryView, SharedMemory, ViewKind};
use crate::promise::Promise;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Explicit reference semantics wrapper.
///
/// All clones point at the same underlying value, and mutation through any
/// clone is visible to all of them. This is what host objects need: two
/// handles produced by `clone_handle` must observe each other's property
/// writes.
#[derive(Debug, Default)]
pub struct Shared<T>(Arc<Mutex<T>>);

impl<T> Shared<T> {
    pub fn new(value: T) -> Self {
        Shared(Arc::new(Mutex::new(value)))
    }

    /// Acquire the lock and apply a read function.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.0.lock().expect("Shared<T> lock poisoned");
        f(&guard)
    }

    /// Acquire the lock and apply a mutation function.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.0.lock().expect("Shared<T> lock poisoned");
        f(&mut guard)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Shared(self.0.clone())
    }
}

impl<T: PartialEq> PartialEq for Shared<T> {
    fn eq(&self, other: &Self) -> bool {
        // Reference semantics: equal only if the same allocation.
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A host exception as the module sees it: name plus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostException {
    pub name: String,
    pub message: String,
}

impl HostException {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for HostException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// Failure of a host operation invoked from module code.
///
/// Exceptions are caught at the import boundary, stashed in the module's
/// exception slot and reported with a sentinel return. Traps abort the
/// current call into the module.
#[derive(Debug, Clone)]
pub enum HostError {
    Exception(Value),
    Trap(ModuleTrap),
}

impl HostError {
    pub fn exception(name: &str, message: impl Into<String>) -> Self {
        HostError::Exception(Value::Error(Arc::new(HostException::new(name, message))))
    }
}

impl From<ModuleTrap> for HostError {
    fn from(trap: ModuleTrap) -> Self {
        HostError::Trap(trap)
    }
}

/// A host function callable with values.
pub type HostFn = Arc<dyn Fn(&[Value]) -> Result<Value, HostError> + Send + Sync>;

/// A callable host value.
///
/// Either a plain host closure (promise resolvers, microtask handlers) or a
/// wrapper over a module closure, in which case `origin` carries the closure
/// state the `callback_drop` protocol operates on.
#[derive(Clone)]
pub struct HostFunction {
    f: HostFn,
    origin: Option<Arc<ClosureState>>,
}

impl HostFunction {
    pub fn new(f: impl Fn(&[Value]) -> Result<Value, HostError> + Send + Sync + 'static) -> Self {
        Self {
            f: Arc::new(f),
            origin: None,
        }
    }

    pub(crate) fn with_origin(f: HostFn, origin: Arc<ClosureState>) -> Self {
        Self {
            f,
            origin: Some(origin),
        }
    }

    pub fn call(&self, args: &[Value]) -> Result<Value, HostError> {
        (self.f)(args)
    }

    /// The module closure state backing this function, if any.
    pub fn origin(&self) -> Option<&Arc<ClosureState>> {
        self.origin.as_ref()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.f, &other.f)
    }
}

impl std::fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "HostFunction({})",
            if self.origin.is_some() {
                "module closure"
            } else {
                "host"
            }
        )
    }
}

/// Runtime value type
#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    /// Numeric value (IEEE 754 double-precision)
    Number(f64),
    /// String value (reference-counted, immutable)
    String(Arc<str>),
    /// Array of values (reference semantics)
    Array(Shared<Vec<Value>>),
    /// String-keyed object (reference semantics)
    Object(Shared<HashMap<String, Value>>),
    /// Owned byte buffer (reference semantics)
    ByteArray(Shared<Vec<u8>>),
    /// Owned 32-bit-word buffer (reference semantics)
    WordArray(Shared<Vec<u32>>),
    /// Typed view over module linear memory, byte or word flavored
    View(MemoryView),
    /// The module memory object itself
    Memory(SharedMemory),
    /// Callable value
    Function(HostFunction),
    /// Promise-shaped asynchronous value
    Promise(Promise),
    /// Host exception value
    Error(Arc<HostException>),
    /// Open file provided by the helper
    File(Arc<dyn FileHandle>),
    /// The caller-supplied helper
    Helper(Arc<dyn SymbolicationHelper>),
}

impl Value {
    pub fn string(s: impl Into<Arc<str>>) -> Self {
        Value::String(s.into())
    }

    pub fn array(values: Vec<Value>) -> Self {
        Value::Array(Shared::new(values))
    }

    pub fn object() -> Self {
        Value::Object(Shared::new(HashMap::new()))
    }

    pub fn error(name: &str, message: impl Into<String>) -> Self {
        Value::Error(Arc::new(HostException::new(name, message)))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Value::Function(_))
    }

    /// Element count for array-like values.
    pub fn length(&self) -> Option<u32> {
        match self {
            Value::Array(a) => Some(a.with(|v| v.len() as u32)),
            Value::ByteArray(b) => Some(b.with(|v| v.len() as u32)),
            Value::WordArray(w) => Some(w.with(|v| v.len() as u32)),
            Value::View(view) => Some(view.len()),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::ByteArray(_) => "byte_array",
            Value::WordArray(_) => "word_array",
            Value::View(view) => match view.kind() {
                ViewKind::Byte => "byte_view",
                ViewKind::Word => "word_view",
            },
            Value::Memory(_) => "memory",
            Value::Function(_) => "function",
            Value::Promise(_) => "promise",
            Value::Error(_) => "error",
            Value::File(_) => "file",
            Value::Helper(_) => "helper",
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Undefined => write!(f, "Undefined"),
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Array(a) => write!(f, "Array(len={})", a.with(|v| v.len())),
            Value::Object(o) => write!(f, "Object(keys={})", o.with(|m| m.len())),
            Value::ByteArray(b) => write!(f, "ByteArray(len={})", b.with(|v| v.len())),
            Value::WordArray(w) => write!(f, "WordArray(len={})", w.with(|v| v.len())),
            Value::View(v) => write!(f, "{v:?}"),
            Value::Memory(m) => write!(f, "{m:?}"),
            Value::Function(func) => write!(f, "{func:?}"),
            Value::Promise(p) => write!(f, "{p:?}"),
            Value::Error(e) => write!(f, "Error({e})"),
            Value::File(file) => write!(f, "File(size={})", file.size()),
            Value::Helper(_) => write!(f, "Helper"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a.ptr_eq(b),
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::ByteArray(a), Value::ByteArray(b)) => a.ptr_eq(b),
            (Value::WordArray(a), Value::WordArray(b)) => a.ptr_eq(b),
            (Value::View(a), Value::View(b)) => a == b,
            (Value::Memory(a), Value::Memory(b)) => a.ptr_eq(b),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Promise(a), Value::Promise(b)) => a.ptr_eq(b),
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::File(a), Value::File(b)) => Arc::ptr_eq(a, b),
            (Value::Helper(a), Value::Helper(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
