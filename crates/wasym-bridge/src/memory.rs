//! Linear memory and typed access
//!
//! The module owns a single contiguous, growable byte buffer. Host code never
//! holds raw slices across calls into the module: the buffer can reallocate on
//! growth, so every read and write re-resolves against the live buffer. The
//! generation counter records reallocations for diagnostics and tests.

use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors raised by linear memory access
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MemoryError {
    #[error("memory access out of bounds: ptr={ptr} len={len} size={size}")]
    OutOfBounds { ptr: u32, len: u32, size: usize },

    #[error("misaligned word access at address {addr}")]
    Misaligned { addr: u32 },
}

/// The module's linear memory: one growable contiguous byte buffer.
///
/// Growing may reallocate the underlying storage. Each growth bumps the
/// generation counter, which is how callers can detect that any previously
/// derived view would have gone stale.
#[derive(Debug)]
pub struct LinearMemory {
    bytes: Vec<u8>,
    generation: u64,
}

impl LinearMemory {
    /// Create a memory of `initial_size` zeroed bytes.
    pub fn new(initial_size: usize) -> Self {
        Self {
            bytes: vec![0; initial_size],
            generation: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of reallocations so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Grow the memory by `additional` zeroed bytes.
    ///
    /// Invalidates every previously derived view (generation bump).
    pub fn grow(&mut self, additional: usize) {
        self.bytes.resize(self.bytes.len() + additional, 0);
        self.generation += 1;
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// Shared handle to a module's linear memory.
///
/// All clones refer to the same buffer. Access goes through `with` and
/// `with_mut` so no borrow outlives a call back into the module.
#[derive(Clone)]
pub struct SharedMemory(Arc<Mutex<LinearMemory>>);

impl SharedMemory {
    pub fn new(memory: LinearMemory) -> Self {
        SharedMemory(Arc::new(Mutex::new(memory)))
    }

    /// Acquire the lock and apply a read function.
    pub fn with<R>(&self, f: impl FnOnce(&LinearMemory) -> R) -> R {
        let guard = self.0.lock().expect("linear memory lock poisoned");
        f(&guard)
    }

    /// Acquire the lock and apply a mutation function.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut LinearMemory) -> R) -> R {
        let mut guard = self.0.lock().expect("linear memory lock poisoned");
        f(&mut guard)
    }

    pub fn len(&self) -> usize {
        self.with(|m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn generation(&self) -> u64 {
        self.with(|m| m.generation())
    }

    /// True if both handles refer to the same buffer.
    pub fn ptr_eq(&self, other: &SharedMemory) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedMemory({} bytes)", self.len())
    }
}

/// Byte- and 32-bit-word-addressed access over a module's linear memory.
///
/// Every operation locks and re-slices the live buffer, so growth between two
/// accesses is always observed. Words are little-endian and must be 4-aligned.
#[derive(Clone)]
pub struct MemoryAccessor {
    memory: SharedMemory,
}

impl MemoryAccessor {
    pub fn new(memory: SharedMemory) -> Self {
        Self { memory }
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    fn check_span(ptr: u32, len: u32, size: usize) -> Result<(), MemoryError> {
        let end = ptr as u64 + len as u64;
        if end > size as u64 {
            return Err(MemoryError::OutOfBounds { ptr, len, size });
        }
        Ok(())
    }

    /// Copy `len` bytes starting at `ptr` out of the module memory.
    pub fn read_bytes(&self, ptr: u32, len: u32) -> Result<Vec<u8>, MemoryError> {
        self.memory.with(|m| {
            Self::check_span(ptr, len, m.len())?;
            let start = ptr as usize;
            Ok(m.bytes()[start..start + len as usize].to_vec())
        })
    }

    /// Copy `data` into the module memory at `ptr`.
    pub fn write_bytes(&self, ptr: u32, data: &[u8]) -> Result<(), MemoryError> {
        self.memory.with_mut(|m| {
            Self::check_span(ptr, data.len() as u32, m.len())?;
            let start = ptr as usize;
            m.bytes_mut()[start..start + data.len()].copy_from_slice(data);
            Ok(())
        })
    }

    /// Read a 32-bit word at byte address `addr` (4-aligned).
    pub fn read_word(&self, addr: u32) -> Result<u32, MemoryError> {
        if addr % 4 != 0 {
            return Err(MemoryError::Misaligned { addr });
        }
        let bytes = self.read_bytes(addr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Write a 32-bit word at byte address `addr` (4-aligned).
    pub fn write_word(&self, addr: u32, value: u32) -> Result<(), MemoryError> {
        if addr % 4 != 0 {
            return Err(MemoryError::Misaligned { addr });
        }
        self.write_bytes(addr, &value.to_le_bytes())
    }
}

/// Element width of a `MemoryView`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    /// 8-bit elements
    Byte,
    /// 32-bit little-endian elements
    Word,
}

impl ViewKind {
    pub fn elem_size(self) -> u32 {
        match self {
            ViewKind::Byte => 1,
            ViewKind::Word => 4,
        }
    }
}

/// A typed view over a span of module memory: (memory, byte offset, element
/// count). Views never copy; they re-resolve the live buffer on every access,
/// so a view constructed before a growth reads the grown buffer afterwards.
/// Bounds are validated at construction and again on each access.
#[derive(Clone)]
pub struct MemoryView {
    memory: SharedMemory,
    kind: ViewKind,
    byte_offset: u32,
    len: u32,
}

impl MemoryView {
    /// Create a view of `len` elements starting at `byte_offset`.
    pub fn new(
        memory: SharedMemory,
        kind: ViewKind,
        byte_offset: u32,
        len: u32,
    ) -> Result<Self, MemoryError> {
        if kind == ViewKind::Word && byte_offset % 4 != 0 {
            return Err(MemoryError::Misaligned { addr: byte_offset });
        }
        let view = Self {
            memory,
            kind,
            byte_offset,
            len,
        };
        view.check_bounds()?;
        Ok(view)
    }

    fn check_bounds(&self) -> Result<(), MemoryError> {
        let size = self.memory.len();
        let span = self.len as u64 * self.kind.elem_size() as u64;
        if self.byte_offset as u64 + span > size as u64 {
            return Err(MemoryError::OutOfBounds {
                ptr: self.byte_offset,
                len: self.byte_len(),
                size,
            });
        }
        Ok(())
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub fn byte_offset(&self) -> u32 {
        self.byte_offset
    }

    /// Element count.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_len(&self) -> u32 {
        self.len * self.kind.elem_size()
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    /// Copy the viewed bytes out of the live buffer.
    pub fn snapshot_bytes(&self) -> Result<Vec<u8>, MemoryError> {
        self.memory.with(|m| {
            self.check_bounds()?;
            let start = self.byte_offset as usize;
            Ok(m.bytes()[start..start + self.byte_len() as usize].to_vec())
        })
    }

    /// Copy the viewed elements out as 32-bit words. Word views only.
    pub fn snapshot_words(&self) -> Result<Vec<u32>, MemoryError> {
        debug_assert_eq!(self.kind, ViewKind::Word);
        let bytes = self.snapshot_bytes()?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Apply a mutation function to the viewed bytes of the live buffer.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, MemoryError> {
        self.memory.with_mut(|m| {
            self.check_bounds()?;
            let start = self.byte_offset as usize;
            let end = start + self.byte_len() as usize;
            Ok(f(&mut m.bytes_mut()[start..end]))
        })
    }
}

impl std::fmt::Debug for MemoryView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MemoryView({:?} offset={} len={})",
            self.kind, self.byte_offset, self.len
        )
    }
}

impl PartialEq for MemoryView {
    fn eq(&self, other: &Self) -> bool {
        self.memory.ptr_eq(&other.memory)
            && self.kind == other.kind
            && self.byte_offset == other.byte_offset
            && self.len == other.len
    }
}
