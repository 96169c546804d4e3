//! String codec
//!
//! Marshals host text into module memory and module byte ranges back into
//! host strings. Encoding allocates through the module's own allocator;
//! decoding is strict, malformed UTF-8 fails the call rather than degrading
//! to replacement characters.
//!
//! The length of the most recent encode is published through a shared
//! register instead of a return value: the allocation call sites in the
//! import surface need both pointer and length, and the module allocator
//! only hands back a pointer.

use crate::engine::{ModuleAllocator, ModuleTrap};
use crate::memory::{MemoryAccessor, MemoryError};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

/// String marshalling failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("invalid utf-8 in module string at byte {valid_up_to}")]
    InvalidUtf8 { valid_up_to: usize },

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Trap(#[from] ModuleTrap),
}

/// Encoder/decoder state for one bridge instance.
pub struct StringCodec {
    /// Byte length of the most recent encode.
    last_len: AtomicU32,
}

impl StringCodec {
    pub fn new() -> Self {
        Self {
            last_len: AtomicU32::new(0),
        }
    }

    /// Byte length written by the most recent `encode*` call.
    pub fn last_encoded_len(&self) -> u32 {
        self.last_len.load(Ordering::Relaxed)
    }

    /// Encode `text` into a freshly allocated buffer sized exactly to the
    /// encoded byte length. One pass, no reallocation.
    pub fn encode_exact<A: ModuleAllocator + ?Sized>(
        &self,
        alloc: &A,
        memory: &MemoryAccessor,
        text: &str,
    ) -> Result<u32, CodecError> {
        let bytes = text.as_bytes();
        let ptr = alloc.malloc(bytes.len() as u32, 1)?;
        memory.write_bytes(ptr, bytes)?;
        self.last_len.store(bytes.len() as u32, Ordering::Relaxed);
        Ok(ptr)
    }

    /// Encode `text` with the optimistic growth strategy.
    ///
    /// Allocates one byte per character and copies the ASCII prefix
    /// directly. At the first character outside the ASCII range the buffer
    /// is grown to `offset + remaining_chars * 4` (a character encodes to at
    /// most four UTF-8 bytes) and the remainder written, then the buffer is
    /// shrunk to the exact final length.
    pub fn encode<A: ModuleAllocator + ?Sized>(
        &self,
        alloc: &A,
        memory: &MemoryAccessor,
        text: &str,
    ) -> Result<u32, CodecError> {
        let bytes = text.as_bytes();
        let char_count = text.chars().count() as u32;
        let mut ptr = alloc.malloc(char_count, 1)?;
        let mut capacity = char_count;

        let ascii_len = bytes
            .iter()
            .position(|b| !b.is_ascii())
            .unwrap_or(bytes.len());
        memory.write_bytes(ptr, &bytes[..ascii_len])?;
        let mut offset = ascii_len as u32;

        if ascii_len != bytes.len() {
            let rest = &text[ascii_len..];
            let remaining_chars = rest.chars().count() as u32;
            let grown = offset + remaining_chars * 4;
            ptr = alloc.realloc(ptr, capacity, grown, 1)?;
            capacity = grown;

            memory.write_bytes(ptr + offset, rest.as_bytes())?;
            offset += rest.len() as u32;

            ptr = alloc.realloc(ptr, capacity, offset, 1)?;
        }

        self.last_len.store(offset, Ordering::Relaxed);
        Ok(ptr)
    }

    /// Decode a module-owned byte range as text. Strict: malformed UTF-8 is
    /// a hard failure.
    pub fn decode(
        &self,
        memory: &MemoryAccessor,
        ptr: u32,
        len: u32,
    ) -> Result<String, CodecError> {
        let bytes = memory.read_bytes(ptr, len)?;
        String::from_utf8(bytes).map_err(|e| CodecError::InvalidUtf8 {
            valid_up_to: e.utf8_error().valid_up_to(),
        })
    }
}

impl Default for StringCodec {
    fn default() -> Self {
        Self::new()
    }
}
