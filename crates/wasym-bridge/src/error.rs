//! Unified error type for the public surface
//!
//! Component errors (codec, heap, memory, traps) are converted into
//! `BridgeError` at the entry points and the lifecycle manager. Inside the
//! import surface the two-step catch-and-stash protocol applies instead;
//! see `imports`.

use crate::codec::CodecError;
use crate::engine::{CompileError, ModuleTrap};
use crate::heap::HeapError;
use crate::memory::MemoryError;
use thiserror::Error;

/// Errors surfaced to callers of the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Trap(#[from] ModuleTrap),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Heap(#[from] HeapError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("failed to fetch module artifact: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("failed to read module stream: {0}")]
    Stream(#[from] std::io::Error),

    #[error("no module source configured and no artifact base to derive one from")]
    NoSource,

    #[error("bridge is not initialized")]
    NotInitialized,

    #[error("module call rejected: {0}")]
    Rejected(String),

    #[error("bridge stalled: {0}")]
    Stalled(String),

    #[error("unexpected result shape: {0}")]
    UnexpectedShape(String),
}
