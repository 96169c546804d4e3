//! Object heap table
//!
//! Host values referenced from module code live in a slot arena keyed by
//! small integer handles. Freed slots form a singly-linked free list encoded
//! in place: a freed slot stores the index of the next free slot, and
//! allocation pops the list head, growing the arena by one slot when the
//! list is empty.
//!
//! The first 128 slots are permanently reserved scratch; the next four are
//! the immutable sentinels undefined, null, true and false. Neither range is
//! ever handed out by `allocate` or returned to the free list.

use crate::value::Value;
use thiserror::Error;

/// Number of reserved scratch slots at the bottom of the table.
pub const RESERVED_SLOTS: u32 = 128;

/// First non-reserved slot index: scratch plus the four sentinels.
pub const FIRST_ALLOCATABLE: u32 = RESERVED_SLOTS + 4;

/// A handle to a host value, as module code sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u32);

impl Handle {
    pub const UNDEFINED: Handle = Handle(RESERVED_SLOTS);
    pub const NULL: Handle = Handle(RESERVED_SLOTS + 1);
    pub const TRUE: Handle = Handle(RESERVED_SLOTS + 2);
    pub const FALSE: Handle = Handle(RESERVED_SLOTS + 3);

    /// True for scratch and sentinel handles, which are never released.
    pub fn is_reserved(self) -> bool {
        self.0 < FIRST_ALLOCATABLE
    }
}

/// Heap protocol violations. These are programming errors on the module
/// side, surfaced as structured errors so they trap the offending call
/// instead of corrupting the table.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HeapError {
    #[error("unknown handle {0}")]
    UnknownHandle(u32),

    #[error("stale handle {0}: slot already released")]
    StaleHandle(u32),
}

enum Slot {
    Live(Value),
    Free(u32),
}

/// Slot arena mapping handles to host values.
pub struct ObjectHeap {
    slots: Vec<Slot>,
    free_head: u32,
}

impl ObjectHeap {
    pub fn new() -> Self {
        let mut slots: Vec<Slot> = (0..RESERVED_SLOTS)
            .map(|_| Slot::Live(Value::Undefined))
            .collect();
        slots.push(Slot::Live(Value::Undefined));
        slots.push(Slot::Live(Value::Null));
        slots.push(Slot::Live(Value::Bool(true)));
        slots.push(Slot::Live(Value::Bool(false)));
        Self {
            slots,
            free_head: FIRST_ALLOCATABLE,
        }
    }

    /// Store a value, returning its handle.
    ///
    /// Pops the free-list head, extending the table by one slot when the
    /// list is empty.
    pub fn allocate(&mut self, value: Value) -> Handle {
        if self.free_head as usize == self.slots.len() {
            self.slots.push(Slot::Free(self.slots.len() as u32 + 1));
        }
        let index = self.free_head;
        self.free_head = match self.slots[index as usize] {
            Slot::Free(next) => next,
            // The free list only links free slots.
            Slot::Live(_) => unreachable!("free list head points at a live slot"),
        };
        self.slots[index as usize] = Slot::Live(value);
        Handle(index)
    }

    /// Look up a handle without releasing it.
    pub fn get(&self, handle: Handle) -> Result<Value, HeapError> {
        match self.slots.get(handle.0 as usize) {
            Some(Slot::Live(value)) => Ok(value.clone()),
            Some(Slot::Free(_)) => Err(HeapError::StaleHandle(handle.0)),
            None => Err(HeapError::UnknownHandle(handle.0)),
        }
    }

    /// Look up and release in one step: the standard way to consume a
    /// handle passed as a call argument.
    pub fn take(&mut self, handle: Handle) -> Result<Value, HeapError> {
        let value = self.get(handle)?;
        self.drop_handle(handle)?;
        Ok(value)
    }

    /// Return a slot to the free list. No-op for reserved and sentinel
    /// handles. Releasing an already-free slot is a protocol violation.
    pub fn drop_handle(&mut self, handle: Handle) -> Result<(), HeapError> {
        if handle.is_reserved() {
            return Ok(());
        }
        match self.slots.get(handle.0 as usize) {
            Some(Slot::Live(_)) => {
                self.slots[handle.0 as usize] = Slot::Free(self.free_head);
                self.free_head = handle.0;
                Ok(())
            }
            Some(Slot::Free(_)) => Err(HeapError::StaleHandle(handle.0)),
            None => Err(HeapError::UnknownHandle(handle.0)),
        }
    }

    /// Duplicate a handle: same underlying value, independent slot. Both
    /// handles must be released independently.
    pub fn clone_handle(&mut self, handle: Handle) -> Result<Handle, HeapError> {
        let value = self.get(handle)?;
        Ok(self.allocate(value))
    }

    /// Number of live non-reserved slots. Used to verify that a completed
    /// call released everything it allocated.
    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .skip(FIRST_ALLOCATABLE as usize)
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }
}

impl Default for ObjectHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ObjectHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHeap")
            .field("slots", &self.slots.len())
            .field("live", &self.live_count())
            .finish()
    }
}
