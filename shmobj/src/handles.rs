//! Per-process handle table
//!
//! Maps opaque handle values to object references plus the rights granted at
//! allocation time. Slots are reused through a free list; a generation
//! counter in the handle value invalidates stale handles after reuse.
//!
//! The table lock is the innermost lock of the subsystem. Batch lookups
//! resolve every handle under one guard so a torn batch cannot observe a
//! concurrent revoke halfway; the guard is always released before any object
//! reference is released.

use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;

use crate::error::{ShmError, ShmResult};
use crate::object::ShmObject;

bitflags! {
    /// Access rights granted to a handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessRights: u32 {
        const READ        = 1 << 0;
        const WRITE       = 1 << 1;
        const SYNCHRONIZE = 1 << 2;
        const DELETE      = 1 << 3;
        const ALL = Self::READ.bits()
            | Self::WRITE.bits()
            | Self::SYNCHRONIZE.bits()
            | Self::DELETE.bits();
    }
}

/// Opaque handle value. Low 16 bits: slot index + 1; high 16 bits: slot
/// generation. Never zero, so 0 can serve as an invalid sentinel in FFI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    pub const fn raw(self) -> u32 {
        self.0
    }

    fn new(index: usize, generation: u16) -> Handle {
        Handle(((generation as u32) << 16) | (index as u32 + 1))
    }

    fn index(self) -> Option<usize> {
        let low = self.0 & 0xFFFF;
        if low == 0 {
            None
        } else {
            Some(low as usize - 1)
        }
    }

    fn generation(self) -> u16 {
        (self.0 >> 16) as u16
    }
}

/// A resolved handle: the object plus the rights it was opened with.
pub struct HandleRef {
    pub object: Arc<ShmObject>,
    pub granted: AccessRights,
    pub inheritable: bool,
}

struct Entry {
    object: Arc<ShmObject>,
    granted: AccessRights,
    inheritable: bool,
}

struct Slot {
    generation: u16,
    entry: Option<Entry>,
}

struct TableState {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

const MAX_HANDLES: usize = 0xFFFF;

pub struct HandleTable {
    state: Mutex<TableState>,
}

impl HandleTable {
    pub fn new() -> HandleTable {
        HandleTable {
            state: Mutex::new(TableState {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Allocates a handle for `object`. The caller is responsible for the
    /// object reference the entry keeps alive.
    pub fn allocate(
        &self,
        object: Arc<ShmObject>,
        granted: AccessRights,
        inheritable: bool,
    ) -> ShmResult<Handle> {
        let mut table = self.state.lock();
        let entry = Entry {
            object,
            granted,
            inheritable,
        };
        if let Some(index) = table.free.pop() {
            let slot = &mut table.slots[index];
            debug_assert!(slot.entry.is_none());
            slot.entry = Some(entry);
            return Ok(Handle::new(index, slot.generation));
        }
        if table.slots.len() >= MAX_HANDLES {
            log::warn!("handle table full ({} slots)", table.slots.len());
            return Err(ShmError::OutOfMemory);
        }
        table.slots.push(Slot {
            generation: 1,
            entry: Some(entry),
        });
        Ok(Handle::new(table.slots.len() - 1, 1))
    }

    /// Frees a handle, bumping the slot generation so the old value goes
    /// stale. Returns the object so the caller can release its reference
    /// after this table lock is gone.
    pub fn free(&self, handle: Handle) -> ShmResult<Arc<ShmObject>> {
        let mut table = self.state.lock();
        let index = handle.index().ok_or(ShmError::InvalidHandle)?;
        let slot = table.slots.get_mut(index).ok_or(ShmError::InvalidHandle)?;
        if slot.generation != handle.generation() {
            return Err(ShmError::InvalidHandle);
        }
        let entry = slot.entry.take().ok_or(ShmError::InvalidHandle)?;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        table.free.push(index);
        Ok(entry.object)
    }

    pub fn get(&self, handle: Handle) -> ShmResult<HandleRef> {
        let table = self.state.lock();
        Self::lookup(&table, handle)
    }

    /// Resolves a whole handle array under one guard.
    pub fn get_many(&self, handles: &[Handle]) -> ShmResult<Vec<HandleRef>> {
        let table = self.state.lock();
        let mut refs = Vec::with_capacity(handles.len());
        for &handle in handles {
            refs.push(Self::lookup(&table, handle)?);
        }
        Ok(refs)
    }

    fn lookup(table: &TableState, handle: Handle) -> ShmResult<HandleRef> {
        let index = handle.index().ok_or(ShmError::InvalidHandle)?;
        let slot = table.slots.get(index).ok_or(ShmError::InvalidHandle)?;
        if slot.generation != handle.generation() {
            return Err(ShmError::InvalidHandle);
        }
        let entry = slot.entry.as_ref().ok_or(ShmError::InvalidHandle)?;
        Ok(HandleRef {
            object: entry.object.clone(),
            granted: entry.granted,
            inheritable: entry.inheritable,
        })
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        HandleTable::new()
    }
}
