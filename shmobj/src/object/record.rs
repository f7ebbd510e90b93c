//! The in-arena record backing every shared object instance.

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{ShmError, ShmResult};
use crate::shmem::{ArenaGuard, ShmListNode, ShmPtr};

/// Record is currently spliced into the shared named-object list.
pub const FLAG_IN_NAMED_LIST: u32 = 1 << 0;

/// Ground truth for one shared object: cross-process reference count, blob
/// locations and named-list linkage. Fixed `#[repr(C)]` layout of 32-bit
/// words so every attached process reads the same bytes.
#[derive(Debug, Clone, Copy, FromBytes, AsBytes, FromZeroes)]
#[repr(C)]
pub struct SharedObjectRecord {
    /// Named-object list links; anonymous records never join the list.
    pub prev: ShmPtr,
    pub next: ShmPtr,
    pub flags: u32,
    /// UTF-8 name blob; `name_len == 0` means anonymous.
    pub name: ShmPtr,
    pub name_len: u32,
    /// Immutable-data blob, written once at publish time.
    pub immutable: ShmPtr,
    /// Mutable data shared by every referencing process.
    pub shared: ShmPtr,
    /// Count of processes holding a live proxy for this record. Mutated
    /// only through [`add_process_ref`]/[`release_process_ref`].
    pub process_refs: i32,
    /// Resolves the type descriptor in each importing process.
    pub type_id: u32,
    /// Synchronization-manager data, waitable types only.
    pub synch: ShmPtr,
}

impl SharedObjectRecord {
    pub fn is_named(&self) -> bool {
        self.name_len > 0
    }

    pub fn in_named_list(&self) -> bool {
        self.flags & FLAG_IN_NAMED_LIST != 0
    }

    pub fn set_in_named_list(&mut self, in_list: bool) {
        if in_list {
            self.flags |= FLAG_IN_NAMED_LIST;
        } else {
            self.flags &= !FLAG_IN_NAMED_LIST;
        }
    }
}

impl ShmListNode for SharedObjectRecord {
    fn prev_link(&self) -> ShmPtr {
        self.prev
    }
    fn next_link(&self) -> ShmPtr {
        self.next
    }
    fn set_prev_link(&mut self, ptr: ShmPtr) {
        self.prev = ptr;
    }
    fn set_next_link(&mut self, ptr: ShmPtr) {
        self.next = ptr;
    }
}

/// Increments the process reference count. Requiring the arena guard makes
/// "count mutations happen under the global lock" a type-system fact.
pub fn add_process_ref(shm: &mut ArenaGuard<'_>, record_ptr: ShmPtr) -> ShmResult<i32> {
    let mut record: SharedObjectRecord = shm.read(record_ptr)?;
    record.process_refs += 1;
    shm.write(record_ptr, &record)?;
    Ok(record.process_refs)
}

/// Decrements the process reference count and returns the new value. The
/// caller that observes zero owns the unlink-and-free duty.
pub fn release_process_ref(shm: &mut ArenaGuard<'_>, record_ptr: ShmPtr) -> ShmResult<i32> {
    let mut record: SharedObjectRecord = shm.read(record_ptr)?;
    if record.process_refs <= 0 {
        return Err(ShmError::Internal("process reference count underflow"));
    }
    record.process_refs -= 1;
    shm.write(record_ptr, &record)?;
    Ok(record.process_refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shmem::SharedArena;
    use core::mem::size_of;
    use static_assertions::const_assert_eq;

    // Ten 32-bit words, no padding: the layout other processes rely on.
    const_assert_eq!(size_of::<SharedObjectRecord>(), 40);

    #[test]
    fn test_process_ref_accounting() {
        let arena = SharedArena::new();
        let mut shm = arena.lock();
        let ptr = shm.alloc(size_of::<SharedObjectRecord>()).unwrap();
        let mut record = SharedObjectRecord::new_zeroed();
        record.process_refs = 1;
        shm.write(ptr, &record).unwrap();

        assert_eq!(add_process_ref(&mut shm, ptr).unwrap(), 2);
        assert_eq!(release_process_ref(&mut shm, ptr).unwrap(), 1);
        assert_eq!(release_process_ref(&mut shm, ptr).unwrap(), 0);
        assert!(release_process_ref(&mut shm, ptr).is_err());
    }

    #[test]
    fn test_named_list_flag() {
        let mut record = SharedObjectRecord::new_zeroed();
        assert!(!record.in_named_list());
        record.set_in_named_list(true);
        assert!(record.in_named_list());
        record.set_in_named_list(false);
        assert!(!record.in_named_list());
    }
}
