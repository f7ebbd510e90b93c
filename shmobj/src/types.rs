//! Object type descriptors
//!
//! Every shared-memory object belongs to a statically described type: the
//! sizes of its three data regions (immutable, shared, process-local),
//! whether it supports wait/signal semantics, and the optional routines the
//! lifecycle invokes on its behalf. Records in the arena store only the
//! numeric type id; routines are always resolved through the process-local
//! registry, never stored in shared memory (code pointers do not survive a
//! process boundary).

use alloc::collections::BTreeMap;
use spin::RwLock;

use crate::error::ShmResult;
use crate::object::ShmObject;
use crate::shmem::ArenaGuard;

/// Numeric identifier of an object type, stable across processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectTypeId(pub u32);

/// Whether instances can back wait/signal operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynchSupport {
    None,
    Waitable,
}

/// Deep-copies an immutable-data image across a process boundary. The image
/// is a scratch copy; the routine may fix up nested relocatable pointers and
/// allocate further arena blobs through the guard.
pub type ImmutableCopyRoutine = fn(&mut ArenaGuard<'_>, &mut [u8]) -> ShmResult<()>;

/// Releases arena blobs nested inside an immutable-data image.
pub type ImmutableCleanupRoutine = fn(&mut ArenaGuard<'_>, &[u8]);

/// Invoked when a proxy is reconstructed from an existing shared record,
/// with the (immutable, shared, process-local) regions.
pub type ObjectInitRoutine =
    fn(&ObjectTypeDescriptor, &[u8], &mut [u8], &mut [u8]) -> ShmResult<()>;

/// Invoked once per proxy at teardown. Arguments: the object, whether this
/// is a process-shutdown force-teardown, and whether shared state is being
/// deleted with it.
pub type ObjectCleanupRoutine = fn(&ShmObject, bool, bool);

/// Static description of an object type.
pub struct ObjectTypeDescriptor {
    pub id: ObjectTypeId,
    pub name: &'static str,
    /// Copied into shared memory when the object is published, immutable
    /// afterwards.
    pub immutable_size: usize,
    /// Mutable state shared by every process referencing the object.
    pub shared_size: usize,
    /// Per-process state, never leaves the local heap.
    pub local_size: usize,
    pub synch: SynchSupport,
    pub immutable_copy: Option<ImmutableCopyRoutine>,
    pub immutable_cleanup: Option<ImmutableCleanupRoutine>,
    pub object_init: Option<ObjectInitRoutine>,
    pub object_cleanup: Option<ObjectCleanupRoutine>,
}

impl ObjectTypeDescriptor {
    /// A descriptor with all sizes zero and no routines.
    pub const fn plain(id: ObjectTypeId, name: &'static str) -> ObjectTypeDescriptor {
        ObjectTypeDescriptor {
            id,
            name,
            immutable_size: 0,
            shared_size: 0,
            local_size: 0,
            synch: SynchSupport::None,
            immutable_copy: None,
            immutable_cleanup: None,
            object_init: None,
            object_cleanup: None,
        }
    }

    pub fn is_waitable(&self) -> bool {
        self.synch == SynchSupport::Waitable
    }
}

static REGISTRY: RwLock<BTreeMap<u32, &'static ObjectTypeDescriptor>> =
    RwLock::new(BTreeMap::new());

/// Registers a type descriptor. Re-registering the same descriptor is a
/// no-op; registering a different descriptor under a taken id is a logic
/// error.
pub fn register_type(descriptor: &'static ObjectTypeDescriptor) {
    let mut registry = REGISTRY.write();
    if let Some(existing) = registry.get(&descriptor.id.0) {
        debug_assert!(
            core::ptr::eq(*existing, descriptor),
            "conflicting descriptor for object type id {}",
            descriptor.id.0
        );
        return;
    }
    registry.insert(descriptor.id.0, descriptor);
}

/// Reverse lookup used when importing a record created by another process.
pub fn type_by_id(id: ObjectTypeId) -> Option<&'static ObjectTypeDescriptor> {
    REGISTRY.read().get(&id.0).copied()
}

/// Built-in waitable types, mirrored from the platform's Win32-style object
/// set. State lives entirely in synchronization data (mutex) or in a small
/// immutable flag block (event).
pub mod builtin {
    use super::*;

    /// Named/anonymous mutex. Ownership and recursion live in synch data.
    pub static MUTEX: ObjectTypeDescriptor = ObjectTypeDescriptor {
        id: ObjectTypeId(1),
        name: "mutex",
        immutable_size: 0,
        shared_size: 0,
        local_size: 0,
        synch: SynchSupport::Waitable,
        immutable_copy: None,
        immutable_cleanup: None,
        object_init: None,
        object_cleanup: None,
    };

    /// Manual- or auto-reset event; the reset behavior is fixed at creation
    /// and published with the immutable region.
    pub static EVENT: ObjectTypeDescriptor = ObjectTypeDescriptor {
        id: ObjectTypeId(2),
        name: "event",
        immutable_size: 4,
        shared_size: 0,
        local_size: 0,
        synch: SynchSupport::Waitable,
        immutable_copy: None,
        immutable_cleanup: None,
        object_init: None,
        object_cleanup: None,
    };

    /// Reads the manual-reset flag out of an event's immutable region.
    pub fn event_is_manual_reset(immutable: &[u8]) -> bool {
        immutable.first().copied().unwrap_or(0) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static TEST_TYPE: ObjectTypeDescriptor =
        ObjectTypeDescriptor::plain(ObjectTypeId(900), "registry-test");

    #[test]
    fn test_registry_round_trip() {
        register_type(&TEST_TYPE);
        register_type(&TEST_TYPE);
        let found = type_by_id(ObjectTypeId(900)).unwrap();
        assert_eq!(found.name, "registry-test");
        assert!(type_by_id(ObjectTypeId(901)).is_none());
    }

    #[test]
    fn test_builtin_shapes() {
        assert!(builtin::MUTEX.is_waitable());
        assert_eq!(builtin::EVENT.immutable_size, 4);
        assert!(builtin::event_is_manual_reset(&[1, 0, 0, 0]));
        assert!(!builtin::event_is_manual_reset(&[0, 0, 0, 0]));
    }
}
