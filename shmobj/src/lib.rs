//! # Shared Memory Object Manager
//!
//! Cross-process management of kernel-object-like entities (mutexes,
//! events, generic waitable objects) built on a raw shared-memory arena
//! instead of native kernel objects: atomic cross-process reference
//! counting, race-safe promotion of process-local objects into shared ones,
//! a named-object directory kept as a linked list *inside* shared memory
//! (relocatable pointers only), and a two-phase allocate-then-publish
//! protocol that stays consistent under concurrent access from multiple
//! processes.
//!
//! ## Architecture
//!
//! - [`shmem`]: the arena — relocatable pointers, size-class allocation,
//!   the single global lock and the persisted root slots.
//! - [`types`]: static object type descriptors and the process-local
//!   registry resolving them from record type ids.
//! - [`object`]: the per-process proxy and its shared record; domain
//!   promotion, reference counting, teardown.
//! - [`synch`]: synchronization-manager collaborator holding wait/signal
//!   state (no blocking machinery).
//! - [`handles`]: the per-process handle table.
//! - [`manager`]: the process-wide directory and public surface.
//!
//! Simulated processes are independent [`manager::ObjectManager`] instances
//! attached to one [`shmem::SharedArena`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod handles;
pub mod manager;
pub mod object;
pub mod shmem;
pub mod synch;
pub mod types;

pub use error::{ShmError, ShmResult};
pub use handles::{AccessRights, Handle, HandleTable};
pub use manager::{AllowedTypes, ObjectManager, RegisterOutcome, MAX_OBJECT_NAME};
pub use object::{ObjectAttributes, ObjectDomain, SharedDataGuard, ShmObject};
pub use shmem::{SharedArena, ShmPtr};
pub use synch::{SynchManager, SynchStateController, SynchWaitController};
pub use types::{ObjectTypeDescriptor, ObjectTypeId, SynchSupport};
