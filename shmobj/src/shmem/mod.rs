//! Shared memory region primitives
//!
//! Relocatable-pointer arena plus the intrusive list helpers layered on it.

pub mod arena;
pub mod list;

pub use arena::{ArenaGuard, InfoSlot, SharedArena, ShmPtr, SEGMENT_SIZE};
pub use list::ShmListNode;
