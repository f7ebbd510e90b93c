//! Synchronization manager
//!
//! Owns the wait/signal state of waitable objects. State lives either on the
//! local heap (process-local objects) or as a small record in the arena
//! (shared objects); promotion copies the live signal state into a freshly
//! allocated shared record. Actual thread blocking and wakeup belong to the
//! platform scheduler and are not part of this subsystem; the controllers
//! expose the state transitions only.

use alloc::sync::Arc;
use spin::{Mutex, MutexGuard};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{ShmError, ShmResult};
use crate::shmem::{ArenaGuard, SharedArena, ShmPtr};

/// Wait/signal state of one waitable object.
#[derive(Debug, Clone, Copy, Default, FromBytes, AsBytes, FromZeroes)]
#[repr(C)]
pub struct SynchState {
    /// Number of pending signals; nonzero means signaled.
    pub signal_count: u32,
    /// Owning process for mutex-style objects, 0 when unowned.
    pub owner_process: u32,
    /// Recursive acquisition depth of the owner.
    pub ownership_count: u32,
    /// Owner died without releasing.
    pub abandoned: u32,
}

/// Where the synch state of an object lives.
#[derive(Clone)]
pub enum SynchTarget {
    Local(Arc<Mutex<SynchState>>),
    Shared(ShmPtr),
}

impl SynchTarget {
    pub fn shared_ptr(&self) -> Option<ShmPtr> {
        match self {
            SynchTarget::Shared(ptr) => Some(*ptr),
            SynchTarget::Local(_) => None,
        }
    }
}

/// Per-process synchronization manager. Its process lock is the outermost
/// lock of the subsystem: waitable-object promotion takes it before the
/// arena lock, matching the manager's own internal ordering.
pub struct SynchManager {
    arena: Arc<SharedArena>,
    process_lock: Mutex<()>,
}

impl SynchManager {
    pub fn new(arena: Arc<SharedArena>) -> Arc<SynchManager> {
        Arc::new(SynchManager {
            arena,
            process_lock: Mutex::new(()),
        })
    }

    pub fn process_lock(&self) -> MutexGuard<'_, ()> {
        self.process_lock.lock()
    }

    /// Fresh synch data for a process-local object.
    pub fn alloc_local(&self) -> SynchTarget {
        SynchTarget::Local(Arc::new(Mutex::new(SynchState::default())))
    }

    /// Fresh synch data directly in shared form, for objects born shared.
    pub fn alloc_shared(&self, shm: &mut ArenaGuard<'_>) -> ShmResult<ShmPtr> {
        shm.alloc(core::mem::size_of::<SynchState>())
    }

    /// Promotes local synch data to a shared record, copying the live
    /// signal state. The local data is left untouched so a failed promotion
    /// is retryable.
    pub fn promote(&self, shm: &mut ArenaGuard<'_>, local: &SynchTarget) -> ShmResult<ShmPtr> {
        let state = match local {
            SynchTarget::Local(state) => *state.lock(),
            SynchTarget::Shared(_) => {
                return Err(ShmError::Internal("promoting already-shared synch data"))
            }
        };
        let ptr = self.alloc_shared(shm)?;
        shm.write(ptr, &state)?;
        Ok(ptr)
    }

    /// Releases synch data. Only the shared form owns arena storage.
    pub fn free(&self, shm: &mut ArenaGuard<'_>, target: &SynchTarget) {
        if let SynchTarget::Shared(ptr) = target {
            shm.free(*ptr);
        }
    }

    pub fn state_controller(&self, target: &SynchTarget) -> SynchStateController {
        SynchStateController {
            inner: ControllerInner {
                arena: self.arena.clone(),
                target: target.clone(),
            },
        }
    }

    pub fn wait_controller(&self, target: &SynchTarget) -> SynchWaitController {
        SynchWaitController {
            inner: ControllerInner {
                arena: self.arena.clone(),
                target: target.clone(),
            },
        }
    }
}

struct ControllerInner {
    arena: Arc<SharedArena>,
    target: SynchTarget,
}

impl ControllerInner {
    fn with_state<R>(&self, f: impl FnOnce(&mut SynchState) -> R) -> ShmResult<R> {
        match &self.target {
            SynchTarget::Local(state) => Ok(f(&mut state.lock())),
            SynchTarget::Shared(ptr) => {
                let mut shm = self.arena.lock();
                let mut state: SynchState = shm.read(*ptr)?;
                let result = f(&mut state);
                shm.write(*ptr, &state)?;
                Ok(result)
            }
        }
    }
}

/// Mutates the signal state of a waitable object.
pub struct SynchStateController {
    inner: ControllerInner,
}

impl SynchStateController {
    pub fn signal_count(&self) -> ShmResult<u32> {
        self.inner.with_state(|state| state.signal_count)
    }

    pub fn set_signal_count(&self, count: u32) -> ShmResult<()> {
        self.inner.with_state(|state| state.signal_count = count)
    }

    pub fn increment_signal_count(&self) -> ShmResult<u32> {
        self.inner.with_state(|state| {
            state.signal_count += 1;
            state.signal_count
        })
    }
}

/// Queries and consumes the signal state on behalf of a would-be waiter.
pub struct SynchWaitController {
    inner: ControllerInner,
}

impl SynchWaitController {
    pub fn is_signaled(&self) -> ShmResult<bool> {
        self.inner.with_state(|state| state.signal_count > 0)
    }

    /// Consumes one pending signal, if any.
    pub fn claim_signal(&self) -> ShmResult<bool> {
        self.inner.with_state(|state| {
            if state.signal_count > 0 {
                state.signal_count -= 1;
                true
            } else {
                false
            }
        })
    }

    /// Mutex-style acquisition: succeeds when unowned or re-entered by the
    /// current owner.
    pub fn try_acquire(&self, process: u32) -> ShmResult<bool> {
        self.inner.with_state(|state| {
            if state.owner_process == 0 || state.owner_process == process {
                state.owner_process = process;
                state.ownership_count += 1;
                true
            } else {
                false
            }
        })
    }

    /// Releases one level of ownership; returns false when `process` is not
    /// the owner.
    pub fn release_ownership(&self, process: u32) -> ShmResult<bool> {
        self.inner.with_state(|state| {
            if state.owner_process != process || state.ownership_count == 0 {
                return false;
            }
            state.ownership_count -= 1;
            if state.ownership_count == 0 {
                state.owner_process = 0;
            }
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promotion_copies_signal_state() {
        let arena = SharedArena::new();
        let mgr = SynchManager::new(arena.clone());
        let local = mgr.alloc_local();
        mgr.state_controller(&local).set_signal_count(3).unwrap();

        let mut shm = arena.lock();
        let ptr = mgr.promote(&mut shm, &local).unwrap();
        drop(shm);

        let shared = SynchTarget::Shared(ptr);
        assert_eq!(mgr.state_controller(&shared).signal_count().unwrap(), 3);
    }

    #[test]
    fn test_mutex_ownership_recursion() {
        let arena = SharedArena::new();
        let mgr = SynchManager::new(arena);
        let target = mgr.alloc_local();
        let waiter = mgr.wait_controller(&target);

        assert!(waiter.try_acquire(7).unwrap());
        assert!(waiter.try_acquire(7).unwrap());
        assert!(!waiter.try_acquire(9).unwrap());
        assert!(waiter.release_ownership(7).unwrap());
        assert!(!waiter.release_ownership(9).unwrap());
        assert!(waiter.release_ownership(7).unwrap());
        assert!(waiter.try_acquire(9).unwrap());
    }

    #[test]
    fn test_signal_claim() {
        let arena = SharedArena::new();
        let mgr = SynchManager::new(arena);
        let target = mgr.alloc_local();
        let state = mgr.state_controller(&target);
        let waiter = mgr.wait_controller(&target);

        assert!(!waiter.is_signaled().unwrap());
        state.increment_signal_count().unwrap();
        assert!(waiter.is_signaled().unwrap());
        assert!(waiter.claim_signal().unwrap());
        assert!(!waiter.claim_signal().unwrap());
    }
}
