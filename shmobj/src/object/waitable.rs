//! Waitable extension of the shared object proxy.
//!
//! Waitable types carry synchronization-manager state next to their data
//! regions. The proxy's synch target and the record's synch pointer must
//! stay in lockstep across every promotion; the promotion path in
//! `ensure_shared` takes the synch manager's process lock before the arena
//! lock for that reason.

use super::ShmObject;
use crate::error::{ShmError, ShmResult};
use crate::shmem::{ArenaGuard, ShmPtr};
use crate::synch::{SynchStateController, SynchTarget, SynchWaitController};

impl ShmObject {
    /// Controller mutating this object's signal state.
    pub fn state_controller(&self) -> ShmResult<SynchStateController> {
        match self.synch_target() {
            Some(target) => Ok(self.synch_mgr.state_controller(&target)),
            None => Err(ShmError::NotWaitable),
        }
    }

    /// Controller querying/consuming this object's signal state on behalf
    /// of a waiter.
    pub fn wait_controller(&self) -> ShmResult<SynchWaitController> {
        match self.synch_target() {
            Some(target) => Ok(self.synch_mgr.wait_controller(&target)),
            None => Err(ShmError::NotWaitable),
        }
    }

    pub(crate) fn synch_target(&self) -> Option<SynchTarget> {
        self.synch.lock().clone()
    }

    pub(crate) fn set_synch_target(&self, target: SynchTarget) {
        *self.synch.lock() = Some(target);
    }

    /// Promotes the local synch data to a shared record. The proxy slot is
    /// left untouched so the caller can defer the swap until its own
    /// promotion passes the point of no return.
    pub(crate) fn promote_synch(&self, shm: &mut ArenaGuard<'_>) -> ShmResult<ShmPtr> {
        match self.synch_target() {
            Some(target @ SynchTarget::Local(_)) => self.synch_mgr.promote(shm, &target),
            Some(SynchTarget::Shared(_)) => {
                Err(ShmError::Internal("synch data is already shared"))
            }
            None => Err(ShmError::Internal("waitable object without synch data")),
        }
    }
}
