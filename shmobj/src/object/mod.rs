//! Shared memory objects
//!
//! The per-process proxy wrapping one shared object instance. A proxy starts
//! in the process-local domain with a heap copy of its mutable data and can
//! be promoted to the shared domain exactly once, after which the data lives
//! in the arena and is visible to every attached process. The shared record
//! carries the cross-process reference count; the proxy carries the
//! per-process one.
//!
//! Teardown is two-phase: the reference-counted release path decrements the
//! shared record under the arena lock (unlinking it from the named list when
//! this was the last referencing process), and the final drop frees the
//! arena blobs outside the locks that protected the decrement.

pub mod record;
pub mod waitable;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use core::mem::size_of;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use spin::{Mutex, MutexGuard};
use zerocopy::FromZeroes;

use crate::error::{ShmError, ShmResult};
use crate::manager::LocalLists;
use crate::shmem::{list, ArenaGuard, InfoSlot, SharedArena, ShmPtr};
use crate::synch::{SynchManager, SynchTarget};
use crate::types::ObjectTypeDescriptor;
use record::SharedObjectRecord;

/// Visibility domain of a proxy. The transition is monotonic:
/// `ProcessLocal` → `Shared`, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectDomain {
    ProcessLocal = 0,
    Shared = 1,
}

/// Creation attributes. The platform's security descriptor is reduced to
/// the one bit this subsystem acts on: inheritable-handle intent.
#[derive(Debug, Clone, Default)]
pub struct ObjectAttributes {
    pub name: Option<String>,
    pub inheritable: bool,
}

impl ObjectAttributes {
    pub fn anonymous() -> ObjectAttributes {
        ObjectAttributes::default()
    }

    pub fn named(name: &str) -> ObjectAttributes {
        ObjectAttributes {
            name: Some(String::from(name)),
            inheritable: false,
        }
    }
}

/// Where the mutable "shared" data region currently lives. The slot is the
/// pointer whose identity changes exactly once, at promotion, and the mutex
/// around it is the promotion lock of the protocol.
pub enum SharedDataSlot {
    /// Type has no shared-data region.
    Unallocated,
    /// Process-local heap copy, pre-promotion.
    Local(Box<[u8]>),
    /// Mapped into the arena blob.
    Shared(ShmPtr),
}

/// Domain-matched lock over an object's shared-data region. Which lock this
/// actually is depends on the domain at acquisition time; the accessor
/// guarantees the two always agree.
pub enum SharedDataGuard<'a> {
    Local(MutexGuard<'a, SharedDataSlot>),
    Shared {
        shm: ArenaGuard<'a>,
        data: ShmPtr,
        len: usize,
    },
}

impl SharedDataGuard<'_> {
    pub fn bytes(&self) -> ShmResult<&[u8]> {
        match self {
            SharedDataGuard::Local(slot) => match &**slot {
                SharedDataSlot::Local(data) => Ok(data),
                _ => Ok(&[]),
            },
            SharedDataGuard::Shared { shm, data, len } => {
                if *len == 0 {
                    Ok(&[])
                } else {
                    shm.bytes(*data, *len)
                }
            }
        }
    }

    pub fn bytes_mut(&mut self) -> ShmResult<&mut [u8]> {
        match self {
            SharedDataGuard::Local(slot) => match &mut **slot {
                SharedDataSlot::Local(data) => Ok(data),
                _ => Ok(&mut []),
            },
            SharedDataGuard::Shared { shm, data, len } => {
                if *len == 0 {
                    Ok(&mut [])
                } else {
                    shm.bytes_mut(*data, *len)
                }
            }
        }
    }
}

fn zeroed(len: usize) -> Box<[u8]> {
    vec![0u8; len].into_boxed_slice()
}

/// Per-process proxy for one shared-memory object.
pub struct ShmObject {
    ty: &'static ObjectTypeDescriptor,
    arena: Arc<SharedArena>,
    synch_mgr: Arc<SynchManager>,
    lists: Arc<LocalLists>,
    name: Mutex<Option<String>>,
    inheritable: bool,
    domain: AtomicU8,
    /// Raw [`ShmPtr`] of the shared record; 0 until the object is shared.
    record_ptr: AtomicU32,
    shared_slot: Mutex<SharedDataSlot>,
    immutable: Mutex<Box<[u8]>>,
    local_data: Mutex<Box<[u8]>>,
    synch: Mutex<Option<SynchTarget>>,
    local_refs: AtomicU32,
    data_dereferenced: AtomicBool,
    delete_shared_on_drop: AtomicBool,
    cleanup_ran: AtomicBool,
}

impl ShmObject {
    pub(crate) fn new(
        ty: &'static ObjectTypeDescriptor,
        arena: Arc<SharedArena>,
        synch_mgr: Arc<SynchManager>,
        lists: Arc<LocalLists>,
        attrs: &ObjectAttributes,
    ) -> ShmObject {
        ShmObject {
            ty,
            arena,
            synch_mgr,
            lists,
            name: Mutex::new(attrs.name.clone()),
            inheritable: attrs.inheritable,
            domain: AtomicU8::new(ObjectDomain::ProcessLocal as u8),
            record_ptr: AtomicU32::new(0),
            shared_slot: Mutex::new(SharedDataSlot::Unallocated),
            immutable: Mutex::new(zeroed(ty.immutable_size)),
            local_data: Mutex::new(zeroed(ty.local_size)),
            synch: Mutex::new(None),
            local_refs: AtomicU32::new(1),
            data_dereferenced: AtomicBool::new(false),
            delete_shared_on_drop: AtomicBool::new(false),
            cleanup_ran: AtomicBool::new(false),
        }
    }

    pub fn object_type(&self) -> &'static ObjectTypeDescriptor {
        self.ty
    }

    pub fn type_id(&self) -> crate::types::ObjectTypeId {
        self.ty.id
    }

    pub fn domain(&self) -> ObjectDomain {
        if self.domain.load(Ordering::Acquire) == ObjectDomain::Shared as u8 {
            ObjectDomain::Shared
        } else {
            ObjectDomain::ProcessLocal
        }
    }

    pub fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    pub fn is_named(&self) -> bool {
        self.name.lock().is_some()
    }

    pub fn inheritable(&self) -> bool {
        self.inheritable
    }

    pub fn local_ref_count(&self) -> u32 {
        self.local_refs.load(Ordering::Acquire)
    }

    pub(crate) fn record(&self) -> ShmPtr {
        ShmPtr::from_raw(self.record_ptr.load(Ordering::Acquire))
    }

    /// Cross-process reference count of the backing record; 0 for an object
    /// that was never shared.
    pub fn process_ref_count(&self) -> ShmResult<i32> {
        if self.domain() != ObjectDomain::Shared {
            return Ok(0);
        }
        let shm = self.arena.lock();
        Ok(shm.read::<SharedObjectRecord>(self.record())?.process_refs)
    }

    /// The immutable-data region (local copy; published to the arena when
    /// the object is registered or promoted).
    pub fn immutable_data(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.immutable.lock()
    }

    /// The process-local data region; never leaves this process.
    pub fn local_data(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.local_data.lock()
    }

    /// Brand-new object setup. A named object allocates its shared
    /// structures immediately and starts in the shared domain; an anonymous
    /// one starts process-local with a zeroed heap copy of its shared-data
    /// region. On success exactly one of the two exists.
    pub(crate) fn initialize(&self) -> ShmResult<()> {
        if self.is_named() {
            let mut shm = self.arena.lock();
            let (record_ptr, mut rec) = self.allocate_shared_data_items(&mut shm)?;
            if self.ty.is_waitable() {
                match self.synch_mgr.alloc_shared(&mut shm) {
                    Ok(synch_ptr) => {
                        rec.synch = synch_ptr;
                        self.set_synch_target(SynchTarget::Shared(synch_ptr));
                    }
                    Err(err) => {
                        self.free_shared_data_areas(&mut shm, record_ptr, &rec);
                        return Err(err);
                    }
                }
            }
            if let Err(err) = shm.write(record_ptr, &rec) {
                self.free_shared_data_areas(&mut shm, record_ptr, &rec);
                return Err(err);
            }
            if self.ty.shared_size > 0 {
                *self.shared_slot.lock() = SharedDataSlot::Shared(rec.shared);
            }
            self.record_ptr.store(record_ptr.raw(), Ordering::Release);
            self.domain.store(ObjectDomain::Shared as u8, Ordering::Release);
        } else {
            if self.ty.shared_size > 0 {
                *self.shared_slot.lock() = SharedDataSlot::Local(zeroed(self.ty.shared_size));
            }
            if self.ty.is_waitable() {
                self.set_synch_target(self.synch_mgr.alloc_local());
            }
        }
        Ok(())
    }

    /// Reconstructs this proxy from a record another process created. The
    /// caller holds the arena lock and has already adjusted the record's
    /// process reference count.
    pub(crate) fn initialize_from_existing(
        &self,
        shm: &mut ArenaGuard<'_>,
        record_ptr: ShmPtr,
        rec: &SharedObjectRecord,
    ) -> ShmResult<()> {
        if rec.is_named() {
            let bytes = shm.bytes(rec.name, rec.name_len as usize)?;
            let name = core::str::from_utf8(bytes)
                .map_err(|_| ShmError::Internal("record name is not valid UTF-8"))?;
            let mut slot = self.name.lock();
            if let Some(supplied) = slot.as_deref() {
                debug_assert_eq!(supplied, name, "supplied name disagrees with the shared record");
            } else {
                *slot = Some(String::from(name));
            }
        }

        if self.ty.immutable_size > 0 {
            if rec.immutable.is_null() {
                return Err(ShmError::Internal("record is missing its immutable blob"));
            }
            let mut image = shm.bytes(rec.immutable, self.ty.immutable_size)?.to_vec();
            if let Some(copy) = self.ty.immutable_copy {
                copy(shm, &mut image)?;
            }
            self.immutable.lock().copy_from_slice(&image);
        }

        if self.ty.shared_size > 0 {
            if rec.shared.is_null() {
                return Err(ShmError::Internal("record is missing its shared blob"));
            }
            *self.shared_slot.lock() = SharedDataSlot::Shared(rec.shared);
        }

        if self.ty.is_waitable() {
            if rec.synch.is_null() {
                return Err(ShmError::Internal("waitable record is missing synch data"));
            }
            self.set_synch_target(SynchTarget::Shared(rec.synch));
        }

        self.record_ptr.store(record_ptr.raw(), Ordering::Release);
        self.domain.store(ObjectDomain::Shared as u8, Ordering::Release);

        if let Some(init) = self.ty.object_init {
            let immutable = self.immutable.lock();
            let mut local = self.local_data.lock();
            let immutable_bytes: &[u8] = &immutable;
            let local_bytes: &mut [u8] = &mut local;
            if self.ty.shared_size > 0 {
                let shared = shm.bytes_mut(rec.shared, self.ty.shared_size)?;
                init(self.ty, immutable_bytes, shared, local_bytes)?;
            } else {
                init(self.ty, immutable_bytes, &mut [], local_bytes)?;
            }
        }
        Ok(())
    }

    /// Allocates the shared record plus its name/immutable/shared blobs,
    /// all under the one guard. Unwinds every allocation made so far on any
    /// failure.
    pub(crate) fn allocate_shared_data_items(
        &self,
        shm: &mut ArenaGuard<'_>,
    ) -> ShmResult<(ShmPtr, SharedObjectRecord)> {
        let record_ptr = shm.alloc(size_of::<SharedObjectRecord>())?;
        let mut rec = SharedObjectRecord::new_zeroed();
        rec.process_refs = 1;
        rec.type_id = self.ty.id.0;

        let outcome = (|| -> ShmResult<()> {
            if let Some(name) = self.name.lock().as_ref() {
                rec.name = shm.alloc_bytes(name.as_bytes())?;
                rec.name_len = name.len() as u32;
            }
            if self.ty.immutable_size > 0 {
                rec.immutable = shm.alloc(self.ty.immutable_size)?;
            }
            if self.ty.shared_size > 0 {
                rec.shared = shm.alloc(self.ty.shared_size)?;
            }
            shm.write(record_ptr, &rec)
        })();

        match outcome {
            Ok(()) => Ok((record_ptr, rec)),
            Err(err) => {
                self.free_shared_data_areas(shm, record_ptr, &rec);
                Err(err)
            }
        }
    }

    /// Frees every arena blob belonging to `rec`, invoking the type's
    /// immutable-cleanup routine first so nested blobs are released too.
    pub(crate) fn free_shared_data_areas(
        &self,
        shm: &mut ArenaGuard<'_>,
        record_ptr: ShmPtr,
        rec: &SharedObjectRecord,
    ) {
        shm.free(rec.name);
        if !rec.immutable.is_null() {
            if let Some(cleanup) = self.ty.immutable_cleanup {
                if let Ok(bytes) = shm.bytes(rec.immutable, self.ty.immutable_size) {
                    let image = bytes.to_vec();
                    cleanup(shm, &image);
                }
            }
            shm.free(rec.immutable);
        }
        shm.free(rec.shared);
        if !rec.synch.is_null() {
            self.synch_mgr.free(shm, &SynchTarget::Shared(rec.synch));
        }
        shm.free(record_ptr);
    }

    /// Copies the proxy's immutable region into the record's blob, running
    /// the type's deep-copy routine on the image first.
    pub(crate) fn publish_immutable(
        &self,
        shm: &mut ArenaGuard<'_>,
        rec: &SharedObjectRecord,
    ) -> ShmResult<()> {
        if self.ty.immutable_size == 0 {
            return Ok(());
        }
        if rec.immutable.is_null() {
            return Err(ShmError::Internal("record is missing its immutable blob"));
        }
        let mut image = self.immutable.lock().to_vec();
        if let Some(copy) = self.ty.immutable_copy {
            copy(shm, &mut image)?;
        }
        shm.bytes_mut(rec.immutable, self.ty.immutable_size)?
            .copy_from_slice(&image);
        Ok(())
    }

    /// Fills a freshly allocated record from the local state and retargets
    /// the shared-data slot at the arena blob. The fallible copies come
    /// first; once the slot is retargeted nothing can fail, so no reader
    /// ever observes a half-promoted object.
    pub(crate) fn promote_shared_data(
        &self,
        shm: &mut ArenaGuard<'_>,
        record_ptr: ShmPtr,
        rec: &mut SharedObjectRecord,
        slot: &mut SharedDataSlot,
    ) -> ShmResult<()> {
        self.publish_immutable(shm, rec)?;
        if self.ty.shared_size > 0 {
            if let SharedDataSlot::Local(data) = &*slot {
                shm.bytes_mut(rec.shared, self.ty.shared_size)?
                    .copy_from_slice(data);
            }
        }
        shm.write(record_ptr, rec)?;
        if self.ty.shared_size > 0 {
            // Drops the local heap copy.
            *slot = SharedDataSlot::Shared(rec.shared);
        }
        self.record_ptr.store(record_ptr.raw(), Ordering::Release);
        Ok(())
    }

    /// Promotes a process-local object into the shared domain. Idempotent;
    /// a failure unwinds all shared allocations and leaves the object
    /// process-local and retryable. The domain flag is flipped only after
    /// the full promotion sequence, with the promotion lock held across the
    /// arena work so concurrent readers of the shared-data slot serialize
    /// against the pointer swap.
    pub fn ensure_shared(&self) -> ShmResult<()> {
        if self.domain() == ObjectDomain::Shared {
            return Ok(());
        }
        // Lock order: synch-manager process lock, promotion lock, arena.
        let _process_lock = if self.ty.is_waitable() {
            Some(self.synch_mgr.process_lock())
        } else {
            None
        };
        let mut slot = self.shared_slot.lock();
        if self.domain() == ObjectDomain::Shared {
            return Ok(());
        }
        let mut shm = self.arena.lock();
        let (record_ptr, mut rec) = self.allocate_shared_data_items(&mut shm)?;

        let mut promoted_synch = None;
        if self.ty.is_waitable() {
            match self.promote_synch(&mut shm) {
                Ok(synch_ptr) => {
                    rec.synch = synch_ptr;
                    promoted_synch = Some(synch_ptr);
                }
                Err(err) => {
                    self.free_shared_data_areas(&mut shm, record_ptr, &rec);
                    return Err(err);
                }
            }
        }
        if let Err(err) = self.promote_shared_data(&mut shm, record_ptr, &mut rec, &mut *slot) {
            self.free_shared_data_areas(&mut shm, record_ptr, &rec);
            return Err(err);
        }
        if let Some(synch_ptr) = promoted_synch {
            self.set_synch_target(SynchTarget::Shared(synch_ptr));
        }
        // Flip the domain while the promotion lock is still held: the next
        // thread through that lock must already observe it, or it would
        // promote a second time onto a fresh record.
        self.domain.store(ObjectDomain::Shared as u8, Ordering::Release);
        drop(shm);
        drop(slot);
        log::debug!("promoted {} object to shared domain", self.ty.name);
        Ok(())
    }

    /// Lock and pointer for the shared-data region, matched to the current
    /// domain. Double-checked: a reader that finds the object process-local
    /// takes the promotion lock and re-checks, so it can never hold a stale
    /// local lock over newly promoted data.
    pub fn shared_data(&self) -> ShmResult<SharedDataGuard<'_>> {
        if self.domain() == ObjectDomain::ProcessLocal {
            let slot = self.shared_slot.lock();
            // Re-check under the promotion lock: the object may have been
            // promoted between the domain check and the acquisition. If so,
            // release the local lock and take the arena-backed one instead.
            let promoted = matches!(&*slot, SharedDataSlot::Shared(_));
            if !promoted {
                return Ok(SharedDataGuard::Local(slot));
            }
            drop(slot);
        }
        let shm = self.arena.lock();
        let data = if self.ty.shared_size > 0 {
            shm.read::<SharedObjectRecord>(self.record())?.shared
        } else {
            ShmPtr::NULL
        };
        Ok(SharedDataGuard::Shared {
            shm,
            data,
            len: self.ty.shared_size,
        })
    }

    fn mark_dereferenced(&self) -> Option<bool> {
        if self.data_dereferenced.swap(true, Ordering::AcqRel) {
            // Caller bug, but it must stay a no-op: a second decrement here
            // would corrupt the cross-process count.
            log::error!("shared data dereferenced twice");
            Some(self.delete_shared_on_drop.load(Ordering::Acquire))
        } else {
            None
        }
    }

    fn deref_record(&self, shm: &mut ArenaGuard<'_>) -> bool {
        let record_ptr = self.record();
        match record::release_process_ref(shm, record_ptr) {
            Ok(0) => {
                let in_list = shm
                    .read::<SharedObjectRecord>(record_ptr)
                    .map(|rec| rec.in_named_list())
                    .unwrap_or(false);
                if in_list {
                    let head = shm.info(InfoSlot::NamedObjects);
                    match list::unlink::<SharedObjectRecord>(shm, head, record_ptr) {
                        Ok(new_head) => {
                            if shm.set_info(InfoSlot::NamedObjects, new_head).is_err() {
                                log::error!("failed to republish named-object list head");
                            }
                            if let Ok(mut rec) = shm.read::<SharedObjectRecord>(record_ptr) {
                                rec.set_in_named_list(false);
                                let _ = shm.write(record_ptr, &rec);
                            }
                        }
                        Err(err) => log::error!("failed to unlink named record: {}", err),
                    }
                }
                true
            }
            Ok(_) => false,
            Err(err) => {
                log::error!("shared record release failed: {}", err);
                false
            }
        }
    }

    /// Drops this process's claim on the shared record. Idempotent: a
    /// second call is a logic error but must not double-decrement. Returns
    /// whether this proxy is responsible for deleting the shared (or
    /// local) data at drop time.
    pub fn dereference_shared_data(&self) -> bool {
        if let Some(delete) = self.mark_dereferenced() {
            return delete;
        }
        let delete = if self.domain() == ObjectDomain::Shared {
            let mut shm = self.arena.lock();
            self.deref_record(&mut shm)
        } else {
            // Never shared: the heap copy is ours alone by definition.
            true
        };
        self.delete_shared_on_drop.store(delete, Ordering::Release);
        delete
    }

    /// Same as [`dereference_shared_data`](Self::dereference_shared_data)
    /// for callers already holding the arena lock.
    pub(crate) fn dereference_shared_data_locked(&self, shm: &mut ArenaGuard<'_>) -> bool {
        if let Some(delete) = self.mark_dereferenced() {
            return delete;
        }
        let delete = if self.domain() == ObjectDomain::Shared {
            self.deref_record(shm)
        } else {
            true
        };
        self.delete_shared_on_drop.store(delete, Ordering::Release);
        delete
    }

    pub fn add_reference(&self) -> u32 {
        let previous = self.local_refs.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "reviving an object with no references");
        previous + 1
    }

    /// Releases one per-process reference. The last release unlinks the
    /// proxy from the process-local directory and dereferences the shared
    /// record while both the arena lock (shared objects only) and the
    /// destruction lock are held; the blob free itself runs at drop time,
    /// after both are released.
    pub fn release_reference(&self) {
        let shared = self.domain() == ObjectDomain::Shared;
        let mut shm = if shared { Some(self.arena.lock()) } else { None };
        let mut directory = self.lists.lock();
        let previous = self.local_refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous >= 1, "reference count underflow");
        let removed = if previous == 1 {
            let removed = directory.remove(self);
            match shm.as_mut() {
                Some(shm) => {
                    self.dereference_shared_data_locked(shm);
                }
                None => {
                    self.dereference_shared_data();
                }
            }
            removed
        } else {
            None
        };
        drop(directory);
        drop(shm);
        // The final drop may re-acquire the arena lock to free blobs.
        drop(removed);
    }

    /// Releases the creator's sole reference to an object that was never
    /// registered (it sits in no list). The caller may already hold the
    /// arena lock and drops the proxy only after its locks are released.
    pub(crate) fn release_unregistered_reference(&self, shm: Option<&mut ArenaGuard<'_>>) {
        let previous = self.local_refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert_eq!(previous, 1, "unregistered object had extra references");
        match shm {
            Some(shm) => {
                self.dereference_shared_data_locked(shm);
            }
            None => {
                self.dereference_shared_data();
            }
        }
    }

    /// Force-teardown at process shutdown: runs the type cleanup routine
    /// and neutralizes the reference-counted path. Shared structures are
    /// deliberately left behind, as they would be on process death.
    pub(crate) fn cleanup_for_shutdown(&self) {
        if !self.cleanup_ran.swap(true, Ordering::AcqRel) {
            if let Some(cleanup) = self.ty.object_cleanup {
                cleanup(self, true, false);
            }
        }
        self.data_dereferenced.store(true, Ordering::Release);
        self.delete_shared_on_drop.store(false, Ordering::Release);
    }

    /// Neutralizes a proxy whose initialization failed partway; the
    /// initializer already unwound any shared allocations.
    pub(crate) fn abandon(&self) {
        self.data_dereferenced.store(true, Ordering::Release);
        self.delete_shared_on_drop.store(false, Ordering::Release);
        self.cleanup_ran.store(true, Ordering::Release);
    }
}

impl Drop for ShmObject {
    fn drop(&mut self) {
        if !self.data_dereferenced.load(Ordering::Acquire) {
            debug_assert!(false, "object dropped without dereferencing its shared data");
            self.dereference_shared_data();
        }
        if !self.cleanup_ran.swap(true, Ordering::AcqRel) {
            if let Some(cleanup) = self.ty.object_cleanup {
                cleanup(self, false, self.delete_shared_on_drop.load(Ordering::Acquire));
            }
        }
        if self.delete_shared_on_drop.load(Ordering::Acquire)
            && self.domain() == ObjectDomain::Shared
        {
            let record_ptr = self.record();
            let mut shm = self.arena.lock();
            match shm.read::<SharedObjectRecord>(record_ptr) {
                Ok(rec) => self.free_shared_data_areas(&mut shm, record_ptr, &rec),
                Err(err) => log::error!("shared record lost at teardown: {}", err),
            }
        }
        // A never-shared object's heap copies drop with the proxy.
    }
}
