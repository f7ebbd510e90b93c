//! Shared memory object manager
//!
//! The process-wide directory of live proxies plus the public surface:
//! allocate, register (resolving the cross-process create-vs-find race for
//! named objects), locate, import, the handle wrappers and shutdown.
//!
//! Named objects are discoverable by every attached process through the
//! shared named-object list; anonymous objects only ever appear in the
//! process-local directory, even when their data is shared-domain.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, MutexGuard};

use crate::error::{ShmError, ShmResult};
use crate::handles::{AccessRights, Handle, HandleTable};
use crate::object::record::{self, SharedObjectRecord};
use crate::object::{ObjectAttributes, ObjectDomain, ShmObject};
use crate::shmem::{list, ArenaGuard, InfoSlot, SharedArena, ShmPtr};
use crate::synch::SynchManager;
use crate::types::{self, ObjectTypeDescriptor, ObjectTypeId};

/// Maximum object name length, in bytes.
pub const MAX_OBJECT_NAME: usize = 256;

/// Type filter for lookups and handle dereferences.
pub enum AllowedTypes<'a> {
    Any,
    Only(&'a [ObjectTypeId]),
}

impl AllowedTypes<'_> {
    pub fn permits(&self, id: ObjectTypeId) -> bool {
        match self {
            AllowedTypes::Any => true,
            AllowedTypes::Only(ids) => ids.contains(&id),
        }
    }
}

/// How a `register_object` call resolved. Losing the named-object creation
/// race still produces a usable handle, so it is an outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created,
    AlreadyExists,
}

/// The two process-local object lists under one lock, which doubles as the
/// destruction lock serializing every check-and-unlink sequence.
pub(crate) struct LocalLists {
    inner: Mutex<Directory>,
}

pub(crate) struct Directory {
    pub(crate) named: Vec<Arc<ShmObject>>,
    pub(crate) anonymous: Vec<Arc<ShmObject>>,
}

impl LocalLists {
    pub(crate) fn new() -> Arc<LocalLists> {
        Arc::new(LocalLists {
            inner: Mutex::new(Directory {
                named: Vec::new(),
                anonymous: Vec::new(),
            }),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Directory> {
        self.inner.lock()
    }
}

impl Directory {
    pub(crate) fn find_named(&self, name: &str) -> Option<Arc<ShmObject>> {
        self.named
            .iter()
            .find(|obj| obj.name().as_deref() == Some(name))
            .cloned()
    }

    pub(crate) fn remove(&mut self, target: &ShmObject) -> Option<Arc<ShmObject>> {
        let target = target as *const ShmObject;
        if let Some(position) = self
            .named
            .iter()
            .position(|obj| core::ptr::eq(Arc::as_ptr(obj), target))
        {
            return Some(self.named.swap_remove(position));
        }
        if let Some(position) = self
            .anonymous
            .iter()
            .position(|obj| core::ptr::eq(Arc::as_ptr(obj), target))
        {
            return Some(self.anonymous.swap_remove(position));
        }
        None
    }
}

/// Process-wide object manager. One per attached process; independent
/// managers over one arena model independent processes.
pub struct ObjectManager {
    arena: Arc<SharedArena>,
    synch: Arc<SynchManager>,
    lists: Arc<LocalLists>,
    handles: HandleTable,
    process_id: u32,
}

impl ObjectManager {
    pub fn new(arena: Arc<SharedArena>, process_id: u32) -> ObjectManager {
        let attached = arena.lock().validate_root();
        debug_assert!(attached.is_ok(), "attached to an invalid arena");
        if let Err(err) = attached {
            log::error!("process {} attached to an invalid arena: {}", process_id, err);
        }
        let synch = SynchManager::new(arena.clone());
        ObjectManager {
            arena,
            synch,
            lists: LocalLists::new(),
            handles: HandleTable::new(),
            process_id,
        }
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn synch_manager(&self) -> &Arc<SynchManager> {
        &self.synch
    }

    /// Pure factory: builds and initializes a proxy. No list insertion
    /// happens until the object is registered.
    pub fn allocate_object(
        &self,
        ty: &'static ObjectTypeDescriptor,
        attrs: &ObjectAttributes,
    ) -> ShmResult<Arc<ShmObject>> {
        if let Some(name) = &attrs.name {
            if name.is_empty() || name.len() > MAX_OBJECT_NAME {
                return Err(ShmError::InvalidName);
            }
        }
        // Keep the registry able to resolve this type when another process
        // imports one of its records.
        types::register_type(ty);
        let obj = Arc::new(ShmObject::new(
            ty,
            self.arena.clone(),
            self.synch.clone(),
            self.lists.clone(),
            attrs,
        ));
        match obj.initialize() {
            Ok(()) => Ok(obj),
            Err(err) => {
                obj.abandon();
                Err(err)
            }
        }
    }

    /// Publishes an allocated object. Takes ownership of the caller's
    /// reference; on success the caller gets a handle plus a referenced
    /// object (the freshly created one, or the pre-existing same-named one
    /// with `AlreadyExists`). On failure the created object's reference is
    /// released exactly once and nothing stays reachable by any handle.
    pub fn register_object(
        &self,
        obj: Arc<ShmObject>,
        allowed: &AllowedTypes,
        rights: AccessRights,
    ) -> ShmResult<(Handle, Arc<ShmObject>, RegisterOutcome)> {
        let name = obj.name();
        let shared = obj.domain() == ObjectDomain::Shared;
        let mut shm = if shared { Some(self.arena.lock()) } else { None };

        let mut discarded: Option<Arc<ShmObject>> = None;
        let registered: Arc<ShmObject>;
        let outcome: RegisterOutcome;

        if let Some(name_str) = name.as_deref() {
            // Resolve the create-vs-find race while the arena lock pins the
            // shared named list. The directory lock stays held across the
            // add_reference so a racing last-release cannot tear the object
            // down between lookup and reference.
            let local_hit = {
                let directory = self.lists.lock();
                match directory.find_named(name_str) {
                    Some(local) => {
                        if allowed.permits(local.type_id()) {
                            local.add_reference();
                            Ok(Some(local))
                        } else {
                            Err(ShmError::TypeMismatch)
                        }
                    }
                    None => Ok(None),
                }
            };
            let found = match local_hit {
                Ok(None) => match shm.as_mut() {
                    Some(guard) => self.find_and_import_named(guard, name_str, allowed),
                    None => Ok(None),
                },
                other => other,
            };
            match found {
                Err(err) => {
                    let doomed = self.discard_unregistered(obj, shm.as_mut());
                    drop(shm);
                    drop(doomed);
                    return Err(err);
                }
                Ok(Some(existing)) => {
                    log::debug!(
                        "register of \"{}\" joined an existing object (process {})",
                        name_str,
                        self.process_id
                    );
                    discarded = Some(self.discard_unregistered(obj, shm.as_mut()));
                    registered = existing;
                    outcome = RegisterOutcome::AlreadyExists;
                }
                Ok(None) => {
                    if let Some(guard) = shm.as_mut() {
                        if let Err(err) = self.publish_named(guard, &obj) {
                            let doomed = self.discard_unregistered(obj, Some(guard));
                            drop(shm);
                            drop(doomed);
                            return Err(err);
                        }
                    }
                    self.lists.lock().named.push(obj.clone());
                    registered = obj;
                    outcome = RegisterOutcome::Created;
                }
            }
        } else {
            self.lists.lock().anonymous.push(obj.clone());
            registered = obj;
            outcome = RegisterOutcome::Created;
        }
        drop(shm);

        // The handle entry keeps its own reference.
        registered.add_reference();
        let handle = match self
            .handles
            .allocate(registered.clone(), rights, registered.inheritable())
        {
            Ok(handle) => handle,
            Err(err) => {
                registered.release_reference(); // the handle's reference
                registered.release_reference(); // the caller's reference
                drop(discarded);
                return Err(err);
            }
        };
        drop(discarded);
        Ok((handle, registered, outcome))
    }

    /// Two-tier name lookup: the process-local directory first (no arena
    /// lock), then the shared named-object list, importing a proxy when the
    /// record was created by another process.
    pub fn locate_object(&self, name: &str, allowed: &AllowedTypes) -> ShmResult<Arc<ShmObject>> {
        if name.is_empty() || name.len() > MAX_OBJECT_NAME {
            return Err(ShmError::InvalidName);
        }
        {
            // Held across the add_reference: see register_object.
            let directory = self.lists.lock();
            if let Some(local) = directory.find_named(name) {
                if !allowed.permits(local.type_id()) {
                    return Err(ShmError::TypeMismatch);
                }
                local.add_reference();
                return Ok(local);
            }
        }
        let mut shm = self.arena.lock();
        match self.find_and_import_named(&mut shm, name, allowed)? {
            Some(obj) => Ok(obj),
            None => Err(ShmError::NotFound),
        }
    }

    /// Reconstructs a proxy for a record found in the shared list and
    /// inserts it into the right process-local list. `add_ref` bumps the
    /// record's process reference count for the new proxy.
    pub fn import_shared_object(
        &self,
        shm: &mut ArenaGuard<'_>,
        record_ptr: ShmPtr,
        rec: &SharedObjectRecord,
        add_ref: bool,
    ) -> ShmResult<Arc<ShmObject>> {
        let ty = types::type_by_id(ObjectTypeId(rec.type_id))
            .ok_or(ShmError::Internal("record has an unregistered type id"))?;
        let obj = Arc::new(ShmObject::new(
            ty,
            self.arena.clone(),
            self.synch.clone(),
            self.lists.clone(),
            &ObjectAttributes::anonymous(),
        ));
        if add_ref {
            record::add_process_ref(shm, record_ptr)?;
        }
        if let Err(err) = obj.initialize_from_existing(shm, record_ptr, rec) {
            if add_ref {
                let _ = record::release_process_ref(shm, record_ptr);
            }
            obj.abandon();
            return Err(err);
        }
        let mut directory = self.lists.lock();
        if rec.is_named() {
            directory.named.push(obj.clone());
        } else {
            directory.anonymous.push(obj.clone());
        }
        drop(directory);
        log::debug!(
            "imported {} object into process {}",
            obj.object_type().name,
            self.process_id
        );
        Ok(obj)
    }

    /// Allocates a handle holding its own reference to `obj`.
    pub fn obtain_handle_for_object(
        &self,
        obj: &Arc<ShmObject>,
        rights: AccessRights,
    ) -> ShmResult<Handle> {
        obj.add_reference();
        match self.handles.allocate(obj.clone(), rights, obj.inheritable()) {
            Ok(handle) => Ok(handle),
            Err(err) => {
                obj.release_reference();
                Err(err)
            }
        }
    }

    /// Frees the handle and releases its reference, strictly after the
    /// handle-table lock is gone.
    pub fn revoke_handle(&self, handle: Handle) -> ShmResult<()> {
        let obj = self.handles.free(handle)?;
        obj.release_reference();
        Ok(())
    }

    /// Resolves a handle to a referenced object, enforcing the allowed-type
    /// set and the rights granted at handle creation.
    pub fn reference_object_by_handle(
        &self,
        handle: Handle,
        allowed: &AllowedTypes,
        required: AccessRights,
    ) -> ShmResult<Arc<ShmObject>> {
        let href = self.handles.get(handle)?;
        if !allowed.permits(href.object.type_id()) {
            return Err(ShmError::TypeMismatch);
        }
        if !href.granted.contains(required) {
            return Err(ShmError::InvalidHandle);
        }
        href.object.add_reference();
        Ok(href.object)
    }

    /// Batch handle resolution. The whole array resolves under one
    /// handle-table guard so the batch cannot straddle a concurrent revoke;
    /// references are only taken after the guard is released, and only once
    /// every handle has passed its checks.
    pub fn reference_objects_by_handle_array(
        &self,
        handles: &[Handle],
        allowed: &AllowedTypes,
        required: AccessRights,
    ) -> ShmResult<Vec<Arc<ShmObject>>> {
        let refs = self.handles.get_many(handles)?;
        for href in &refs {
            if !allowed.permits(href.object.type_id()) {
                return Err(ShmError::TypeMismatch);
            }
            if !href.granted.contains(required) {
                return Err(ShmError::InvalidHandle);
            }
        }
        Ok(refs
            .into_iter()
            .map(|href| {
                href.object.add_reference();
                href.object
            })
            .collect())
    }

    /// Cross-process handle duplication over an out-of-band channel.
    /// Declared for surface parity with the platform; not implemented in
    /// this variant.
    pub fn reference_object_by_foreign_handle(
        &self,
        _foreign_handle: u32,
    ) -> ShmResult<Arc<ShmObject>> {
        Err(ShmError::NotImplemented)
    }

    /// Force-teardown at process exit: drains the anonymous then the named
    /// list under both the destruction lock and the arena lock, running
    /// each object's cleanup exactly once and bypassing the reference-
    /// counted path.
    pub fn shutdown(&self) {
        let shm = self.arena.lock();
        let mut directory = self.lists.lock();
        let mut doomed: Vec<Arc<ShmObject>> = Vec::new();
        for obj in directory.anonymous.drain(..) {
            obj.cleanup_for_shutdown();
            doomed.push(obj);
        }
        for obj in directory.named.drain(..) {
            obj.cleanup_for_shutdown();
            doomed.push(obj);
        }
        drop(directory);
        drop(shm);
        doomed.clear();
        log::debug!("object manager for process {} shut down", self.process_id);
    }

    /// Releases the creator's sole reference to a never-registered object.
    /// Returns the proxy so the caller can drop it after its locks are
    /// released.
    fn discard_unregistered(
        &self,
        obj: Arc<ShmObject>,
        shm: Option<&mut ArenaGuard<'_>>,
    ) -> Arc<ShmObject> {
        obj.release_unregistered_reference(shm);
        obj
    }

    /// Walks the shared named list for an exact byte match and imports the
    /// record on a hit. Caller holds the arena lock.
    fn find_and_import_named(
        &self,
        shm: &mut ArenaGuard<'_>,
        name: &str,
        allowed: &AllowedTypes,
    ) -> ShmResult<Option<Arc<ShmObject>>> {
        let mut cursor = shm.info(InfoSlot::NamedObjects);
        while !cursor.is_null() {
            let rec: SharedObjectRecord = shm.read(cursor)?;
            if rec.name_len as usize == name.len() {
                let bytes = shm.bytes(rec.name, rec.name_len as usize)?;
                if bytes == name.as_bytes() {
                    if !allowed.permits(ObjectTypeId(rec.type_id)) {
                        return Err(ShmError::TypeMismatch);
                    }
                    return Ok(Some(self.import_shared_object(shm, cursor, &rec, true)?));
                }
            }
            cursor = rec.next;
        }
        Ok(None)
    }

    /// Splices a freshly created named object into the shared list and
    /// performs the deferred immutable publish.
    fn publish_named(&self, shm: &mut ArenaGuard<'_>, obj: &Arc<ShmObject>) -> ShmResult<()> {
        let record_ptr = obj.record();
        let head = shm.info(InfoSlot::NamedObjects);
        let new_head = list::push_front::<SharedObjectRecord>(shm, head, record_ptr)?;
        shm.set_info(InfoSlot::NamedObjects, new_head)?;
        let mut rec: SharedObjectRecord = shm.read(record_ptr)?;
        rec.set_in_named_list(true);
        shm.write(record_ptr, &rec)?;
        // Deferred from allocation: the creator may have written the local
        // immutable region between allocate_object and register_object.
        obj.publish_immutable(shm, &rec)
    }
}
