//! Cross-"process" scenarios: independent managers attached to one arena
//! model independent processes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use exo_shmobj::types::builtin;
use exo_shmobj::{
    AccessRights, AllowedTypes, ObjectAttributes, ObjectDomain, ObjectManager,
    ObjectTypeDescriptor, ObjectTypeId, RegisterOutcome, SharedArena, ShmError, SynchSupport,
};

/// Plain data object: 16-byte immutable region, 64-byte shared region.
static BLOCK: ObjectTypeDescriptor = ObjectTypeDescriptor {
    id: ObjectTypeId(40),
    name: "block",
    immutable_size: 16,
    shared_size: 64,
    local_size: 8,
    synch: SynchSupport::None,
    immutable_copy: None,
    immutable_cleanup: None,
    object_init: None,
    object_cleanup: None,
};

static SHUTDOWN_CLEANUPS: AtomicUsize = AtomicUsize::new(0);

fn count_shutdown_cleanup(_obj: &exo_shmobj::ShmObject, is_shutdown: bool, _delete_shared: bool) {
    if is_shutdown {
        SHUTDOWN_CLEANUPS.fetch_add(1, Ordering::SeqCst);
    }
}

/// Only the shutdown test uses this type, so its counter stays isolated.
static COUNTED: ObjectTypeDescriptor = ObjectTypeDescriptor {
    id: ObjectTypeId(41),
    name: "counted",
    immutable_size: 0,
    shared_size: 8,
    local_size: 0,
    synch: SynchSupport::None,
    immutable_copy: None,
    immutable_cleanup: None,
    object_init: None,
    object_cleanup: Some(count_shutdown_cleanup),
};

#[test]
fn test_unnamed_object_starts_process_local_and_zeroed() {
    // Scenario A.
    let arena = SharedArena::new();
    let mgr = ObjectManager::new(arena, 1);
    let obj = mgr
        .allocate_object(&BLOCK, &ObjectAttributes::anonymous())
        .unwrap();
    assert_eq!(obj.domain(), ObjectDomain::ProcessLocal);
    {
        let guard = obj.shared_data().unwrap();
        let bytes = guard.bytes().unwrap();
        assert_eq!(bytes.len(), 64);
        assert!(bytes.iter().all(|&b| b == 0));
    }
    obj.release_reference();
}

#[test]
fn test_named_object_is_shared_immediately_and_locate_reuses_proxy() {
    // Scenario B.
    let arena = SharedArena::new();
    let mgr = ObjectManager::new(arena, 1);
    let obj = mgr
        .allocate_object(&BLOCK, &ObjectAttributes::named("Foo"))
        .unwrap();
    assert_eq!(obj.domain(), ObjectDomain::Shared);

    let (handle, registered, outcome) = mgr
        .register_object(obj.clone(), &AllowedTypes::Any, AccessRights::ALL)
        .unwrap();
    assert_eq!(outcome, RegisterOutcome::Created);
    assert!(Arc::ptr_eq(&obj, &registered));
    let refs_before = registered.local_ref_count();

    let located = mgr.locate_object("Foo", &AllowedTypes::Any).unwrap();
    assert!(Arc::ptr_eq(&located, &registered));
    assert_eq!(located.local_ref_count(), refs_before + 1);

    located.release_reference();
    mgr.revoke_handle(handle).unwrap();
    registered.release_reference();
}

#[test]
fn test_promotion_preserves_shared_data() {
    // Scenario C.
    let arena = SharedArena::new();
    let mgr = ObjectManager::new(arena, 1);
    let obj = mgr
        .allocate_object(&BLOCK, &ObjectAttributes::anonymous())
        .unwrap();
    {
        let mut guard = obj.shared_data().unwrap();
        guard.bytes_mut().unwrap()[0] = 0xC3;
        guard.bytes_mut().unwrap()[63] = 0x5A;
    }
    obj.ensure_shared().unwrap();
    assert_eq!(obj.domain(), ObjectDomain::Shared);
    {
        let guard = obj.shared_data().unwrap();
        let bytes = guard.bytes().unwrap();
        assert_eq!(bytes[0], 0xC3);
        assert_eq!(bytes[63], 0x5A);
        assert!(bytes[1..63].iter().all(|&b| b == 0));
    }
    obj.release_reference();
}

#[test]
fn test_same_name_from_two_processes_resolves_to_one_record() {
    // Scenario D.
    let arena = SharedArena::new();
    let mgr1 = ObjectManager::new(arena.clone(), 1);
    let mgr2 = ObjectManager::new(arena, 2);

    let first = mgr1
        .allocate_object(&BLOCK, &ObjectAttributes::named("Bar"))
        .unwrap();
    let (h1, obj1, outcome1) = mgr1
        .register_object(first, &AllowedTypes::Any, AccessRights::ALL)
        .unwrap();
    assert_eq!(outcome1, RegisterOutcome::Created);

    let second = mgr2
        .allocate_object(&BLOCK, &ObjectAttributes::named("Bar"))
        .unwrap();
    let (h2, obj2, outcome2) = mgr2
        .register_object(second, &AllowedTypes::Any, AccessRights::ALL)
        .unwrap();
    assert_eq!(outcome2, RegisterOutcome::AlreadyExists);

    assert_eq!(obj1.process_ref_count().unwrap(), 2);
    assert_eq!(obj2.process_ref_count().unwrap(), 2);

    // Both callers hold usable handles to the same underlying record.
    let via1 = mgr1
        .reference_object_by_handle(h1, &AllowedTypes::Any, AccessRights::READ)
        .unwrap();
    let via2 = mgr2
        .reference_object_by_handle(h2, &AllowedTypes::Any, AccessRights::READ)
        .unwrap();
    assert!(Arc::ptr_eq(&via1, &obj1));
    assert!(Arc::ptr_eq(&via2, &obj2));

    via1.release_reference();
    via2.release_reference();
    mgr1.revoke_handle(h1).unwrap();
    mgr2.revoke_handle(h2).unwrap();
    obj1.release_reference();
    obj2.release_reference();
}

#[test]
fn test_immutable_data_round_trips_between_processes() {
    let arena = SharedArena::new();
    let mgr1 = ObjectManager::new(arena.clone(), 1);
    let mgr2 = ObjectManager::new(arena.clone(), 2);

    let obj = mgr1
        .allocate_object(&BLOCK, &ObjectAttributes::named("RoundTrip"))
        .unwrap();
    let pattern: Vec<u8> = (0..16).map(|i| i as u8 ^ 0x5C).collect();
    obj.immutable_data().copy_from_slice(&pattern);
    let (handle, obj, outcome) = mgr1
        .register_object(obj, &AllowedTypes::Any, AccessRights::ALL)
        .unwrap();
    assert_eq!(outcome, RegisterOutcome::Created);

    let imported = mgr2.locate_object("RoundTrip", &AllowedTypes::Any).unwrap();
    assert_eq!(imported.name().as_deref(), Some("RoundTrip"));
    assert_eq!(imported.type_id(), obj.type_id());
    assert_eq!(&imported.immutable_data()[..], &pattern[..]);

    imported.release_reference();
    mgr1.revoke_handle(handle).unwrap();
    obj.release_reference();

    // Everything released: no blobs may remain in the arena.
    assert_eq!(arena.lock().live_blocks(), 0);
}

#[test]
fn test_registration_race_from_two_threads() {
    let arena = SharedArena::new();
    // Both registrations must overlap, or the late thread would find the
    // record already gone and create a second one.
    let barrier = std::sync::Barrier::new(2);
    let outcomes: Vec<RegisterOutcome> = std::thread::scope(|scope| {
        let mut joins = Vec::new();
        for process in 0..2u32 {
            let arena = arena.clone();
            let barrier = &barrier;
            joins.push(scope.spawn(move || {
                let mgr = ObjectManager::new(arena, process + 1);
                let obj = mgr
                    .allocate_object(&BLOCK, &ObjectAttributes::named("Raced"))
                    .unwrap();
                let (handle, obj, outcome) = mgr
                    .register_object(obj, &AllowedTypes::Any, AccessRights::ALL)
                    .unwrap();
                barrier.wait();
                let refs = obj.process_ref_count().unwrap();
                assert!(refs >= 1 && refs <= 2);
                mgr.revoke_handle(handle).unwrap();
                obj.release_reference();
                outcome
            }));
        }
        joins.into_iter().map(|j| j.join().unwrap()).collect()
    });

    let created = outcomes
        .iter()
        .filter(|&&o| o == RegisterOutcome::Created)
        .count();
    let joined = outcomes
        .iter()
        .filter(|&&o| o == RegisterOutcome::AlreadyExists)
        .count();
    assert_eq!(created, 1);
    assert_eq!(joined, 1);
    // Exactly one record existed and both processes released it.
    assert_eq!(arena.lock().live_blocks(), 0);
}

#[test]
fn test_dereference_is_idempotent() {
    let arena = SharedArena::new();
    let mgr = ObjectManager::new(arena.clone(), 1);

    // Never-shared object: always responsible for its local copy.
    let local = mgr
        .allocate_object(&BLOCK, &ObjectAttributes::anonymous())
        .unwrap();
    assert!(local.dereference_shared_data());
    assert!(local.dereference_shared_data());
    drop(local);

    // Shared object: the second call must not decrement again.
    let shared = mgr
        .allocate_object(&BLOCK, &ObjectAttributes::named("Once"))
        .unwrap();
    assert_eq!(shared.process_ref_count().unwrap(), 1);
    assert!(shared.dereference_shared_data());
    assert!(shared.dereference_shared_data());
    drop(shared);

    assert_eq!(arena.lock().live_blocks(), 0);
}

#[test]
fn test_domain_stays_shared_under_concurrent_promotion_and_reads() {
    let arena = SharedArena::new();
    let mgr = ObjectManager::new(arena, 1);
    let obj = mgr
        .allocate_object(&BLOCK, &ObjectAttributes::anonymous())
        .unwrap();
    obj.shared_data().unwrap().bytes_mut().unwrap()[0] = 42;

    std::thread::scope(|scope| {
        for _ in 0..2 {
            let obj = &obj;
            scope.spawn(move || {
                obj.ensure_shared().unwrap();
                assert_eq!(obj.domain(), ObjectDomain::Shared);
            });
        }
        for _ in 0..3 {
            let obj = &obj;
            scope.spawn(move || {
                let mut seen_shared = false;
                for _ in 0..500 {
                    let domain = obj.domain();
                    if seen_shared {
                        assert_eq!(domain, ObjectDomain::Shared, "domain went backwards");
                    }
                    seen_shared |= domain == ObjectDomain::Shared;
                    // The sentinel must survive the pointer retarget no
                    // matter which side of the promotion we land on.
                    let guard = obj.shared_data().unwrap();
                    assert_eq!(guard.bytes().unwrap()[0], 42);
                }
            });
        }
    });

    assert_eq!(obj.domain(), ObjectDomain::Shared);
    obj.release_reference();
}

#[test]
fn test_shutdown_runs_every_cleanup_once_and_drains_lists() {
    // Scenario E.
    let arena = SharedArena::new();
    let mgr = ObjectManager::new(arena, 1);

    let mut handles = Vec::new();
    for name in ["one", "two", "three"] {
        let obj = mgr
            .allocate_object(&COUNTED, &ObjectAttributes::named(name))
            .unwrap();
        let (handle, obj, _) = mgr
            .register_object(obj, &AllowedTypes::Any, AccessRights::ALL)
            .unwrap();
        handles.push((handle, obj));
    }
    for _ in 0..2 {
        let obj = mgr
            .allocate_object(&COUNTED, &ObjectAttributes::anonymous())
            .unwrap();
        let (handle, obj, _) = mgr
            .register_object(obj, &AllowedTypes::Any, AccessRights::ALL)
            .unwrap();
        handles.push((handle, obj));
    }

    SHUTDOWN_CLEANUPS.store(0, Ordering::SeqCst);
    mgr.shutdown();
    assert_eq!(SHUTDOWN_CLEANUPS.load(Ordering::SeqCst), 5);

    // The process-local directory is empty: looking the name up again
    // reconstructs a fresh proxy from the abandoned shared record instead
    // of returning the old one.
    let reimported = mgr.locate_object("one", &AllowedTypes::Any).unwrap();
    assert!(!Arc::ptr_eq(&reimported, &handles[0].1));
    reimported.release_reference();
}

#[test]
fn test_lookup_errors() {
    let arena = SharedArena::new();
    let mgr = ObjectManager::new(arena, 1);

    assert!(matches!(
        mgr.locate_object("", &AllowedTypes::Any),
        Err(ShmError::InvalidName)
    ));
    let long = "x".repeat(exo_shmobj::MAX_OBJECT_NAME + 1);
    assert!(matches!(
        mgr.locate_object(&long, &AllowedTypes::Any),
        Err(ShmError::InvalidName)
    ));
    assert!(matches!(
        mgr.locate_object("absent", &AllowedTypes::Any),
        Err(ShmError::NotFound)
    ));

    let obj = mgr
        .allocate_object(&BLOCK, &ObjectAttributes::named("TypedLookup"))
        .unwrap();
    let (handle, obj, _) = mgr
        .register_object(obj, &AllowedTypes::Any, AccessRights::ALL)
        .unwrap();
    assert!(matches!(
        mgr.locate_object("TypedLookup", &AllowedTypes::Only(&[ObjectTypeId(999)])),
        Err(ShmError::TypeMismatch)
    ));
    let found = mgr
        .locate_object("TypedLookup", &AllowedTypes::Only(&[BLOCK.id]))
        .unwrap();
    found.release_reference();
    mgr.revoke_handle(handle).unwrap();
    obj.release_reference();
}

#[test]
fn test_handle_rights_and_batch_lookup() {
    let arena = SharedArena::new();
    let mgr = ObjectManager::new(arena, 1);
    let obj = mgr
        .allocate_object(&BLOCK, &ObjectAttributes::anonymous())
        .unwrap();
    let (read_only, obj, _) = mgr
        .register_object(obj, &AllowedTypes::Any, AccessRights::READ)
        .unwrap();
    let full = mgr.obtain_handle_for_object(&obj, AccessRights::ALL).unwrap();

    assert!(matches!(
        mgr.reference_object_by_handle(read_only, &AllowedTypes::Any, AccessRights::WRITE),
        Err(ShmError::InvalidHandle)
    ));
    let referenced = mgr
        .reference_object_by_handle(read_only, &AllowedTypes::Any, AccessRights::READ)
        .unwrap();
    referenced.release_reference();

    let batch = mgr
        .reference_objects_by_handle_array(&[read_only, full], &AllowedTypes::Any, AccessRights::READ)
        .unwrap();
    assert_eq!(batch.len(), 2);
    for item in batch {
        item.release_reference();
    }

    mgr.revoke_handle(full).unwrap();
    // A revoked handle is stale for both single and batch lookups, and the
    // failing batch takes no references.
    assert!(matches!(
        mgr.reference_object_by_handle(full, &AllowedTypes::Any, AccessRights::READ),
        Err(ShmError::InvalidHandle)
    ));
    assert!(mgr
        .reference_objects_by_handle_array(&[read_only, full], &AllowedTypes::Any, AccessRights::READ)
        .is_err());
    let refs_after = obj.local_ref_count();
    assert_eq!(refs_after, 2); // caller + the surviving read_only handle

    mgr.revoke_handle(read_only).unwrap();
    obj.release_reference();
}

#[test]
fn test_foreign_handle_referencing_is_unimplemented() {
    let arena = SharedArena::new();
    let mgr = ObjectManager::new(arena, 1);
    assert!(matches!(
        mgr.reference_object_by_foreign_handle(7),
        Err(ShmError::NotImplemented)
    ));
}

#[test]
fn test_named_mutex_ownership_is_visible_across_processes() {
    let arena = SharedArena::new();
    let mgr1 = ObjectManager::new(arena.clone(), 11);
    let mgr2 = ObjectManager::new(arena, 22);

    let obj = mgr1
        .allocate_object(&builtin::MUTEX, &ObjectAttributes::named("Lock"))
        .unwrap();
    let (handle, obj, _) = mgr1
        .register_object(obj, &AllowedTypes::Any, AccessRights::ALL)
        .unwrap();
    let other = mgr2.locate_object("Lock", &AllowedTypes::Any).unwrap();

    let here = obj.wait_controller().unwrap();
    let there = other.wait_controller().unwrap();
    assert!(here.try_acquire(mgr1.process_id()).unwrap());
    assert!(!there.try_acquire(mgr2.process_id()).unwrap());
    assert!(here.release_ownership(mgr1.process_id()).unwrap());
    assert!(there.try_acquire(mgr2.process_id()).unwrap());
    assert!(there.release_ownership(mgr2.process_id()).unwrap());

    other.release_reference();
    mgr1.revoke_handle(handle).unwrap();
    obj.release_reference();
}

#[test]
fn test_event_flag_and_signal_cross_process() {
    let arena = SharedArena::new();
    let mgr1 = ObjectManager::new(arena.clone(), 1);
    let mgr2 = ObjectManager::new(arena, 2);

    let event = mgr1
        .allocate_object(&builtin::EVENT, &ObjectAttributes::named("Ready"))
        .unwrap();
    event.immutable_data()[0] = 1; // manual reset
    let (handle, event, _) = mgr1
        .register_object(event, &AllowedTypes::Only(&[builtin::EVENT.id]), AccessRights::ALL)
        .unwrap();

    let imported = mgr2.locate_object("Ready", &AllowedTypes::Any).unwrap();
    assert!(builtin::event_is_manual_reset(&imported.immutable_data()));

    event.state_controller().unwrap().set_signal_count(1).unwrap();
    assert!(imported.wait_controller().unwrap().is_signaled().unwrap());

    imported.release_reference();
    mgr1.revoke_handle(handle).unwrap();
    event.release_reference();
}

#[test]
fn test_promotion_carries_synch_state() {
    let arena = SharedArena::new();
    let mgr = ObjectManager::new(arena, 1);
    let mutex = mgr
        .allocate_object(&builtin::MUTEX, &ObjectAttributes::anonymous())
        .unwrap();
    assert_eq!(mutex.domain(), ObjectDomain::ProcessLocal);
    mutex.state_controller().unwrap().set_signal_count(2).unwrap();

    mutex.ensure_shared().unwrap();
    mutex.ensure_shared().unwrap(); // idempotent

    // A controller taken after promotion sees the shared copy.
    assert_eq!(
        mutex.state_controller().unwrap().signal_count().unwrap(),
        2
    );
    mutex.release_reference();
}

#[test]
fn test_non_waitable_objects_reject_controllers() {
    let arena = SharedArena::new();
    let mgr = ObjectManager::new(arena, 1);
    let obj = mgr
        .allocate_object(&BLOCK, &ObjectAttributes::anonymous())
        .unwrap();
    assert!(matches!(obj.state_controller(), Err(ShmError::NotWaitable)));
    assert!(matches!(obj.wait_controller(), Err(ShmError::NotWaitable)));
    obj.release_reference();
}

#[test]
fn test_full_lifecycle_leaves_no_arena_blobs() {
    let arena = SharedArena::new();
    {
        let mgr1 = ObjectManager::new(arena.clone(), 1);
        let mgr2 = ObjectManager::new(arena.clone(), 2);

        let obj = mgr1
            .allocate_object(&builtin::MUTEX, &ObjectAttributes::named("Tidy"))
            .unwrap();
        let (handle, obj, _) = mgr1
            .register_object(obj, &AllowedTypes::Any, AccessRights::ALL)
            .unwrap();
        let imported = mgr2.locate_object("Tidy", &AllowedTypes::Any).unwrap();
        assert_eq!(imported.process_ref_count().unwrap(), 2);

        imported.release_reference();
        assert_eq!(obj.process_ref_count().unwrap(), 1);
        mgr1.revoke_handle(handle).unwrap();
        obj.release_reference();
    }
    assert_eq!(arena.lock().live_blocks(), 0);
}
