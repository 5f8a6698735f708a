use std::sync::Arc;
use std::time::Duration;

use super::mock_test_prelude::*;

use crate::context::ContextError;

fn deferred_fixture() -> (RecyclerFixture, Arc<DeferredThreadService>) {
    let service = Arc::new(DeferredThreadService::new());
    let host = MockHost::with_service(service.clone());
    let fixture = RecyclerFixture::create(test_options(), ObjectKindTable::new(), host);
    (fixture, service)
}

#[test]
pub fn rescan_finds_reference_written_during_background_mark() {
    let (mut fixture, service) = deferred_fixture();
    let host = fixture.host.clone();
    let recycler = &mut fixture.recycler;

    let pinned = memory_manager::alloc_normal(recycler, 64);
    let target = memory_manager::alloc_normal(recycler, 64);
    let garbage = memory_manager::alloc_normal(recycler, 64);
    memory_manager::root_add_ref(recycler, pinned);
    host.add_root(target);

    assert!(memory_manager::collect_now(recycler, CollectionFlags::COLLECT_NOW_CONCURRENT));
    assert_eq!(recycler.collection_state(), CollectionState::ConcurrentMark);
    assert_eq!(service.pending(), 1);

    // Nothing ran in the background yet, so nothing can finish.
    assert!(!recycler.finish_concurrent_mark(Some(Duration::ZERO)));
    assert!(!memory_manager::collect_now(recycler, CollectionFlags::COLLECT_NOW_CONCURRENT));
    assert_eq!(recycler.collection_state(), CollectionState::ConcurrentMark);

    assert_eq!(service.run_pending(), 1);
    // The background mark only sees the pinned object.
    assert!(recycler.is_marked(pinned));
    assert!(!recycler.is_marked(target));

    // Allocation during the mark is black.
    let fresh = memory_manager::alloc_normal(recycler, 64);
    assert!(recycler.is_marked(fresh));

    // The only path to `target` is now through the already scanned object.
    write_field(recycler, pinned, 2, target);
    host.remove_root(target);

    assert!(recycler.finish_concurrent_mark(INFINITE));
    assert_eq!(recycler.collection_state(), CollectionState::ConcurrentSweep);
    assert_eq!(service.run_pending(), 1);
    assert!(recycler.finish_concurrent_collect(INFINITE));
    assert_eq!(recycler.collection_state(), CollectionState::NotCollecting);

    assert!(recycler.is_allocated_object(target));
    assert!(recycler.is_marked(target));
    assert!(recycler.is_allocated_object(fresh));
    assert!(!recycler.is_allocated_object(garbage));

    let stats = recycler.last_collection_stats().unwrap();
    assert!(stats.concurrent_mark);
    assert!(stats.concurrent_sweep);
    assert!(!stats.partial);
    assert!(stats.rescanned_cards >= 1);
    assert_eq!(host.collections(), 1);

    // The black object was never referenced, so the next collection frees it.
    collect_in_thread(recycler);
    assert!(!recycler.is_allocated_object(fresh));
    assert!(recycler.is_allocated_object(target));
    recycler.verify().unwrap();
}

#[test]
pub fn unpinned_object_survives_the_collection_that_marked_it() {
    let (mut fixture, service) = deferred_fixture();
    let recycler = &mut fixture.recycler;

    let object = memory_manager::alloc_normal(recycler, 32);
    memory_manager::root_add_ref(recycler, object);
    assert!(memory_manager::collect_now(recycler, CollectionFlags::COLLECT_NOW_CONCURRENT));
    service.run_pending();

    // Marked by the background root scan, so it outlives this collection.
    assert!(memory_manager::root_release(recycler, object));
    assert_eq!(recycler.pin_count(object), 0);
    assert!(recycler.finish_concurrent_mark(INFINITE));
    service.run_pending();
    assert!(recycler.finish_concurrent_collection(INFINITE));
    assert!(recycler.is_allocated_object(object));

    collect_in_thread(recycler);
    assert!(!recycler.is_allocated_object(object));
}

#[test]
pub fn object_pinned_during_background_mark_survives() {
    let (mut fixture, service) = deferred_fixture();
    let host = fixture.host.clone();
    let recycler = &mut fixture.recycler;

    let object = memory_manager::alloc_normal(recycler, 64);
    let child = memory_manager::alloc_leaf(recycler, 32);
    write_field(recycler, object, 0, child);
    host.add_root(object);

    assert!(memory_manager::collect_now(recycler, CollectionFlags::COLLECT_NOW_CONCURRENT));
    assert_eq!(service.run_pending(), 1);
    // The background root scan is over. The pin is the only root left.
    assert_eq!(memory_manager::root_add_ref(recycler, object), 1);
    host.remove_root(object);

    assert!(recycler.finish_concurrent_mark(INFINITE));
    service.run_pending();
    assert!(recycler.finish_concurrent_collection(INFINITE));
    assert_eq!(recycler.pin_count(object), 1);
    assert!(recycler.is_allocated_object(object));
    assert!(recycler.is_allocated_object(child));
    recycler.verify().unwrap();
}

#[test]
pub fn guest_arena_added_during_background_mark_is_scanned() {
    let (mut fixture, service) = deferred_fixture();
    let host = fixture.host.clone();
    let recycler = &mut fixture.recycler;

    let object = memory_manager::alloc_normal(recycler, 64);
    let garbage = memory_manager::alloc_normal(recycler, 64);
    host.add_root(object);

    assert!(memory_manager::collect_now(recycler, CollectionFlags::COLLECT_NOW_CONCURRENT));
    assert_eq!(service.run_pending(), 1);
    let arena: Box<[usize; 2]> = Box::new([object.as_usize(), 0]);
    let id = recycler.add_guest_arena(Address::from_ptr(arena.as_ptr()), std::mem::size_of::<[usize; 2]>());
    host.remove_root(object);

    assert!(recycler.finish_concurrent_mark(INFINITE));
    service.run_pending();
    assert!(recycler.finish_concurrent_collection(INFINITE));
    assert!(recycler.is_allocated_object(object));
    assert!(!recycler.is_allocated_object(garbage));

    assert!(recycler.remove_guest_arena(id));
    drop(arena);
}

#[test]
pub fn allocation_during_background_sweep_reuses_swept_blocks() {
    let (mut fixture, service) = deferred_fixture();
    let host = fixture.host.clone();
    let recycler = &mut fixture.recycler;

    let live = memory_manager::alloc_normal(recycler, 64);
    host.add_root(live);
    let garbage: Vec<Address> = (0..16)
        .map(|_| memory_manager::alloc_normal(recycler, 64))
        .collect();
    let blocks = recycler.block_count();

    assert!(memory_manager::collect_now(recycler, CollectionFlags::COLLECT_NOW_CONCURRENT));
    service.run_pending();
    assert!(recycler.finish_concurrent_mark(INFINITE));
    assert_eq!(recycler.collection_state(), CollectionState::ConcurrentSweep);
    // The sweep has run but its blocks are not linked back yet.
    assert_eq!(service.run_pending(), 1);

    let reused = memory_manager::alloc_normal(recycler, 64);
    assert_eq!(recycler.collection_state(), CollectionState::ConcurrentSweep);
    assert!(garbage.contains(&reused));
    assert_eq!(recycler.block_count(), blocks);

    assert!(recycler.finish_concurrent_collect(INFINITE));
    assert!(recycler.is_allocated_object(live));
    assert!(recycler.is_allocated_object(reused));
    assert_eq!(count_objects(recycler), 2);
    recycler.verify().unwrap();
}

#[test]
pub fn allocation_during_background_sweep_can_be_disabled() {
    let service = Arc::new(DeferredThreadService::new());
    let host = MockHost::with_service(service.clone());
    let mut options = test_options();
    options.concurrent_sweep_alloc = false;
    let mut fixture = RecyclerFixture::create(options, ObjectKindTable::new(), host);
    let recycler = &mut fixture.recycler;

    let garbage: Vec<Address> = (0..16)
        .map(|_| memory_manager::alloc_normal(recycler, 64))
        .collect();
    assert!(memory_manager::collect_now(recycler, CollectionFlags::COLLECT_NOW_CONCURRENT));
    service.run_pending();
    assert!(recycler.finish_concurrent_mark(INFINITE));
    service.run_pending();

    // The swept block is still out, so the object goes to a new block.
    let fresh = memory_manager::alloc_normal(recycler, 64);
    assert!(!garbage.contains(&fresh));
    assert!(recycler.finish_concurrent_collect(INFINITE));
    assert!(recycler.is_allocated_object(fresh));
    recycler.verify().unwrap();
}

#[test]
pub fn rejected_background_work_runs_in_thread() {
    let service = Arc::new(DeferredThreadService::rejecting());
    let host = MockHost::with_service(service.clone());
    let mut fixture = RecyclerFixture::create(test_options(), ObjectKindTable::new(), host.clone());
    let recycler = &mut fixture.recycler;

    let live = memory_manager::alloc_normal(recycler, 64);
    let dead = memory_manager::alloc_normal(recycler, 64);
    host.add_root(live);

    assert!(memory_manager::collect_now(recycler, CollectionFlags::COLLECT_NOW_CONCURRENT));
    assert_eq!(recycler.collection_state(), CollectionState::NotCollecting);
    assert_eq!(service.pending(), 0);
    assert!(recycler.is_allocated_object(live));
    assert!(!recycler.is_allocated_object(dead));

    let stats = recycler.last_collection_stats().unwrap();
    assert!(!stats.concurrent_mark);
    assert!(!stats.concurrent_sweep);
}

#[test]
pub fn concurrent_collection_on_background_thread() {
    let mut fixture = RecyclerFixture::new(test_options());
    let host = fixture.host.clone();
    let recycler = &mut fixture.recycler;

    let live: Vec<Address> = (0..200)
        .map(|_| memory_manager::alloc_normal(recycler, 48))
        .collect();
    let dead: Vec<Address> = (0..200)
        .map(|_| memory_manager::alloc_normal(recycler, 48))
        .collect();
    for object in live.iter() {
        host.add_root(*object);
    }

    assert!(memory_manager::collect_now(recycler, CollectionFlags::COLLECT_NOW_CONCURRENT));
    assert!(recycler.finish_concurrent_collection(INFINITE));
    assert!(!recycler.is_collection_in_progress());

    assert!(live.iter().all(|o| recycler.is_allocated_object(*o)));
    assert!(dead.iter().all(|o| !recycler.is_allocated_object(*o)));
    assert!(recycler.last_collection_stats().unwrap().concurrent_mark);
}

#[test]
pub fn drop_finishes_collection_in_progress() {
    let RecyclerFixture {
        mut recycler,
        host: _host,
        context,
    } = RecyclerFixture::new(test_options());

    memory_manager::alloc_normal(&mut recycler, 64);
    assert!(memory_manager::collect_now(&mut recycler, CollectionFlags::COLLECT_NOW_CONCURRENT));
    assert_eq!(context.clone().teardown(), Err(ContextError::InUse(1)));
    drop(recycler);
    assert_eq!(context.recycler_count(), 0);
    assert_eq!(context.teardown(), Ok(()));
}
