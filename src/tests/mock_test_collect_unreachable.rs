use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::mock_test_prelude::*;

use crate::policy::heap_block::SweepState;
use crate::recycler::CollectionStateWatcher;
use crate::vm::{scan_words_conservatively, ObjectTracer};

static MARK_WATCHER: Mutex<Option<CollectionStateWatcher>> = Mutex::new(None);
static TRACED_IN_PARALLEL_MARK: AtomicUsize = AtomicUsize::new(0);

fn trace_and_watch(object: Address, size: usize, tracer: &mut dyn ObjectTracer) {
    if let Some(watcher) = MARK_WATCHER.lock().unwrap().as_ref() {
        if watcher.get() == CollectionState::ParallelMark {
            TRACED_IN_PARALLEL_MARK.fetch_add(1, Ordering::SeqCst);
        }
    }
    unsafe { scan_words_conservatively(object, object + size, tracer) }
}

#[test]
pub fn unreachable_leaf_objects_are_reclaimed() {
    let mut fixture = RecyclerFixture::new(test_options());
    let recycler = &mut fixture.recycler;

    let objects: Vec<Address> = (0..1000)
        .map(|_| memory_manager::alloc_leaf(recycler, 32))
        .collect();
    assert_eq!(count_objects(recycler), 1000);
    assert!(objects.iter().all(|o| recycler.is_allocated_object(*o)));

    collect_in_thread(recycler);

    assert_eq!(count_objects(recycler), 0);
    assert!(objects.iter().all(|o| !recycler.is_allocated_object(*o)));
    let stats = recycler.last_collection_stats().unwrap();
    assert!(!stats.partial);
    assert_eq!(stats.freed_objects, 1000);
    assert_eq!(stats.freed_bytes, 1000 * 32);
    // 128 objects of 32 bytes per one-page block.
    assert_eq!(stats.swept_blocks[SweepState::Empty], 8);
    assert_eq!(stats.swept_block_count(), 8);
    recycler.verify().unwrap();
}

#[test]
pub fn reachable_objects_survive() {
    let mut fixture = RecyclerFixture::new(test_options());
    let host = fixture.host.clone();
    let recycler = &mut fixture.recycler;

    // root -> middle -> leaf, plus garbage between them.
    let root = memory_manager::alloc_normal(recycler, 64);
    let middle = memory_manager::alloc_normal(recycler, 128);
    let leaf = memory_manager::alloc_leaf(recycler, 48);
    let garbage: Vec<Address> = (0..100)
        .map(|_| memory_manager::alloc_normal(recycler, 64))
        .collect();
    write_field(recycler, root, 3, middle);
    write_field(recycler, middle, 0, leaf);
    host.add_root(root);

    collect_in_thread(recycler);

    for object in [root, middle, leaf] {
        assert!(recycler.is_allocated_object(object));
        assert!(recycler.is_marked(object));
    }
    assert!(garbage.iter().all(|o| !recycler.is_allocated_object(*o)));
    assert_eq!(count_objects(recycler), 3);
    assert_eq!(host.collections(), 1);
    assert_eq!(host.last_freed_bytes(), 100 * 64);

    // An interior pointer keeps the object alive too.
    host.clear_roots();
    host.add_root(middle + 8usize);
    collect_in_thread(recycler);
    assert!(!recycler.is_allocated_object(root));
    assert!(recycler.is_allocated_object(middle));
    assert!(recycler.is_allocated_object(leaf));
}

#[test]
pub fn large_objects_are_reclaimed() {
    let mut fixture = RecyclerFixture::new(test_options());
    let host = fixture.host.clone();
    let recycler = &mut fixture.recycler;

    let big = memory_manager::alloc_normal(recycler, 64 * BYTES_IN_KBYTE);
    let small = memory_manager::alloc_leaf(recycler, 16);
    write_field(recycler, big, 1000, small);
    host.add_root(big);
    let used = recycler.used_pages();

    collect_in_thread(recycler);
    assert!(recycler.is_allocated_object(big));
    assert!(recycler.is_allocated_object(small));

    host.clear_roots();
    collect_in_thread(recycler);
    assert!(!recycler.is_allocated_object(big));
    assert!(!recycler.is_allocated_object(small));
    assert!(recycler.used_pages() < used);
}

#[test]
pub fn collection_with_parallel_mark() {
    let mut options = test_options();
    options.parallel_mark_threads = 2;
    options.parallel_mark_min_chunks = 2;
    let mut fixture = RecyclerFixture::new(options);
    let host = fixture.host.clone();
    let recycler = &mut fixture.recycler;

    // Enough roots to fill several mark stack chunks.
    let mut children = vec![];
    for _ in 0..2000 {
        let parent = memory_manager::alloc_normal(recycler, 32);
        let child = memory_manager::alloc_normal(recycler, 32);
        write_field(recycler, parent, 0, child);
        host.add_root(parent);
        children.push(child);
    }
    let garbage = memory_manager::alloc_normal(recycler, 32);

    collect_in_thread(recycler);

    let stats = recycler.last_collection_stats().unwrap();
    assert!(stats.parallel_mark);
    assert_eq!(stats.marked_objects, 4000);
    assert!(children.iter().all(|c| recycler.is_marked(*c)));
    assert!(!recycler.is_allocated_object(garbage));
}

#[test]
pub fn helpers_mark_in_parallel_mark_state() {
    let mut kinds = ObjectKindTable::new();
    let watched = kinds
        .register(ObjectKindInfo {
            name: "watched",
            trace: Some(trace_and_watch),
            finalize: None,
            dispose: None,
        })
        .unwrap();
    let mut options = test_options();
    options.parallel_mark_threads = 2;
    options.parallel_mark_min_chunks = 2;
    let host = MockHost::new();
    let mut fixture = RecyclerFixture::create(options, kinds, host.clone());
    let recycler = &mut fixture.recycler;
    *MARK_WATCHER.lock().unwrap() = Some(recycler.collection_state_watcher());

    for _ in 0..2000 {
        let parent = memory_manager::alloc(recycler, 32, ObjectAttributes::NONE.with_kind(watched));
        let child = memory_manager::alloc_leaf(recycler, 32);
        write_field(recycler, parent, 0, child);
        host.add_root(parent);
    }

    collect_in_thread(recycler);
    *MARK_WATCHER.lock().unwrap() = None;

    assert!(recycler.last_collection_stats().unwrap().parallel_mark);
    assert!(TRACED_IN_PARALLEL_MARK.load(Ordering::SeqCst) > 0);
    assert_eq!(recycler.collection_state(), CollectionState::NotCollecting);
}

#[test]
pub fn explicit_free() {
    let mut fixture = RecyclerFixture::new(test_options());
    let recycler = &mut fixture.recycler;

    let object = memory_manager::alloc_normal(recycler, 64);
    assert!(!memory_manager::free(recycler, object + 16usize));
    assert!(memory_manager::free(recycler, object));
    assert!(!recycler.is_allocated_object(object));
    assert!(!memory_manager::free(recycler, object));

    let big = memory_manager::alloc_normal(recycler, 64 * BYTES_IN_KBYTE);
    assert!(!memory_manager::free(recycler, big));
    assert!(recycler.is_allocated_object(big));
}
