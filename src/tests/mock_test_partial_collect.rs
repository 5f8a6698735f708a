use super::mock_test_prelude::*;

use crate::util::constants::BYTES_IN_CARD;

const PARTIAL_IN_THREAD: CollectionFlags =
    CollectionFlags::PARTIAL.union(CollectionFlags::FORCE_IN_THREAD);

#[test]
pub fn partial_collection_keeps_marks_and_rescans_written_cards() {
    let mut fixture = RecyclerFixture::new(test_options());
    let host = fixture.host.clone();
    let recycler = &mut fixture.recycler;

    let kept: Vec<Address> = (0..64)
        .map(|_| memory_manager::alloc_normal(recycler, 64))
        .collect();
    for object in kept.iter() {
        host.add_root(*object);
    }
    for _ in 0..64 {
        memory_manager::alloc_normal(recycler, 64);
    }

    // Nothing to keep marks from yet: the first request runs full.
    assert!(memory_manager::collect_now(recycler, PARTIAL_IN_THREAD));
    let stats = recycler.last_collection_stats().unwrap();
    assert!(!stats.partial);
    assert!(stats.partial_requested);
    assert_eq!(count_objects(recycler), 64);

    // The roots are gone, but a partial collection keeps what the last one
    // marked.
    host.clear_roots();
    let fresh: Vec<Address> = (0..16)
        .map(|_| memory_manager::alloc_normal(recycler, 64))
        .collect();
    let linked = memory_manager::alloc_normal(recycler, 64);
    write_field(recycler, kept[0], 1, linked);

    assert!(memory_manager::collect_now(recycler, PARTIAL_IN_THREAD));
    let stats = recycler.last_collection_stats().unwrap();
    assert!(stats.partial);
    assert!(stats.rescanned_cards >= 1);
    assert!(kept.iter().all(|o| recycler.is_allocated_object(*o)));
    assert!(fresh.iter().all(|o| !recycler.is_allocated_object(*o)));
    // Only reachable through a card written since the last collection.
    assert!(recycler.is_allocated_object(linked));
    recycler.verify().unwrap();

    // A full collection starts from scratch.
    collect_in_thread(recycler);
    assert_eq!(count_objects(recycler), 0);
}

#[test]
pub fn too_many_dirty_cards_force_a_full_collection() {
    let options = test_options();
    let limit = options.partial_collect_max_rescan_bytes;
    let mut fixture = RecyclerFixture::new(options);
    let host = fixture.host.clone();
    let recycler = &mut fixture.recycler;

    // One object per card, enough cards to go past the rescan limit.
    let count = limit / BYTES_IN_CARD + 256;
    let objects: Vec<Address> = (0..count)
        .map(|_| memory_manager::alloc_normal(recycler, BYTES_IN_CARD))
        .collect();
    for object in objects.iter() {
        host.add_root(*object);
    }
    collect_in_thread(recycler);

    for object in objects.iter() {
        memory_manager::object_reference_write_post(recycler, *object);
    }
    let dead = memory_manager::alloc_leaf(recycler, 32);

    assert!(memory_manager::collect_now(recycler, PARTIAL_IN_THREAD));
    let stats = recycler.last_collection_stats().unwrap();
    assert!(stats.partial_requested);
    assert!(!stats.partial);
    assert!(!recycler.is_allocated_object(dead));
    assert!(objects.iter().all(|o| recycler.is_allocated_object(*o)));

    // The full collection cleaned the cards, so the next request may be
    // partial again.
    assert!(memory_manager::collect_now(recycler, PARTIAL_IN_THREAD));
    assert!(recycler.last_collection_stats().unwrap().partial);
}

#[test]
pub fn partial_collection_can_be_disabled() {
    let mut options = test_options();
    options.partial_collect = false;
    let mut fixture = RecyclerFixture::new(options);
    let recycler = &mut fixture.recycler;

    memory_manager::alloc_normal(recycler, 64);
    collect_in_thread(recycler);
    assert!(memory_manager::collect_now(recycler, PARTIAL_IN_THREAD));
    assert!(!recycler.last_collection_stats().unwrap().partial);
}
