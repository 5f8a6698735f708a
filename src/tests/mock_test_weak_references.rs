use super::mock_test_prelude::*;

#[test]
pub fn weak_reference_is_cleared_with_its_target() {
    let mut fixture = RecyclerFixture::new(test_options());
    let host = fixture.host.clone();
    let recycler = &mut fixture.recycler;

    let target = memory_manager::alloc_normal(recycler, 32);
    let weak = memory_manager::create_weak_reference(recycler, target);
    let again = memory_manager::create_weak_reference(recycler, target);
    assert!(weak.ptr_eq(&again));
    assert_eq!(recycler.weak_reference_count(), 1);
    host.add_root(target);

    collect_in_thread(recycler);
    assert_eq!(memory_manager::get_weak_reference(recycler, &weak), Some(target));

    host.clear_roots();
    collect_in_thread(recycler);
    assert_eq!(memory_manager::get_weak_reference(recycler, &weak), None);
    assert_eq!(memory_manager::get_weak_reference(recycler, &again), None);
}

#[test]
pub fn weak_entries_without_handles_are_pruned() {
    let mut fixture = RecyclerFixture::new(test_options());
    let host = fixture.host.clone();
    let recycler = &mut fixture.recycler;

    let target = memory_manager::alloc_normal(recycler, 32);
    host.add_root(target);
    let weak = memory_manager::create_weak_reference(recycler, target);
    assert_eq!(recycler.weak_reference_count(), 1);

    drop(weak);
    collect_in_thread(recycler);
    assert_eq!(recycler.weak_reference_count(), 0);
    assert!(recycler.is_allocated_object(target));
}

#[test]
pub fn weak_reference_does_not_keep_target_alive() {
    let mut fixture = RecyclerFixture::new(test_options());
    let recycler = &mut fixture.recycler;

    let target = memory_manager::alloc_leaf(recycler, 128);
    let weak = memory_manager::create_weak_reference(recycler, target);
    collect_in_thread(recycler);
    assert!(!recycler.is_allocated_object(target));
    assert!(memory_manager::get_weak_reference(recycler, &weak).is_none());
}
