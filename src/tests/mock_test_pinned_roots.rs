use super::mock_test_prelude::*;

#[test]
pub fn pinned_object_survives_until_released() {
    let mut fixture = RecyclerFixture::new(test_options());
    let recycler = &mut fixture.recycler;

    let object = memory_manager::alloc_normal(recycler, 64);
    let child = memory_manager::alloc_normal(recycler, 256);
    write_field(recycler, object, 7, child);
    assert_eq!(memory_manager::root_add_ref(recycler, object), 1);
    assert_eq!(memory_manager::root_add_ref(recycler, object), 2);

    collect_in_thread(recycler);
    assert!(recycler.is_allocated_object(object));
    assert!(recycler.is_marked(object));
    assert!(recycler.is_marked(child));

    // Pins are counted: one release is not enough.
    assert!(memory_manager::root_release(recycler, object));
    assert_eq!(recycler.pin_count(object), 1);
    collect_in_thread(recycler);
    assert!(recycler.is_allocated_object(object));

    assert!(memory_manager::root_release(recycler, object));
    assert!(!memory_manager::root_release(recycler, object));
    collect_in_thread(recycler);
    assert!(!recycler.is_allocated_object(object));
    assert!(!recycler.is_allocated_object(child));
}

#[test]
pub fn guest_arena_words_are_roots() {
    let mut fixture = RecyclerFixture::new(test_options());
    let recycler = &mut fixture.recycler;

    let kept = memory_manager::alloc_normal(recycler, 32);
    let dropped = memory_manager::alloc_normal(recycler, 32);
    // Host memory outside the heap, holding one reference and some noise.
    let arena: Box<[usize; 4]> = Box::new([7, kept.as_usize(), 0, usize::MAX]);
    let start = Address::from_ptr(arena.as_ptr());
    let id = recycler.add_guest_arena(start, std::mem::size_of::<[usize; 4]>());

    collect_in_thread(recycler);
    assert!(recycler.is_allocated_object(kept));
    assert!(!recycler.is_allocated_object(dropped));

    assert!(recycler.remove_guest_arena(id));
    assert!(!recycler.remove_guest_arena(id));
    collect_in_thread(recycler);
    assert!(!recycler.is_allocated_object(kept));
    drop(arena);
}

#[test]
pub fn cyclic_garbage_is_reclaimed() {
    let mut fixture = RecyclerFixture::new(test_options());
    let recycler = &mut fixture.recycler;

    let a = memory_manager::alloc_normal(recycler, 32);
    let b = memory_manager::alloc_normal(recycler, 32);
    write_field(recycler, a, 0, b);
    write_field(recycler, b, 0, a);
    memory_manager::root_add_ref(recycler, a);

    collect_in_thread(recycler);
    assert!(recycler.is_allocated_object(b));

    memory_manager::root_release(recycler, a);
    collect_in_thread(recycler);
    assert!(!recycler.is_allocated_object(a));
    assert!(!recycler.is_allocated_object(b));
}
