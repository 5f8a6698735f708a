use criterion::Criterion;

use recycler::memory_manager;
use recycler::util::constants::BYTES_IN_WORD;
use recycler::{CollectionFlags, ObjectAttributes};

const LIST_LENGTH: usize = 10_000;

pub fn bench(c: &mut Criterion) {
    let (_context, host, mut recycler) = super::bench_recycler(1 << 30);

    // A rooted linked list; every iteration marks all of it.
    let head = memory_manager::alloc(&mut recycler, 2 * BYTES_IN_WORD, ObjectAttributes::NONE);
    let mut tail = head;
    for _ in 1..LIST_LENGTH {
        let next = memory_manager::alloc(&mut recycler, 2 * BYTES_IN_WORD, ObjectAttributes::NONE);
        unsafe { memory_manager::object_reference_write(&recycler, tail, next) };
        tail = next;
    }
    host.add_root(head);

    c.bench_function("collect_live_list", |b| {
        b.iter(|| memory_manager::collect_now(&mut recycler, CollectionFlags::COLLECT_NOW_FORCE_IN_THREAD))
    });

    c.bench_function("alloc_and_collect_garbage", |b| {
        b.iter(|| {
            for _ in 0..LIST_LENGTH {
                memory_manager::alloc(&mut recycler, 32, ObjectAttributes::LEAF);
            }
            memory_manager::collect_now(&mut recycler, CollectionFlags::COLLECT_NOW_FORCE_IN_THREAD)
        })
    });
}
