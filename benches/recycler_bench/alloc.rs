use criterion::Criterion;

use recycler::memory_manager;
use recycler::ObjectAttributes;

pub fn bench(c: &mut Criterion) {
    // Large enough that the benchmark never needs a collection.
    let (_context, _host, mut recycler) = super::bench_recycler(1 << 30);

    c.bench_function("alloc_leaf_16", |b| {
        b.iter(|| memory_manager::alloc(&mut recycler, 16, ObjectAttributes::LEAF))
    });

    c.bench_function("alloc_normal_256", |b| {
        b.iter(|| memory_manager::alloc(&mut recycler, 256, ObjectAttributes::NONE))
    });

    c.bench_function("alloc_and_free_64", |b| {
        b.iter(|| {
            let object = memory_manager::alloc(&mut recycler, 64, ObjectAttributes::NONE);
            memory_manager::free(&mut recycler, object)
        })
    });
}
