use criterion::Criterion;

use recycler::util::heap::PageAllocator;
use recycler::ProcessContext;

pub fn bench(c: &mut Criterion) {
    let context = ProcessContext::new();
    let pa = PageAllocator::new(context.card_table().clone(), 1 << 30, 1024);

    c.bench_function("page_alloc_release_1", |b| {
        b.iter(|| {
            let addr = pa.alloc_pages(1).unwrap();
            pa.release_pages(addr, 1).unwrap();
        })
    });

    c.bench_function("page_alloc_release_dedicated", |b| {
        b.iter(|| {
            let addr = pa.alloc_pages(64).unwrap();
            pa.release_pages(addr, 64).unwrap();
        })
    });
}
