use std::sync::Arc;

pub use criterion::Criterion;

use recycler::memory_manager;
use recycler::util::test_util::mock_host::MockHost;
use recycler::vm::ObjectKindTable;
use recycler::{Options, ProcessContext, Recycler};

pub mod alloc;
pub mod collect;
pub mod page_allocator;

/// A recycler that only collects when the benchmark asks it to.
pub fn bench_recycler(max_heap_size: usize) -> (Arc<ProcessContext>, Arc<MockHost>, Box<Recycler>) {
    let context = ProcessContext::new();
    let host = MockHost::new();
    let mut options = Options::fixed_defaults();
    options.collect_on_allocation = false;
    options.max_heap_size = max_heap_size;
    let recycler = memory_manager::recycler_init(&context, options, ObjectKindTable::new(), host.clone());
    (context, host, recycler)
}

pub fn bench(c: &mut Criterion) {
    alloc::bench(c);
    collect::bench(c);
    page_allocator::bench(c);
}
