// NOTE: Each of the following modules builds its own `ProcessContext` and
// recycler, so the tests are independent and can run in parallel. Tests that
// read `RECYCLER_*` environment variables must go through `serial_test`.

pub(crate) mod mock_test_prelude {
    use std::sync::Arc;

    pub use crate::context::ProcessContext;
    pub use crate::memory_manager;
    pub use crate::policy::attributes::ObjectAttributes;
    pub use crate::recycler::{CollectionFlags, CollectionState, Recycler};
    pub use crate::scheduler::DeferredThreadService;
    pub use crate::util::constants::{BYTES_IN_KBYTE, BYTES_IN_MBYTE, BYTES_IN_WORD, INFINITE};
    pub use crate::util::options::Options;
    pub use crate::util::test_util::mock_host::MockHost;
    pub use crate::util::Address;
    pub use crate::vm::{ObjectKindInfo, ObjectKindTable};

    /// Defaults without environment overrides. Nothing collects unless the
    /// test asks for it, and marking stays on the test thread.
    pub fn test_options() -> Options {
        let mut options = Options::fixed_defaults();
        options.collect_on_allocation = false;
        options.parallel_mark_threads = 0;
        options.max_heap_size = 256 * BYTES_IN_MBYTE;
        options
    }

    pub struct RecyclerFixture {
        pub recycler: Box<Recycler>,
        pub host: Arc<MockHost>,
        pub context: Arc<ProcessContext>,
    }

    impl RecyclerFixture {
        pub fn new(options: Options) -> Self {
            Self::create(options, ObjectKindTable::new(), MockHost::new())
        }

        pub fn create(options: Options, kinds: ObjectKindTable, host: Arc<MockHost>) -> Self {
            let context = ProcessContext::new();
            let recycler = memory_manager::recycler_init(&context, options, kinds, host.clone());
            RecyclerFixture {
                recycler,
                host,
                context,
            }
        }
    }

    pub fn count_objects(recycler: &Recycler) -> usize {
        recycler.enumerate_objects(ObjectAttributes::NONE, |_, _, _| {})
    }

    /// Store `value` into word `index` of `object` through the write barrier.
    pub fn write_field(recycler: &Recycler, object: Address, index: usize, value: Address) {
        unsafe { recycler.write_reference(object + index * BYTES_IN_WORD, value) }
    }

    pub fn collect_in_thread(recycler: &mut Recycler) {
        assert!(recycler.collect_now(CollectionFlags::COLLECT_NOW_FORCE_IN_THREAD));
        assert_eq!(recycler.collection_state(), CollectionState::NotCollecting);
    }
}

mod mock_test_collect_unreachable;
mod mock_test_concurrent_mark;
mod mock_test_partial_collect;
mod mock_test_pinned_roots;
mod mock_test_weak_references;
