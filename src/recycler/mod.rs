//! The recycler: one collected heap and the state machine that collects it.
//!
//! A collection goes through
//! `ResetMarks → FindRoots → Mark → Sweep → PostCollectionCallback`. A
//! concurrent collection marks on the background thread (`ConcurrentMark`)
//! and comes back to the mutator for `RescanFindRoots` and `RescanMark`,
//! which pick up the writes the background mark raced with. Its sweep may
//! run in the background too (`ConcurrentSweep`), after which the swept
//! blocks are relinked (`TransferSweptWait`, `TransferSwept`). A partial
//! collection keeps the marks of the previous collection, uses the cards
//! written since as extra roots and sweeps only blocks that were allocated
//! into.
//!
//! Finalizable objects the mark did not reach are finalized during the
//! sweep and disposed afterwards, outside the collection.

mod alloc;
mod collect;
mod collection_state;
mod concurrent;
mod dispose;
mod parallel;
mod roots;
mod stats;
mod weak_ref;

pub use self::collect::CollectionFlags;
pub use self::collection_state::{CollectionState, CollectionStateWatcher};
pub use self::roots::GuestArenaId;
pub use self::stats::CollectionStats;
pub use self::weak_ref::WeakReference;

use std::sync::{Arc, Mutex};
use std::time::Instant;

use atomic::{Atomic, Ordering};

use crate::context::{ProcessContext, RecyclerId};
use crate::policy::allocator::{AllocatorId, AllocatorRing};
use crate::policy::attributes::ObjectAttributes;
use crate::policy::block_map::BlockMap;
use crate::policy::heap_info::HeapInfo;
use crate::policy::sweep::{RecyclerSweep, RecyclerSweepManager};
use crate::scheduler::{BackgroundExecutor, Job};
use crate::util::constants::INFINITE;
use crate::util::heap::PageAllocator;
use crate::util::mark::MarkContext;
use crate::util::options::Options;
use crate::util::write_barrier::CardTable;
use crate::util::Address;
use crate::vm::{HostBinding, ObjectKindTable};

use self::parallel::ParallelMarker;
use self::roots::RootSet;
use self::weak_ref::WeakReferenceMap;

pub struct Recycler {
    id: RecyclerId,
    context: Arc<ProcessContext>,
    options: Options,
    host: Arc<dyn HostBinding>,
    kinds: Arc<ObjectKindTable>,
    heap: HeapInfo,
    card_table: Arc<CardTable>,
    state: Arc<Atomic<CollectionState>>,
    roots: Arc<RootSet>,
    weak_refs: WeakReferenceMap,
    /// Weak targets read while marking. They are roots of the final rescan.
    weak_rescan_roots: Mutex<Vec<Address>>,
    mark_context: MarkContext,
    /// Where the mark context waits while the background thread has it.
    concurrent_mark_slot: Arc<Mutex<Option<MarkContext>>>,
    background: Option<BackgroundExecutor>,
    background_unavailable: bool,
    /// A background job was submitted and its completion not yet observed.
    background_pending: bool,
    parallel: ParallelMarker,
    sweep_manager: RecyclerSweepManager,
    /// The sweep in progress, between the sweep phase and its completion.
    sweep: Option<RecyclerSweep>,
    stats: CollectionStats,
    last_stats: Option<CollectionStats>,
    collection_start: Instant,
    last_collection_end: Instant,
    in_dispose: bool,
}

impl Recycler {
    pub fn new(
        context: &Arc<ProcessContext>,
        options: Options,
        kinds: ObjectKindTable,
        host: Arc<dyn HostBinding>,
    ) -> Self {
        let card_table = context.card_table().clone();
        let page_allocator = Arc::new(PageAllocator::with_custom_heap(
            card_table.clone(),
            options.max_heap_size,
            options.max_free_page_count,
            options.pre_reserved_region_size,
            options.code_integrity_guard,
        ));
        let block_map = Arc::new(BlockMap::new());
        let kinds = Arc::new(kinds);
        let mark_context = MarkContext::new(block_map.clone(), kinds.clone(), options.mark_stack_max_chunks);
        let id = context.register();
        info!(
            "Created {} with {} object kinds, heap limit {} bytes",
            id,
            kinds.len(),
            options.max_heap_size
        );
        Recycler {
            id,
            context: context.clone(),
            heap: HeapInfo::new(page_allocator, block_map),
            card_table,
            state: Arc::new(Atomic::new(CollectionState::NotCollecting)),
            roots: Arc::new(RootSet::new()),
            weak_refs: WeakReferenceMap::new(),
            weak_rescan_roots: Mutex::new(vec![]),
            mark_context,
            concurrent_mark_slot: Arc::new(Mutex::new(None)),
            background: None,
            background_unavailable: false,
            background_pending: false,
            parallel: ParallelMarker::new(options.parallel_mark_threads, options.parallel_mark_min_chunks),
            sweep_manager: RecyclerSweepManager::new(&options),
            sweep: None,
            stats: CollectionStats::default(),
            last_stats: None,
            collection_start: Instant::now(),
            last_collection_end: Instant::now(),
            in_dispose: false,
            options,
            host,
            kinds,
        }
    }

    pub fn id(&self) -> RecyclerId {
        self.id
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn kinds(&self) -> &ObjectKindTable {
        &self.kinds
    }

    pub fn collection_state(&self) -> CollectionState {
        self.state.load(Ordering::Acquire)
    }

    /// Read the collection state from another thread.
    pub fn collection_state_watcher(&self) -> CollectionStateWatcher {
        CollectionStateWatcher::new(self.state.clone())
    }

    fn set_state(&self, state: CollectionState) {
        let old = self.state.swap(state, Ordering::AcqRel);
        debug!("{}: {} -> {}", self.id, old, state);
    }

    pub fn is_collection_in_progress(&self) -> bool {
        self.collection_state().is_collecting()
    }

    pub fn last_collection_stats(&self) -> Option<&CollectionStats> {
        self.last_stats.as_ref()
    }

    pub fn page_allocator(&self) -> &Arc<PageAllocator> {
        self.heap.page_allocator()
    }

    pub fn card_table(&self) -> &Arc<CardTable> {
        &self.card_table
    }

    /// Pin `object`. Returns its new pin count.
    pub fn root_add_ref(&mut self, object: Address) -> usize {
        self.roots.pin(object)
    }

    /// Drop one pin of `object`. Returns false if it was not pinned.
    pub fn root_release(&mut self, object: Address) -> bool {
        self.roots.unpin(object).is_some()
    }

    pub fn pin_count(&self, object: Address) -> usize {
        self.roots.pin_count(object)
    }

    /// Register host memory whose words are scanned conservatively as roots.
    pub fn add_guest_arena(&mut self, start: Address, size: usize) -> GuestArenaId {
        self.roots.add_arena(start, size)
    }

    pub fn remove_guest_arena(&mut self, id: GuestArenaId) -> bool {
        self.roots.remove_arena(id)
    }

    pub fn create_weak_reference(&mut self, object: Address) -> WeakReference {
        self.weak_refs.get_or_create(object)
    }

    /// The target of `weak`, or `None` once it has been collected. A target
    /// read while marking is in progress is kept alive by this collection.
    pub fn get_weak_reference(&self, weak: &WeakReference) -> Option<Address> {
        let target = weak.peek()?;
        if self.collection_state().is_marking() {
            self.weak_rescan_roots.lock().unwrap().push(target);
        }
        Some(target)
    }

    pub fn weak_reference_count(&self) -> usize {
        self.weak_refs.len()
    }

    /// Record a reference store into `slot`. Every write of a pointer into a
    /// recycler object has to go through this (or [`Recycler::write_reference`]).
    #[inline(always)]
    pub fn write_barrier(&self, slot: Address) {
        let dirtied = self.card_table.set_dirty(slot);
        if cfg!(feature = "verify_write_barrier") && !dirtied && self.heap.find_object(slot).is_some() {
            crate::util::fatal::fatal_error(
                crate::util::fatal::FatalError::WriteBarrierVerification,
                &format!("store to {} is not covered by the card table", slot),
            );
        }
    }

    /// Store `value` into `slot`, then dirty its card.
    ///
    /// # Safety
    /// `slot` must be a writable, word-aligned address.
    pub unsafe fn write_reference(&self, slot: Address, value: Address) {
        slot.store::<Address>(value);
        self.write_barrier(slot);
    }

    /// Visit every allocated object that carries all of `filter`'s bits.
    /// Returns how many were visited.
    pub fn enumerate_objects<F>(&self, filter: ObjectAttributes, f: F) -> usize
    where
        F: FnMut(Address, usize, ObjectAttributes),
    {
        self.heap.enumerate_objects(filter, f)
    }

    /// The object `addr` points into, with its size.
    pub fn find_object(&self, addr: Address) -> Option<(Address, usize)> {
        self.heap.find_object(addr)
    }

    /// Is `object` the start of an allocated object?
    pub fn is_allocated_object(&self, object: Address) -> bool {
        self.heap.find_object(object).is_some_and(|(start, _)| start == object)
    }

    /// Was `object` found reachable by the last mark?
    pub fn is_marked(&self, object: Address) -> bool {
        self.heap.is_marked_object(object)
    }

    /// Decommit every free page the page allocator holds. Returns the number
    /// of pages decommitted.
    pub fn decommit_now(&mut self) -> usize {
        let pages = self.page_allocator().decommit_now();
        debug!("{}: decommitted {} pages", self.id, pages);
        pages
    }

    pub fn used_pages(&self) -> usize {
        self.page_allocator().used_pages()
    }

    pub fn block_count(&self) -> usize {
        self.heap.block_count()
    }

    /// Check the heap's block list bookkeeping.
    pub fn verify(&self) -> Result<(), String> {
        if self.heap.is_sweeping() {
            return Ok(());
        }
        self.heap.verify_block_lists()
    }

    fn ensure_background(&mut self) -> bool {
        if self.background.is_none() && !self.background_unavailable {
            self.background = BackgroundExecutor::new(self.host.thread_service());
            self.background_unavailable = self.background.is_none();
        }
        self.background.is_some()
    }

    /// Hand a job to the background executor. A rejected job comes back.
    fn submit_background(&mut self, job: Job) -> Result<(), Job> {
        debug_assert!(!self.background_pending);
        let result = match self.background.as_ref() {
            Some(background) => background.submit(job),
            None => Err(job),
        };
        if result.is_ok() {
            self.background_pending = true;
        }
        result
    }

    /// Wait for the outstanding background job. Returns false on timeout.
    fn wait_for_background(&mut self, timeout: Option<std::time::Duration>) -> bool {
        if !self.background_pending {
            return true;
        }
        let done = self
            .background
            .as_ref()
            .map_or(true, |background| background.wait_done(timeout));
        if done {
            self.background_pending = false;
        }
        done
    }

    fn default_allocator() -> AllocatorId {
        AllocatorRing::default_allocator()
    }
}

impl Drop for Recycler {
    fn drop(&mut self) {
        let panicking = std::thread::panicking();
        if !panicking && self.is_collection_in_progress() {
            self.finish_concurrent_collection(INFINITE);
        }
        if !panicking && !self.is_collection_in_progress() {
            self.dispose_at_shutdown();
        }
        self.set_state(CollectionState::Exit);
        self.weak_refs.clear_all();
        self.parallel.shutdown();
        // Joins the background thread. Blocks it still has out are not
        // returned to the page allocator.
        self.background = None;
        self.heap.release_all();
        self.context.unregister(self.id);
        info!("{} shut down", self.id);
    }
}
