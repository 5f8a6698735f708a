use std::ops::BitOr;
use std::time::{Duration, Instant};

use super::{CollectionState, CollectionStats, Recycler};
use crate::policy::sweep::{PartialAdjustment, RecyclerSweep};
use crate::scheduler::Job;
use crate::util::constants::INFINITE;
use crate::util::fatal::{fatal_error, FatalError};
use crate::util::write_barrier::CARD_SINCE_GC;

/// What a collection request asks for. Combine with `|`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct CollectionFlags(u32);

impl CollectionFlags {
    pub const NONE: CollectionFlags = CollectionFlags(0);
    /// Only collect if enough was allocated since the last collection.
    pub const ALLOC_SIZE: CollectionFlags = CollectionFlags(1 << 0);
    /// Only collect if the last collection finished long enough ago.
    pub const TIME: CollectionFlags = CollectionFlags(1 << 1);
    /// Mark in the background if possible.
    pub const CONCURRENT: CollectionFlags = CollectionFlags(1 << 2);
    /// Collect partially if the heuristics allow it.
    pub const PARTIAL: CollectionFlags = CollectionFlags(1 << 3);
    /// Keep collecting while dispose frees more.
    pub const EXHAUSTIVE: CollectionFlags = CollectionFlags(1 << 4);
    /// Finish everything before returning.
    pub const FORCE_IN_THREAD: CollectionFlags = CollectionFlags(1 << 5);
    /// Run dispose afterwards.
    pub const ALLOW_DISPOSE: CollectionFlags = CollectionFlags(1 << 6);

    pub const COLLECT_ON_ALLOCATION: CollectionFlags =
        Self::ALLOC_SIZE.union(Self::CONCURRENT).union(Self::PARTIAL);
    pub const COLLECT_NOW_DEFAULT: CollectionFlags = Self::ALLOW_DISPOSE;
    pub const COLLECT_NOW_FORCE_IN_THREAD: CollectionFlags = Self::FORCE_IN_THREAD;
    pub const COLLECT_NOW_EXHAUSTIVE: CollectionFlags = Self::FORCE_IN_THREAD
        .union(Self::EXHAUSTIVE)
        .union(Self::ALLOW_DISPOSE);
    pub const COLLECT_NOW_CONCURRENT: CollectionFlags = Self::CONCURRENT.union(Self::ALLOW_DISPOSE);
    pub const COLLECT_NOW_PARTIAL: CollectionFlags = Self::PARTIAL.union(Self::ALLOW_DISPOSE);
    pub const COLLECT_ON_IDLE: CollectionFlags = Self::TIME
        .union(Self::CONCURRENT)
        .union(Self::ALLOW_DISPOSE);

    pub const fn union(self, other: CollectionFlags) -> Self {
        CollectionFlags(self.0 | other.0)
    }

    pub const fn contains(self, other: CollectionFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CollectionFlags {
    type Output = CollectionFlags;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Collect-and-dispose rounds an exhaustive collection runs at most.
const MAX_EXHAUSTIVE_ROUNDS: usize = 3;

impl Recycler {
    /// Request a collection. Returns true if a collection ran to completion
    /// or was started in the background by this call.
    pub fn collect_now(&mut self, flags: CollectionFlags) -> bool {
        let state = self.collection_state();
        if state == CollectionState::Exit {
            return false;
        }
        if state.is_collecting() {
            let nonblocking = flags.contains(CollectionFlags::CONCURRENT)
                && !flags.contains(CollectionFlags::FORCE_IN_THREAD)
                && !flags.contains(CollectionFlags::EXHAUSTIVE);
            let timeout = if !nonblocking {
                INFINITE
            } else if flags.contains(CollectionFlags::ALLOC_SIZE)
                && self.heap.uncollected_new_page_count() >= self.options.max_uncollected_new_page_count
            {
                // The heap keeps growing while the background work lags.
                Some(Duration::from_millis(self.options.concurrent_wait_timeout_ms))
            } else {
                Some(Duration::ZERO)
            };
            let finished = self.finish_concurrent_collection(timeout);
            if finished && flags.contains(CollectionFlags::ALLOW_DISPOSE) {
                self.dispose();
            }
            if nonblocking || !finished {
                return finished;
            }
        }

        if !self.should_collect(flags) {
            if flags.contains(CollectionFlags::ALLOW_DISPOSE) {
                self.dispose();
            }
            return false;
        }

        let partial = flags.contains(CollectionFlags::PARTIAL) && self.options.partial_collect && {
            let rescan_bytes = self.heap.estimate_rescan_bytes(&self.card_table);
            self.sweep_manager.do_partial_collect_mode(&self.options, rescan_bytes)
        };
        let concurrent = !partial
            && flags.contains(CollectionFlags::CONCURRENT)
            && !flags.contains(CollectionFlags::FORCE_IN_THREAD)
            && self.options.concurrent_collect;

        if concurrent && self.start_concurrent_mark(flags.contains(CollectionFlags::PARTIAL)) {
            if !self.is_collection_in_progress() && flags.contains(CollectionFlags::ALLOW_DISPOSE) {
                self.dispose();
            }
            return true;
        }

        self.collect_in_thread(partial, flags.contains(CollectionFlags::PARTIAL));

        if flags.contains(CollectionFlags::EXHAUSTIVE) {
            for _ in 0..MAX_EXHAUSTIVE_ROUNDS {
                if self.in_dispose || !self.heap.has_pending_dispose() {
                    break;
                }
                self.dispose();
                self.collect_in_thread(false, false);
            }
        }
        if flags.contains(CollectionFlags::ALLOW_DISPOSE) {
            self.dispose();
        }
        true
    }

    fn should_collect(&self, flags: CollectionFlags) -> bool {
        if flags.contains(CollectionFlags::ALLOC_SIZE) {
            let new_pages = self.heap.uncollected_new_page_count();
            let alloc_bytes = self.heap.uncollected_alloc_bytes();
            if new_pages < self.sweep_manager.collection_trigger()
                && alloc_bytes < self.options.max_uncollected_alloc_bytes
            {
                trace!(
                    "No collection: {} new pages (trigger {}), {} bytes allocated",
                    new_pages,
                    self.sweep_manager.collection_trigger(),
                    alloc_bytes
                );
                return false;
            }
        }
        if flags.contains(CollectionFlags::TIME)
            && self.last_collection_end.elapsed() < Duration::from_millis(self.options.collect_time_interval_ms)
        {
            trace!("No collection: the last one finished {:?} ago", self.last_collection_end.elapsed());
            return false;
        }
        true
    }

    pub(super) fn begin_collection(&mut self, partial: bool, partial_requested: bool) {
        debug_assert!(!self.is_collection_in_progress());
        debug_assert!(self.sweep.is_none());
        self.stats = CollectionStats {
            partial,
            partial_requested,
            ..Default::default()
        };
        self.collection_start = Instant::now();
        self.mark_context.clear();
        self.mark_context.reset_counters();
        debug!(
            "{}: {} collection, {} pages in use",
            self.id,
            if partial { "partial" } else { "full" },
            self.used_pages()
        );
    }

    pub(super) fn reset_marks(&mut self) {
        self.set_state(CollectionState::ResetMarks);
        self.heap.reset_marks(&self.card_table);
    }

    /// A whole collection on the calling thread.
    fn collect_in_thread(&mut self, partial: bool, partial_requested: bool) {
        self.begin_collection(partial, partial_requested);
        if !partial {
            self.reset_marks();
        }

        self.set_state(CollectionState::FindRoots);
        self.roots.scan(&mut self.mark_context);
        self.roots.drain_pending_unpins();
        self.scan_mutator_roots();
        if partial {
            // Marks are sticky, so only objects written since the last
            // collection can point at something unmarked.
            let cards = self.mark_context.rescan_dirty_cards(&self.card_table, CARD_SINCE_GC);
            self.stats.rescanned_cards += cards;
        }

        self.set_state(CollectionState::Mark);
        self.drain_mark_stack();
        self.mark_finalizable_children();
        self.sweep_heap(partial, false);
    }

    /// The roots only the mutator thread can enumerate: the host's own, the
    /// stack, objects waiting for dispose and weak targets read while marking.
    pub(super) fn scan_mutator_roots(&mut self) {
        let host = self.host.clone();
        host.scan_external_roots(&mut self.mark_context);

        if self.options.scan_stack {
            match host.stack_range() {
                Some((low, high)) => {
                    let bytes = super::roots::scan_stack(low, high, &mut self.mark_context);
                    trace!("Scanned {} bytes of stack", bytes);
                }
                None => warn!("scan_stack is set but the host reports no stack range"),
            }
        }

        // Finalized objects keep what they reference until they are disposed.
        for object in self.heap.pending_dispose_objects() {
            self.mark_context.scan_object(object.object, object.size, object.kind);
        }

        let weak_roots = std::mem::take(&mut *self.weak_rescan_roots.lock().unwrap());
        for target in weak_roots {
            self.mark_context.mark_candidate(target);
        }
    }

    /// Drain the mark stack, in parallel when there is enough work, and
    /// recover from mark stack overflow.
    pub(super) fn drain_mark_stack(&mut self) {
        if self.parallel.should_share(&self.mark_context) {
            let phase = self.collection_state();
            self.set_state(CollectionState::ParallelMark);
            self.parallel.drain_shared(&mut self.mark_context);
            self.set_state(phase);
            self.stats.parallel_mark = true;
        } else {
            self.mark_context.drain();
        }
        self.recover_from_mark_overflow();
    }

    /// Every object the overflowed stack dropped is marked but untraced.
    /// Retrace all marked objects, with as much memory handed back to the OS
    /// as possible, until a pass completes without overflowing.
    fn recover_from_mark_overflow(&mut self) {
        let mut retries = 0;
        while self.mark_context.has_out_of_memory() {
            retries += 1;
            if retries > self.options.mark_oom_max_retries {
                fatal_error(
                    FatalError::MarkStackOutOfMemory,
                    &format!("marking still overflows after {} rescans", retries - 1),
                );
            }
            let decommitted = self.page_allocator().decommit_now();
            warn!(
                "{}: mark stack overflowed, rescanning marked objects (attempt {}, {} pages decommitted)",
                self.id, retries, decommitted
            );
            self.mark_context.clear_out_of_memory();
            self.mark_context.rescan_all_marked();
        }
        self.stats.mark_oom_retries += retries;
    }

    /// Unreachable finalizable objects are finalized by the sweep and must
    /// stay intact until they are disposed, so what they reference has to
    /// survive this collection. Trace their fields, then unmark any of them
    /// the trace reached so every one of them is finalized.
    pub(super) fn mark_finalizable_children(&mut self) {
        let unreachable = self.heap.unmarked_finalizable_objects();
        if unreachable.is_empty() {
            return;
        }
        for (header, slot) in unreachable.iter() {
            let attributes = header.attributes(*slot);
            self.mark_context
                .scan_object(header.slot_address(*slot), header.object_size(), attributes.kind());
        }
        self.drain_mark_stack();
        for (header, slot) in unreachable.iter() {
            header.set_mark(*slot, false);
        }
        debug!("{}: traced {} unreachable finalizable objects", self.id, unreachable.len());
    }

    /// Clear the weak references whose target was not marked.
    fn sweep_weak_references(&mut self) {
        let heap = &self.heap;
        let cleared = self.weak_refs.sweep(|target| heap.is_marked_object(target));
        if cleared > 0 {
            debug!("{}: cleared {} weak references", self.id, cleared);
        }
    }

    /// Sweep the heap. With `background`, the leaf and normal buckets are
    /// swept by the background thread and the collection finishes in
    /// [`Recycler::finish_concurrent_collect`].
    pub(super) fn sweep_heap(&mut self, partial: bool, background: bool) {
        self.stats.marked_objects += self.mark_context.marked_objects();
        self.stats.marked_bytes += self.mark_context.marked_bytes();
        self.mark_context.reset_counters();

        self.set_state(CollectionState::Sweep);
        self.sweep_weak_references();
        self.heap.stop_allocation_before_sweep();

        let background = background && self.options.concurrent_sweep_for(partial);
        let mut sweep = RecyclerSweep::new(partial, background, self.options.partial_collect_reuse_min_free_ratio);
        let work = self.heap.sweep(&sweep, &self.kinds, background);
        if !work.is_empty() {
            let counters = sweep.counters().clone();
            let job: Job = Box::new(move || {
                for bucket in work {
                    bucket.run(&counters);
                }
            });
            self.set_state(CollectionState::ConcurrentSweep);
            match self.submit_background(job) {
                Ok(()) => {
                    self.stats.concurrent_sweep = true;
                    self.sweep = Some(sweep);
                    return;
                }
                Err(job) => {
                    warn!("{}: background sweep rejected, sweeping in-thread", self.id);
                    job();
                    self.heap.transfer_swept();
                    sweep.set_in_thread();
                }
            }
        }
        self.sweep = Some(sweep);
        self.finish_sweep();
    }

    /// Account for the finished sweep, settle partial collection heuristics
    /// and end the collection.
    pub(super) fn finish_sweep(&mut self) {
        let Some(sweep) = self.sweep.take() else {
            return;
        };
        self.stats.absorb_sweep(sweep.counters());
        trace!("{}: sweep took {} ms", self.id, sweep.elapsed_ms());
        if sweep.is_partial() {
            let pending = self.heap.pending_sweep_free_bytes();
            let adjustment = self.sweep_manager.adjust_partial_heuristics(
                &self.options,
                self.stats.freed_bytes,
                self.heap.uncollected_alloc_bytes(),
                pending,
            );
            let retire = matches!(adjustment, PartialAdjustment::Retire { .. });
            self.heap.finish_pending_sweep(retire);
        } else {
            self.sweep_manager.on_full_collection(&self.options);
            self.stats.released_pages = self.heap.trim_empty_blocks(self.options.empty_block_retention);
        }
        self.finish_collection();
    }

    fn finish_collection(&mut self) {
        self.set_state(CollectionState::PostCollectionCallback);
        self.page_allocator().trim_free_pages();
        self.heap.reset_uncollected();
        self.stats.elapsed_ms = self.collection_start.elapsed().as_millis();
        let stats = std::mem::take(&mut self.stats);
        info!("{}: {}", self.id, stats);
        self.host.post_collection(&stats);
        self.last_stats = Some(stats);
        self.last_collection_end = Instant::now();
        self.set_state(CollectionState::NotCollecting);

        if cfg!(debug_assertions) {
            if let Err(e) = self.heap.verify_block_lists() {
                fatal_error(FatalError::BadPageState, &e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_sets() {
        let flags = CollectionFlags::COLLECT_ON_ALLOCATION;
        assert!(flags.contains(CollectionFlags::ALLOC_SIZE | CollectionFlags::PARTIAL));
        assert!(!flags.contains(CollectionFlags::FORCE_IN_THREAD));
        assert!(CollectionFlags::COLLECT_NOW_EXHAUSTIVE.contains(CollectionFlags::ALLOW_DISPOSE));
        assert!(CollectionFlags::NONE.contains(CollectionFlags::NONE));
    }
}
