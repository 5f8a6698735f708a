//! Concurrent collection: the mark runs on the background thread while the
//! mutator allocates black and dirties cards, then the mutator finishes it
//! with a rescan. The sweep of the leaf and normal buckets may follow on the
//! background thread as well.

use std::time::Duration;

use super::{CollectionState, Recycler};
use crate::scheduler::Job;
use crate::util::constants::INFINITE;
use crate::util::write_barrier::CARD_RESCAN;

impl Recycler {
    /// Reset marks and hand the mark to the background thread. Returns false
    /// if there is no background thread to hand it to, in which case nothing
    /// was started.
    pub(super) fn start_concurrent_mark(&mut self, partial_requested: bool) -> bool {
        if !self.ensure_background() {
            return false;
        }
        self.begin_collection(false, partial_requested);
        self.stats.concurrent_mark = true;
        self.reset_marks();

        let fresh = self.mark_context.fork(self.options.mark_stack_max_chunks);
        let context = std::mem::replace(&mut self.mark_context, fresh);
        *self.concurrent_mark_slot.lock().unwrap() = Some(context);

        let slot = self.concurrent_mark_slot.clone();
        let roots = self.roots.clone();
        let card_table = self.card_table.clone();
        let job: Job = Box::new(move || {
            let context = slot.lock().unwrap().take();
            let Some(mut context) = context else {
                return;
            };
            roots.scan(&mut context);
            context.drain();
            // One pass over the cards written so far, so the final rescan on
            // the mutator has less to do.
            let cards = context.rescan_dirty_cards(&card_table, CARD_RESCAN);
            trace!("Background rescan processed {} cards", cards);
            *slot.lock().unwrap() = Some(context);
        });

        self.set_state(CollectionState::ConcurrentMark);
        match self.submit_background(job) {
            Ok(()) => {
                debug!("{}: concurrent mark started", self.id);
            }
            Err(job) => {
                warn!("{}: background mark rejected, collecting in-thread", self.id);
                self.stats.concurrent_mark = false;
                job();
                self.finish_concurrent_mark(INFINITE);
                self.finish_concurrent_collection(INFINITE);
            }
        }
        true
    }

    /// Finish whatever concurrent work is in progress. Returns true once no
    /// collection is in progress anymore; false if the background thread did
    /// not finish within `timeout`, in which case nothing changed.
    pub fn finish_concurrent_collection(&mut self, timeout: Option<Duration>) -> bool {
        if self.collection_state() == CollectionState::ConcurrentMark && !self.finish_concurrent_mark(timeout) {
            return false;
        }
        if matches!(
            self.collection_state(),
            CollectionState::ConcurrentSweep | CollectionState::TransferSweptWait
        ) && !self.finish_concurrent_collect(timeout)
        {
            return false;
        }
        !self.is_collection_in_progress()
    }

    /// Take the mark back from the background thread and complete it on the
    /// mutator: the pins and arenas again, the roots only the mutator can
    /// see, then the cards written while the background mark ran. Continues into the sweep. Returns false
    /// if the background mark did not finish within `timeout`.
    pub fn finish_concurrent_mark(&mut self, timeout: Option<Duration>) -> bool {
        if self.collection_state() != CollectionState::ConcurrentMark {
            return false;
        }
        if !self.wait_for_background(timeout) {
            trace!("{}: background mark still running", self.id);
            return false;
        }

        let context = self.concurrent_mark_slot.lock().unwrap().take();
        match context {
            Some(context) => self.mark_context = context,
            None => {
                // The job never ran. Everything marked so far stays marked;
                // retrace from the marked set.
                warn!("{}: background mark did not run, marking in-thread", self.id);
                self.mark_context.rescan_all_marked();
            }
        }

        self.set_state(CollectionState::RescanFindRoots);
        // Pins and arenas may have been added after the background scan.
        let pinned = self.roots.scan(&mut self.mark_context);
        trace!("{}: rescanned {} pinned objects", self.id, pinned);
        self.roots.drain_pending_unpins();
        self.scan_mutator_roots();

        self.set_state(CollectionState::RescanMark);
        self.drain_mark_stack();
        let cards = self.mark_context.rescan_dirty_cards(&self.card_table, CARD_RESCAN);
        self.stats.rescanned_cards += cards;
        debug!("{}: rescan processed {} dirty cards", self.id, cards);
        self.drain_mark_stack();
        self.mark_finalizable_children();

        self.sweep_heap(false, true);
        true
    }

    /// Wait for the background sweep and relink what it swept. Returns false
    /// if it did not finish within `timeout`.
    pub fn finish_concurrent_collect(&mut self, timeout: Option<Duration>) -> bool {
        let state = self.collection_state();
        if !matches!(
            state,
            CollectionState::ConcurrentSweep | CollectionState::TransferSweptWait
        ) {
            return !state.is_collecting();
        }
        self.set_state(CollectionState::TransferSweptWait);
        if !self.wait_for_background(timeout) {
            self.set_state(CollectionState::ConcurrentSweep);
            return false;
        }
        self.set_state(CollectionState::TransferSwept);
        self.heap.transfer_swept();
        self.finish_sweep();
        true
    }
}
