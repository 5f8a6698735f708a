//! Partial collection heuristics.
//!
//! Before a collection, [`RecyclerSweepManager::do_partial_collect_mode`]
//! decides whether it may be partial: only blocks touched since the previous
//! collection are swept, and the cards written since then act as extra roots.
//! After the sweep, [`RecyclerSweepManager::adjust_partial_heuristics`] judges
//! whether that paid off and moves the next collection trigger between
//! `min_uncollected_new_page_count` and `max_uncollected_new_page_count`.
//!
//! None of this affects correctness. A bad decision costs throughput or
//! memory, never a live object.

use crate::util::options::Options;

/// What to do with the blocks a partial sweep held back.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PartialAdjustment {
    /// The collection freed too little. Reuse the held-back blocks now and
    /// make the next collection a full one.
    Abandon { efficacy: f64 },
    /// Keep them out of allocation until the next full collection.
    Retire { efficacy: f64 },
}

pub struct RecyclerSweepManager {
    /// New pages since the last collection that trigger the next one.
    collection_trigger: usize,
    /// Free bytes sitting in blocks retired by partial collections.
    unused_partial_free_bytes: usize,
    full_collected: bool,
    force_full: bool,
    in_partial_collect_mode: bool,
    last_rescan_bytes: usize,
}

impl RecyclerSweepManager {
    pub fn new(options: &Options) -> Self {
        RecyclerSweepManager {
            collection_trigger: options.min_uncollected_new_page_count,
            unused_partial_free_bytes: 0,
            full_collected: false,
            force_full: false,
            in_partial_collect_mode: false,
            last_rescan_bytes: 0,
        }
    }

    pub fn collection_trigger(&self) -> usize {
        self.collection_trigger
    }

    pub fn unused_partial_free_bytes(&self) -> usize {
        self.unused_partial_free_bytes
    }

    pub fn in_partial_collect_mode(&self) -> bool {
        self.in_partial_collect_mode
    }

    pub fn last_rescan_bytes(&self) -> usize {
        self.last_rescan_bytes
    }

    /// May the collection about to start be partial? `rescan_bytes` is the
    /// memory covered by cards dirtied since the last collection.
    pub fn do_partial_collect_mode(&mut self, options: &Options, rescan_bytes: usize) -> bool {
        self.last_rescan_bytes = rescan_bytes;
        let enter = if !self.full_collected {
            debug!("Partial collection refused: no full collection yet");
            false
        } else if self.force_full {
            debug!("Partial collection refused: the last one was not effective");
            false
        } else if rescan_bytes > options.partial_collect_max_rescan_bytes {
            info!(
                "Partial collection refused: {} to rescan, limit {}",
                rescan_bytes, options.partial_collect_max_rescan_bytes
            );
            false
        } else if self.unused_partial_free_bytes > options.partial_collect_max_unused_free_bytes {
            info!(
                "Partial collection refused: {} unused in retired blocks, limit {}",
                self.unused_partial_free_bytes, options.partial_collect_max_unused_free_bytes
            );
            false
        } else {
            true
        };
        self.in_partial_collect_mode = enter;
        enter
    }

    /// Judge a finished partial collection. `pending_free_bytes` is the free
    /// space in the blocks it held back.
    pub fn adjust_partial_heuristics(
        &mut self,
        options: &Options,
        freed_bytes: usize,
        alloc_bytes: usize,
        pending_free_bytes: usize,
    ) -> PartialAdjustment {
        debug_assert!(self.in_partial_collect_mode);
        let efficacy = if alloc_bytes == 0 {
            if freed_bytes == 0 {
                0.0
            } else {
                1.0
            }
        } else {
            (freed_bytes as f64 / alloc_bytes as f64).min(1.0)
        };

        if efficacy < options.partial_collect_min_efficacy {
            info!(
                "Partial collection freed {} of {} allocated (efficacy {:.3}); next collection is full",
                freed_bytes, alloc_bytes, efficacy
            );
            self.force_full = true;
            self.collection_trigger = options.min_uncollected_new_page_count;
            return PartialAdjustment::Abandon { efficacy };
        }

        let cost = if options.partial_collect_max_rescan_bytes == 0 {
            1.0
        } else {
            (self.last_rescan_bytes as f64 / options.partial_collect_max_rescan_bytes as f64)
                .min(1.0)
        };
        // Rescan cost and reuse efficacy weigh equally.
        let ratio = ((1.0 - cost) + efficacy) / 2.0;
        let min = options.min_uncollected_new_page_count;
        let max = options.max_uncollected_new_page_count.max(min);
        self.collection_trigger = min + ((max - min) as f64 * ratio) as usize;
        self.unused_partial_free_bytes += pending_free_bytes;
        debug!(
            "Partial collection efficacy {:.3}, rescan cost {:.3}: next trigger at {} new pages, {} unused",
            efficacy, cost, self.collection_trigger, self.unused_partial_free_bytes
        );
        PartialAdjustment::Retire { efficacy }
    }

    /// A full collection swept every block, so nothing is held back any more.
    pub fn on_full_collection(&mut self, options: &Options) {
        self.full_collected = true;
        self.force_full = false;
        self.in_partial_collect_mode = false;
        self.unused_partial_free_bytes = 0;
        self.collection_trigger = options.min_uncollected_new_page_count;
    }
}
