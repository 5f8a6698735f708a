//! One sweep pass. The session lives from `StopAllocationBeforeSweep` until the
//! swept blocks have been transferred back to their buckets, so it outlives a
//! thread hop when the sweep runs in the background.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use enum_map::EnumMap;

use crate::policy::heap_block::{BlockSweepResult, SweepState};

/// Sweep totals. Shared with the background sweeper, hence atomics.
#[derive(Default)]
pub struct SweepCounters {
    freed_bytes: AtomicUsize,
    freed_objects: AtomicUsize,
    live_objects: AtomicUsize,
    finalized_objects: AtomicUsize,
    blocks: EnumMap<SweepState, AtomicUsize>,
}

impl SweepCounters {
    pub fn record(&self, result: &BlockSweepResult, state: SweepState) {
        self.freed_bytes.fetch_add(result.freed_bytes, Ordering::Relaxed);
        self.freed_objects.fetch_add(result.freed_objects, Ordering::Relaxed);
        self.live_objects.fetch_add(result.live_objects, Ordering::Relaxed);
        self.finalized_objects
            .fetch_add(result.finalized_objects, Ordering::Relaxed);
        self.blocks[state].fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes released outside of a block sweep, e.g. a whole large block.
    pub fn record_freed_bytes(&self, bytes: usize) {
        self.freed_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn freed_bytes(&self) -> usize {
        self.freed_bytes.load(Ordering::Relaxed)
    }

    pub fn freed_objects(&self) -> usize {
        self.freed_objects.load(Ordering::Relaxed)
    }

    pub fn live_objects(&self) -> usize {
        self.live_objects.load(Ordering::Relaxed)
    }

    pub fn finalized_objects(&self) -> usize {
        self.finalized_objects.load(Ordering::Relaxed)
    }

    pub fn blocks(&self) -> EnumMap<SweepState, usize> {
        EnumMap::from_fn(|state| self.blocks[state].load(Ordering::Relaxed))
    }
}

pub struct RecyclerSweep {
    partial: bool,
    background: bool,
    /// Touched blocks freeing less than this share of their slots are held
    /// back. Partial collections only.
    reuse_min_free_ratio: Option<f64>,
    counters: Arc<SweepCounters>,
    started: Instant,
}

impl RecyclerSweep {
    pub fn new(partial: bool, background: bool, reuse_min_free_ratio: f64) -> Self {
        debug_assert!(!(partial && background), "a partial sweep is always in-thread");
        RecyclerSweep {
            partial,
            background,
            reuse_min_free_ratio: partial.then_some(reuse_min_free_ratio),
            counters: Arc::new(SweepCounters::default()),
            started: Instant::now(),
        }
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn in_background(&self) -> bool {
        self.background
    }

    /// The sweep ended up in-thread after all.
    pub fn set_in_thread(&mut self) {
        self.background = false;
    }

    pub fn reuse_min_free_ratio(&self) -> Option<f64> {
        self.reuse_min_free_ratio
    }

    pub fn counters(&self) -> &Arc<SweepCounters> {
        &self.counters
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }
}
