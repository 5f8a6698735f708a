//! What one collection did. The recycler fills a [`CollectionStats`] while a
//! collection runs and keeps the last finished one.

use enum_map::EnumMap;

use crate::policy::heap_block::SweepState;
use crate::policy::sweep::SweepCounters;

#[derive(Clone, Debug, Default)]
pub struct CollectionStats {
    /// Only touched blocks were swept, on top of sticky marks.
    pub partial: bool,
    /// The request asked for a partial collection, whether or not it got one.
    pub partial_requested: bool,
    pub concurrent_mark: bool,
    pub concurrent_sweep: bool,
    pub parallel_mark: bool,
    pub marked_objects: usize,
    pub marked_bytes: usize,
    pub freed_bytes: usize,
    pub freed_objects: usize,
    pub live_objects: usize,
    pub finalized_objects: usize,
    /// Blocks per post-sweep state.
    pub swept_blocks: EnumMap<SweepState, usize>,
    /// Cards retraced by rescans, dirty-card roots included.
    pub rescanned_cards: usize,
    /// Times marking restarted after the mark stack overflowed.
    pub mark_oom_retries: usize,
    /// Pages of empty blocks released when the collection finished.
    pub released_pages: usize,
    pub elapsed_ms: u128,
}

impl CollectionStats {
    pub(crate) fn absorb_sweep(&mut self, counters: &SweepCounters) {
        self.freed_bytes += counters.freed_bytes();
        self.freed_objects += counters.freed_objects();
        self.live_objects += counters.live_objects();
        self.finalized_objects += counters.finalized_objects();
        for (state, count) in counters.blocks() {
            self.swept_blocks[state] += count;
        }
    }

    pub fn swept_block_count(&self) -> usize {
        self.swept_blocks.values().sum()
    }
}

impl std::fmt::Display for CollectionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{} collection: marked {} objects ({} bytes), freed {} bytes, {} finalized, {} cards rescanned, {} ms",
            if self.partial { "partial" } else { "full" },
            if self.concurrent_mark { ", concurrent mark" } else { "" },
            if self.concurrent_sweep { ", concurrent sweep" } else { "" },
            self.marked_objects,
            self.marked_bytes,
            self.freed_bytes,
            self.finalized_objects,
            self.rescanned_cards,
            self.elapsed_ms,
        )
    }
}
