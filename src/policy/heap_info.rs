//! Every bucket of one recycler: a [`HeapBucket`] per size class and flavor,
//! plus a [`LargeBucket`] per flavor. Collection phases are driven through
//! here, and here is where the allocation volume the collection triggers
//! look at is counted.

use std::collections::HashSet;
use std::sync::Arc;

use enum_map::EnumMap;
use strum::IntoEnumIterator;

use crate::policy::allocator::{AllocatorId, AllocatorRing};
use crate::policy::attributes::ObjectAttributes;
use crate::policy::block_list::BlockArena;
use crate::policy::block_map::BlockMap;
use crate::policy::heap_block::{BlockHeader, BucketIndex};
use crate::policy::heap_bucket::{BlockEnv, BucketSweepWork, HeapBucket, PendingDisposeObject};
use crate::policy::large_bucket::LargeBucket;
use crate::policy::size_class::{BlockFlavor, SizeClass, BUCKET_COUNT};
use crate::policy::sweep::RecyclerSweep;
use crate::util::constants::BYTES_IN_CARD;
use crate::util::conversions;
use crate::util::error::AllocationError;
use crate::util::heap::PageAllocator;
use crate::util::write_barrier::{CardTable, CARD_RESCAN, CARD_SINCE_GC};
use crate::util::Address;
use crate::vm::ObjectKindTable;

pub struct HeapInfo {
    arena: BlockArena,
    buckets: EnumMap<BlockFlavor, Vec<HeapBucket>>,
    large: EnumMap<BlockFlavor, LargeBucket>,
    page_allocator: Arc<PageAllocator>,
    block_map: Arc<BlockMap>,
    /// Bytes allocated since the last collection.
    uncollected_alloc_bytes: usize,
    /// Pages taken from the page allocator since the last collection.
    uncollected_new_page_count: usize,
}

impl HeapInfo {
    pub fn new(page_allocator: Arc<PageAllocator>, block_map: Arc<BlockMap>) -> Self {
        HeapInfo {
            arena: BlockArena::new(),
            buckets: EnumMap::from_fn(|flavor| {
                (0..BUCKET_COUNT)
                    .map(|index| HeapBucket::new(flavor, SizeClass::from_index(index)))
                    .collect()
            }),
            large: EnumMap::from_fn(LargeBucket::new),
            page_allocator,
            block_map,
            uncollected_alloc_bytes: 0,
            uncollected_new_page_count: 0,
        }
    }

    pub fn block_map(&self) -> &Arc<BlockMap> {
        &self.block_map
    }

    pub fn page_allocator(&self) -> &Arc<PageAllocator> {
        &self.page_allocator
    }

    pub fn uncollected_alloc_bytes(&self) -> usize {
        self.uncollected_alloc_bytes
    }

    pub fn uncollected_new_page_count(&self) -> usize {
        self.uncollected_new_page_count
    }

    pub fn reset_uncollected(&mut self) {
        self.uncollected_alloc_bytes = 0;
        self.uncollected_new_page_count = 0;
    }

    /// Add an allocation cursor to every bucket. The rings grow in lock
    /// step, so one id names the cursor in all of them.
    pub fn add_allocator(&mut self) -> AllocatorId {
        let mut added = None;
        for bucket in self.buckets.values_mut().flatten() {
            let id = bucket.allocators().add();
            debug_assert!(added.map_or(true, |added| added == id));
            added = Some(id);
        }
        added.unwrap_or_else(AllocatorRing::default_allocator)
    }

    pub fn remove_allocator(&mut self, allocator: AllocatorId) {
        debug_assert_ne!(allocator, AllocatorRing::default_allocator());
        for bucket in self.buckets.values_mut().flatten() {
            bucket.allocators().remove(allocator);
        }
    }

    /// The lock-free part of allocation. Large objects always need a new
    /// block, so they never succeed here.
    pub fn try_alloc(
        &mut self,
        size: usize,
        attributes: ObjectAttributes,
        black: bool,
        allocator: AllocatorId,
        concurrent_sweep_alloc: bool,
    ) -> Option<Address> {
        let class = SizeClass::for_size(size)?;
        let bucket = &mut self.buckets[BlockFlavor::of(attributes)][class.index];
        let addr = bucket.try_alloc(
            &mut self.arena,
            &self.block_map,
            allocator,
            attributes,
            black,
            concurrent_sweep_alloc,
        )?;
        self.uncollected_alloc_bytes += class.object_size;
        Some(addr)
    }

    /// Allocate from a new block (or a recycled empty one).
    pub fn alloc_from_new_block(
        &mut self,
        size: usize,
        attributes: ObjectAttributes,
        black: bool,
        allocator: AllocatorId,
    ) -> Result<Address, AllocationError> {
        let env = BlockEnv {
            page_allocator: &self.page_allocator,
            block_map: &self.block_map,
        };
        let flavor = BlockFlavor::of(attributes);
        let (addr, pages, bytes) = match SizeClass::for_size(size) {
            Some(class) => {
                let (addr, pages) = self.buckets[flavor][class.index].alloc_from_new_block(
                    &mut self.arena,
                    env,
                    allocator,
                    attributes,
                    black,
                )?;
                (addr, pages, class.object_size)
            }
            None => {
                let (addr, pages) = self.large[flavor].alloc(&mut self.arena, env, size, attributes, black)?;
                (addr, pages, conversions::pages_to_bytes(pages))
            }
        };
        self.uncollected_new_page_count += pages;
        self.uncollected_alloc_bytes += bytes;
        Ok(addr)
    }

    /// Return a small or medium leaf or normal object outside of a
    /// collection. Only exact object addresses are accepted.
    pub fn explicit_free(&mut self, object: Address) -> bool {
        let Some(header) = self.block_map.find(object) else {
            return false;
        };
        let Some(slot) = header.slot_of(object) else {
            return false;
        };
        if header.slot_address(slot) != object {
            return false;
        }
        match header.bucket() {
            BucketIndex::Sized(flavor, index) if flavor != BlockFlavor::Finalizable => {
                self.buckets[flavor][index].explicit_free(&mut self.arena, &header, slot)
            }
            _ => false,
        }
    }

    /// Clear every mark, and both dirty bits of every card of the heap.
    pub fn reset_marks(&self, card_table: &CardTable) {
        for header in self.block_map.blocks() {
            header.reset_marks();
            card_table.clear_range(
                header.start(),
                conversions::pages_to_bytes(header.pages()),
                CARD_RESCAN | CARD_SINCE_GC,
            );
        }
    }

    /// Bytes covered by cards written since the last collection found its
    /// roots. This is what a partial collection would have to rescan.
    pub fn estimate_rescan_bytes(&self, card_table: &CardTable) -> usize {
        self.block_map
            .blocks()
            .iter()
            .map(|header| {
                card_table.count_dirty(
                    header.start(),
                    conversions::pages_to_bytes(header.pages()),
                    CARD_SINCE_GC,
                )
            })
            .sum::<usize>()
            * BYTES_IN_CARD
    }

    pub fn stop_allocation_before_sweep(&mut self) {
        for bucket in self.buckets.values_mut().flatten() {
            bucket.stop_allocation_before_sweep();
        }
    }

    /// Sweep the heap. Finalizable and large buckets are always swept here,
    /// first, so dispose sees a heap nothing has been torn out of yet. With
    /// `background`, the leaf and normal buckets are handed back as work for
    /// the background sweeper instead of being swept.
    pub fn sweep(&mut self, sweep: &RecyclerSweep, kinds: &ObjectKindTable, background: bool) -> Vec<BucketSweepWork> {
        let touched_only = sweep.is_partial();
        let env = BlockEnv {
            page_allocator: &self.page_allocator,
            block_map: &self.block_map,
        };
        for bucket in self.buckets[BlockFlavor::Finalizable].iter_mut() {
            bucket.sweep(&mut self.arena, sweep, Some(kinds), touched_only);
        }
        for (flavor, large) in self.large.iter_mut() {
            let kinds = (flavor == BlockFlavor::Finalizable).then_some(kinds);
            large.sweep(&mut self.arena, env, sweep, kinds, touched_only);
        }

        let mut work = vec![];
        for flavor in [BlockFlavor::Leaf, BlockFlavor::Normal] {
            for bucket in self.buckets[flavor].iter_mut() {
                if background {
                    let bucket_work = bucket.take_for_background_sweep(&mut self.arena);
                    if !bucket_work.is_empty() {
                        work.push(bucket_work);
                    }
                } else {
                    bucket.sweep(&mut self.arena, sweep, None, touched_only);
                }
            }
        }
        work
    }

    /// Finalize every finalizable object that is not waiting for dispose
    /// yet, reachable or not. Only used at shutdown. Returns how many were
    /// finalized.
    pub fn finalize_all(&mut self, kinds: &ObjectKindTable) -> usize {
        for header in self.block_map.blocks() {
            if header.flavor() == BlockFlavor::Finalizable {
                header.reset_marks();
            }
        }
        let sweep = RecyclerSweep::new(false, false, 0.0);
        let env = BlockEnv {
            page_allocator: &self.page_allocator,
            block_map: &self.block_map,
        };
        for bucket in self.buckets[BlockFlavor::Finalizable].iter_mut() {
            bucket.stop_allocation_before_sweep();
            bucket.sweep(&mut self.arena, &sweep, Some(kinds), false);
        }
        self.large[BlockFlavor::Finalizable].sweep(&mut self.arena, env, &sweep, Some(kinds), false);
        sweep.counters().finalized_objects()
    }

    /// Relink every block the background sweeper finished.
    pub fn transfer_swept(&mut self) {
        for bucket in self.buckets.values_mut().flatten() {
            bucket.transfer_swept(&mut self.arena);
        }
        debug_assert_eq!(self.arena.taken_count(), 0);
    }

    pub fn is_sweeping(&self) -> bool {
        self.arena.taken_count() > 0
    }

    pub fn pending_sweep_free_bytes(&self) -> usize {
        self.buckets
            .values()
            .flatten()
            .map(|bucket| bucket.pending_sweep_free_bytes(&self.arena))
            .sum()
    }

    /// See [`HeapBucket::finish_pending_sweep`].
    pub fn finish_pending_sweep(&mut self, retire: bool) -> usize {
        let arena = &mut self.arena;
        self.buckets
            .values_mut()
            .flatten()
            .map(|bucket| bucket.finish_pending_sweep(arena, retire))
            .sum()
    }

    /// Release empty blocks beyond `retain` per bucket. Returns pages released.
    pub fn trim_empty_blocks(&mut self, retain: usize) -> usize {
        let env = BlockEnv {
            page_allocator: &self.page_allocator,
            block_map: &self.block_map,
        };
        let arena = &mut self.arena;
        self.buckets
            .values_mut()
            .flatten()
            .map(|bucket| bucket.trim_empty_blocks(arena, env, retain))
            .sum()
    }

    pub fn pending_dispose_objects(&self) -> Vec<PendingDisposeObject> {
        let mut objects = vec![];
        for bucket in self.buckets[BlockFlavor::Finalizable].iter() {
            bucket.collect_pending_dispose(&self.arena, &mut objects);
        }
        self.large[BlockFlavor::Finalizable].collect_pending_dispose(&self.arena, &mut objects);
        objects
    }

    pub fn has_pending_dispose(&self) -> bool {
        !self.pending_dispose_objects().is_empty()
    }

    /// Free objects whose dispose has run. Returns the bytes freed.
    pub fn release_disposed(&mut self, objects: &[PendingDisposeObject]) -> usize {
        let env = BlockEnv {
            page_allocator: &self.page_allocator,
            block_map: &self.block_map,
        };
        let mut freed = 0;
        for object in objects {
            let Some(bucket) = self.arena.get(object.block).map(|b| b.header().bucket()) else {
                continue;
            };
            freed += match bucket {
                BucketIndex::Sized(flavor, index) => {
                    self.buckets[flavor][index].release_disposed(&mut self.arena, object.block, object.slot)
                }
                BucketIndex::Large(flavor) => {
                    self.large[flavor].release_disposed(&mut self.arena, env, object.block, object.slot)
                }
            };
        }
        freed
    }

    /// Finalizable objects the mark did not reach and that are not waiting
    /// for dispose already.
    pub fn unmarked_finalizable_objects(&self) -> Vec<(Arc<BlockHeader>, usize)> {
        let mut objects = vec![];
        for header in self.block_map.blocks() {
            if header.flavor() != BlockFlavor::Finalizable {
                continue;
            }
            let Some(block) = self.arena.get(header.id()) else {
                continue;
            };
            for slot in block.allocated_slots() {
                if header.attributes(slot).is_finalizable()
                    && !header.is_marked(slot)
                    && !block.is_pending_dispose(slot)
                {
                    objects.push((header.clone(), slot));
                }
            }
        }
        objects
    }

    /// Visit every allocated object whose attributes contain `filter`, in
    /// address order. Blocks out with the background sweeper are skipped.
    pub fn enumerate_objects<F>(&self, filter: ObjectAttributes, mut f: F) -> usize
    where
        F: FnMut(Address, usize, ObjectAttributes),
    {
        let mut count = 0;
        for header in self.block_map.blocks() {
            let Some(block) = self.arena.get(header.id()) else {
                continue;
            };
            for slot in block.allocated_slots() {
                let attributes = header.attributes(slot).sanitized();
                if attributes.contains(filter) {
                    f(header.slot_address(slot), header.object_size(), attributes);
                    count += 1;
                }
            }
        }
        count
    }

    /// Is `object` an allocated object whose mark bit is set?
    pub fn is_marked_object(&self, object: Address) -> bool {
        self.block_map
            .with_block(object, |header| {
                header
                    .slot_of(object)
                    .is_some_and(|slot| header.attributes(slot).is_allocated() && header.is_marked(slot))
            })
            .unwrap_or(false)
    }

    /// The start and size of the object `addr` points into, if any.
    pub fn find_object(&self, addr: Address) -> Option<(Address, usize)> {
        self.block_map
            .with_block(addr, |header| {
                let slot = header.slot_of(addr)?;
                header
                    .attributes(slot)
                    .is_allocated()
                    .then(|| (header.slot_address(slot), header.object_size()))
            })
            .flatten()
    }

    pub fn block_count(&self) -> usize {
        self.arena.live_count()
    }

    /// Check the list discipline: every block in the arena is chained into
    /// exactly one list of its own bucket, unless it is out being swept.
    pub fn verify_block_lists(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for flavor in BlockFlavor::iter() {
            for bucket in self.buckets[flavor].iter() {
                bucket.verify(&self.arena)?;
                for id in bucket.block_ids(&self.arena) {
                    if !seen.insert(id) {
                        return Err(format!("Block#{} is on two lists", id.index()));
                    }
                }
            }
            self.large[flavor].verify(&self.arena)?;
            for id in self.large[flavor].block_ids(&self.arena) {
                if !seen.insert(id) {
                    return Err(format!("large Block#{} is on two lists", id.index()));
                }
            }
        }
        let resident = self.arena.live_count() - self.arena.taken_count();
        if seen.len() != resident {
            return Err(format!(
                "{} blocks are listed but {} are in the arena",
                seen.len(),
                resident
            ));
        }
        Ok(())
    }

    /// Return every block's pages. Shutdown only.
    pub fn release_all(&mut self) {
        let env = BlockEnv {
            page_allocator: &self.page_allocator,
            block_map: &self.block_map,
        };
        for bucket in self.buckets.values_mut().flatten() {
            bucket.release_all(&mut self.arena, env);
        }
        for large in self.large.values_mut() {
            large.release_all(&mut self.arena, env);
        }
    }

    #[cfg(test)]
    pub(crate) fn bucket(&self, flavor: BlockFlavor, size: usize) -> Option<&HeapBucket> {
        SizeClass::for_size(size).map(|class| &self.buckets[flavor][class.index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::block_list::ListKind;
    use crate::util::constants::BYTES_IN_MBYTE;

    fn heap() -> HeapInfo {
        let card_table = Arc::new(CardTable::new());
        HeapInfo::new(
            Arc::new(PageAllocator::new(card_table, 64 * BYTES_IN_MBYTE, 1024)),
            Arc::new(BlockMap::new()),
        )
    }

    fn alloc(heap: &mut HeapInfo, size: usize, attributes: ObjectAttributes) -> Address {
        let allocator = AllocatorRing::default_allocator();
        match heap.try_alloc(size, attributes, false, allocator, false) {
            Some(addr) => addr,
            None => heap.alloc_from_new_block(size, attributes, false, allocator).unwrap(),
        }
    }

    fn full_sweep(heap: &mut HeapInfo) -> RecyclerSweep {
        let sweep = RecyclerSweep::new(false, false, 0.25);
        heap.stop_allocation_before_sweep();
        let work = heap.sweep(&sweep, &ObjectKindTable::new(), false);
        assert!(work.is_empty());
        sweep
    }

    #[test]
    fn unmarked_objects_are_swept_into_empty_blocks() {
        let mut heap = heap();
        let objects: Vec<Address> = (0..300).map(|_| alloc(&mut heap, 48, ObjectAttributes::LEAF)).collect();
        assert_eq!(heap.uncollected_alloc_bytes(), 300 * 48);
        assert!(heap.uncollected_new_page_count() > 0);
        heap.verify_block_lists().unwrap();

        let sweep = full_sweep(&mut heap);
        assert_eq!(sweep.counters().freed_objects(), objects.len());
        let bucket = heap.bucket(BlockFlavor::Leaf, 48).unwrap();
        assert_eq!(bucket.list_len(ListKind::Allocable), 0);
        assert_eq!(bucket.list_len(ListKind::Full), 0);
        assert!(bucket.list_len(ListKind::Empty) > 0);
        assert_eq!(heap.enumerate_objects(ObjectAttributes::NONE, |_, _, _| {}), 0);
        heap.verify_block_lists().unwrap();

        let released = heap.trim_empty_blocks(1);
        assert!(released > 0);
        heap.verify_block_lists().unwrap();
        heap.release_all();
        assert_eq!(heap.page_allocator().used_pages(), 0);
    }

    #[test]
    fn marked_objects_survive() {
        let mut heap = heap();
        let keep = alloc(&mut heap, 100, ObjectAttributes::NONE);
        let drop = alloc(&mut heap, 100, ObjectAttributes::NONE);
        let header = heap.block_map().find(keep).unwrap();
        header.test_and_set_mark(header.slot_of(keep).unwrap());

        full_sweep(&mut heap);
        assert_eq!(heap.find_object(keep), Some((keep, 112)));
        assert_eq!(heap.find_object(drop), None);
        assert!(heap.is_marked_object(keep));
        // The freed slot is handed out again.
        assert_eq!(alloc(&mut heap, 100, ObjectAttributes::NONE), drop);
        heap.release_all();
    }

    #[test]
    fn explicit_free_recycles_the_slot() {
        let mut heap = heap();
        let a = alloc(&mut heap, 64, ObjectAttributes::NONE);
        let _b = alloc(&mut heap, 64, ObjectAttributes::NONE);
        assert!(!heap.explicit_free(a + 8usize));
        assert!(heap.explicit_free(a));
        assert!(!heap.explicit_free(a));
        assert_eq!(heap.find_object(a), None);
        assert_eq!(heap.bucket(BlockFlavor::Normal, 64).unwrap().explicit_free_count(), 1);

        // Fill the block so the allocator has to fall back to the free list.
        let class = SizeClass::for_size(64).unwrap();
        for _ in 2..class.object_count() {
            alloc(&mut heap, 64, ObjectAttributes::NONE);
        }
        let allocator = AllocatorRing::default_allocator();
        assert_eq!(heap.try_alloc(64, ObjectAttributes::NONE, false, allocator, false), Some(a));
        heap.verify_block_lists().unwrap();
        heap.release_all();
    }

    #[test]
    fn retired_block_is_not_reused_by_a_later_partial_sweep() {
        let mut heap = heap();
        let class = SizeClass::for_size(64).unwrap();
        let objects: Vec<Address> = (0..class.object_count())
            .map(|_| alloc(&mut heap, 64, ObjectAttributes::NONE))
            .collect();
        let header = heap.block_map().find(objects[0]).unwrap();
        // Everything but the first object survives, too little free space
        // for a partial collection to reuse the block.
        for object in objects.iter().skip(1) {
            header.test_and_set_mark(header.slot_of(*object).unwrap());
        }

        let partial_sweep = |heap: &mut HeapInfo| {
            let sweep = RecyclerSweep::new(true, false, 0.25);
            heap.stop_allocation_before_sweep();
            assert!(heap.sweep(&sweep, &ObjectKindTable::new(), false).is_empty());
        };
        partial_sweep(&mut heap);
        let bucket = heap.bucket(BlockFlavor::Normal, 64).unwrap();
        assert_eq!(bucket.list_len(ListKind::PendingSweep), 1);
        assert_eq!(heap.finish_pending_sweep(true), class.object_size);

        // The retired block is untouched, so the next partial sweep leaves it
        // on the full list.
        partial_sweep(&mut heap);
        let bucket = heap.bucket(BlockFlavor::Normal, 64).unwrap();
        assert_eq!(bucket.list_len(ListKind::Full), 1);
        assert_eq!(bucket.list_len(ListKind::Allocable), 0);
        let allocator = AllocatorRing::default_allocator();
        assert_eq!(heap.try_alloc(64, ObjectAttributes::NONE, false, allocator, false), None);
        heap.verify_block_lists().unwrap();

        // A full sweep makes its free slot available again.
        full_sweep(&mut heap);
        assert_eq!(heap.bucket(BlockFlavor::Normal, 64).unwrap().list_len(ListKind::Allocable), 1);
        assert_eq!(heap.try_alloc(64, ObjectAttributes::NONE, false, allocator, false), Some(objects[0]));
        heap.release_all();
    }

    #[test]
    fn large_objects_release_pages_when_dead() {
        let mut heap = heap();
        let big = alloc(&mut heap, 3 * 4096 + 1, ObjectAttributes::LEAF);
        assert_eq!(heap.page_allocator().used_pages(), 4);
        assert_eq!(heap.find_object(big + 4096usize), Some((big, 3 * 4096 + 16)));
        let sweep = full_sweep(&mut heap);
        assert_eq!(sweep.counters().freed_bytes(), 3 * 4096 + 16);
        assert_eq!(heap.page_allocator().used_pages(), 0);
        assert_eq!(heap.block_count(), 0);
    }

    #[test]
    fn allocators_share_ids_across_buckets() {
        let mut heap = heap();
        let a = heap.add_allocator();
        let b = heap.add_allocator();
        assert_ne!(a, b);
        let x = heap.alloc_from_new_block(32, ObjectAttributes::NONE, false, a).unwrap();
        let y = heap.alloc_from_new_block(32, ObjectAttributes::NONE, false, b).unwrap();
        // Each cursor got a block of its own.
        assert_ne!(
            heap.block_map().find(x).unwrap().id(),
            heap.block_map().find(y).unwrap().id()
        );
        heap.remove_allocator(a);
        heap.verify_block_lists().unwrap();
        heap.release_all();
    }
}
