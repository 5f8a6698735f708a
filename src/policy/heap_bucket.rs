//! One size class of one block flavor.
//!
//! A bucket partitions its blocks over five lists. Outside of a sweep every
//! block is on exactly one of them, or out with the background sweeper:
//!
//! * `heap_blocks`: blocks with free slots. The first one is the next block
//!   an allocator cursor picks up.
//! * `full_blocks`: no free slots.
//! * `empty_blocks`: no objects. Kept with their pages for reuse until the
//!   end of the next full collection trims them.
//! * `pending_sweep`: partial collections only. Blocks that freed too little
//!   to be worth allocating into yet.
//! * `pending_dispose`: blocks holding finalized objects waiting for dispose.
//!
//! The lists are mutated by the mutator thread only. The background sweeper
//! owns the blocks it was given and hands them back through `swept_queue`,
//! which the allocator may drain early when concurrent sweep allocation is
//! enabled.

use std::sync::Arc;

use crossbeam::queue::SegQueue;

use crate::policy::allocator::{AllocatorId, AllocatorRing};
use crate::policy::attributes::ObjectAttributes;
use crate::policy::block_list::{BlockArena, BlockList, ListKind};
use crate::policy::block_map::BlockMap;
use crate::policy::heap_block::{BlockHeader, BlockId, BucketIndex, HeapBlock, SweepState};
use crate::policy::size_class::{BlockFlavor, SizeClass};
use crate::policy::sweep::{RecyclerSweep, SweepCounters};
use crate::util::error::AllocationError;
use crate::util::fatal::{fatal_error, FatalError};
use crate::util::heap::PageAllocator;
use crate::util::Address;
use crate::vm::{ObjectKind, ObjectKindTable};

/// Where new blocks come from and where they are registered.
#[derive(Clone, Copy)]
pub struct BlockEnv<'a> {
    pub page_allocator: &'a PageAllocator,
    pub block_map: &'a BlockMap,
}

impl BlockEnv<'_> {
    /// Unregister a block that has left the arena and give its pages back.
    pub(crate) fn release_block(&self, block: HeapBlock) {
        let header = block.header();
        self.block_map.remove(header);
        if let Err(e) = self.page_allocator.release_pages(header.start(), header.pages()) {
            fatal_error(
                FatalError::BadPageState,
                &format!("releasing {:?}: {}", header, e),
            );
        }
    }
}

/// A finalized object waiting for its dispose callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingDisposeObject {
    pub object: Address,
    pub size: usize,
    pub kind: ObjectKind,
    pub(crate) block: BlockId,
    pub(crate) slot: usize,
}

/// A block coming back from the background sweeper.
pub struct SweptBlock {
    pub block: HeapBlock,
    pub state: SweepState,
}

/// The blocks of one bucket, out with the background sweeper.
pub struct BucketSweepWork {
    queue: Arc<SegQueue<SweptBlock>>,
    blocks: Vec<HeapBlock>,
}

impl BucketSweepWork {
    /// Sweep every block and publish it. Runs on the background thread.
    pub fn run(self, counters: &SweepCounters) {
        for mut block in self.blocks {
            let result = block.sweep(None);
            let state = block.sweep_state(result.live_objects, None);
            trace!("Swept {:?}: {}", block, state);
            counters.record(&result, state);
            self.queue.push(SweptBlock { block, state });
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

pub struct HeapBucket {
    index: BucketIndex,
    size_class: SizeClass,
    heap_blocks: BlockList,
    full_blocks: BlockList,
    empty_blocks: BlockList,
    pending_sweep: BlockList,
    pending_dispose: BlockList,
    /// Objects released through explicit free, linked through their first
    /// word. Discarded when allocation stops for a sweep.
    explicit_free_list: Address,
    explicit_free_count: usize,
    allocators: AllocatorRing,
    swept_queue: Arc<SegQueue<SweptBlock>>,
    /// Blocks out with the background sweeper.
    sweeping: usize,
}

impl HeapBucket {
    pub fn new(flavor: BlockFlavor, size_class: SizeClass) -> Self {
        HeapBucket {
            index: BucketIndex::Sized(flavor, size_class.index),
            size_class,
            heap_blocks: BlockList::new(ListKind::Allocable),
            full_blocks: BlockList::new(ListKind::Full),
            empty_blocks: BlockList::new(ListKind::Empty),
            pending_sweep: BlockList::new(ListKind::PendingSweep),
            pending_dispose: BlockList::new(ListKind::PendingDispose),
            explicit_free_list: Address::ZERO,
            explicit_free_count: 0,
            allocators: AllocatorRing::new(),
            swept_queue: Arc::new(SegQueue::new()),
            sweeping: 0,
        }
    }

    pub fn size_class(&self) -> SizeClass {
        self.size_class
    }

    pub fn flavor(&self) -> BlockFlavor {
        self.index.flavor()
    }

    pub fn allocators(&mut self) -> &mut AllocatorRing {
        &mut self.allocators
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeping > 0
    }

    pub fn explicit_free_count(&self) -> usize {
        self.explicit_free_count
    }

    /// The fast path: the cursor's block, then the allocable list, then the
    /// explicit free list, then (if allowed) blocks the background sweeper
    /// has finished with. `None` means the caller has to escalate.
    pub fn try_alloc(
        &mut self,
        arena: &mut BlockArena,
        block_map: &BlockMap,
        allocator: AllocatorId,
        attributes: ObjectAttributes,
        black: bool,
        concurrent_sweep_alloc: bool,
    ) -> Option<Address> {
        if let Some(id) = self.allocators.block(allocator) {
            if arena.list_of(id) == ListKind::Allocable {
                if let Some(addr) = arena.get_mut(id).and_then(|b| b.alloc(attributes, black)) {
                    return Some(addr);
                }
                self.heap_blocks.remove(arena, id);
                self.full_blocks.push_back(arena, id);
            }
            self.allocators.set_block(allocator, None);
        }

        while let Some(id) = self.heap_blocks.first() {
            if let Some(addr) = arena.get_mut(id).and_then(|b| b.alloc(attributes, black)) {
                self.allocators.set_block(allocator, Some(id));
                return Some(addr);
            }
            self.heap_blocks.remove(arena, id);
            self.full_blocks.push_back(arena, id);
        }

        if let Some(addr) = self.alloc_from_explicit_free_list(arena, block_map, attributes, black) {
            return Some(addr);
        }

        if concurrent_sweep_alloc {
            while let Some(swept) = self.swept_queue.pop() {
                let id = self.link_swept(arena, swept);
                if arena.list_of(id) != ListKind::Allocable {
                    continue;
                }
                if let Some(addr) = arena.get_mut(id).and_then(|b| b.alloc(attributes, black)) {
                    self.allocators.set_block(allocator, Some(id));
                    return Some(addr);
                }
            }
        }
        None
    }

    fn alloc_from_explicit_free_list(
        &mut self,
        arena: &mut BlockArena,
        block_map: &BlockMap,
        attributes: ObjectAttributes,
        black: bool,
    ) -> Option<Address> {
        if self.explicit_free_list.is_zero() {
            return None;
        }
        let object = self.explicit_free_list;
        let (id, slot) = block_map
            .with_block(object, |header| header.slot_of(object).map(|slot| (header.id(), slot)))
            .flatten()
            .unwrap_or_else(|| {
                fatal_error(
                    FatalError::BadPageState,
                    &format!("explicit free list points at {}, outside the heap", object),
                )
            });
        let block = arena.get_mut(id)?;
        self.explicit_free_list = unsafe { object.load::<Address>() };
        self.explicit_free_count -= 1;
        Some(block.claim_detached(slot, attributes, black))
    }

    /// Give an object back outside of a collection. Refused for objects that
    /// are not allocated, wait for dispose, or whose block is being swept.
    pub fn explicit_free(&mut self, arena: &mut BlockArena, header: &BlockHeader, slot: usize) -> bool {
        let Some(block) = arena.get_mut(header.id()) else {
            return false;
        };
        if !header.attributes(slot).is_allocated() || block.is_pending_dispose(slot) {
            return false;
        }
        block.detach_object(slot);
        let object = header.slot_address(slot);
        unsafe { object.store::<Address>(self.explicit_free_list) };
        self.explicit_free_list = object;
        self.explicit_free_count += 1;
        true
    }

    /// Put a fresh block (or a recycled empty one) at the head of the
    /// allocable list and allocate from it. Returns the object and the
    /// number of pages taken from the page allocator.
    pub fn alloc_from_new_block(
        &mut self,
        arena: &mut BlockArena,
        env: BlockEnv,
        allocator: AllocatorId,
        attributes: ObjectAttributes,
        black: bool,
    ) -> Result<(Address, usize), AllocationError> {
        let (id, new_pages) = match self.empty_blocks.pop_front(arena) {
            Some(id) => {
                if let Some(block) = arena.get_mut(id) {
                    block.reinitialize();
                }
                (id, 0)
            }
            None => {
                let pages = self.size_class.block_pages;
                let start = env.page_allocator.alloc_pages(pages)?;
                let header = Arc::new(BlockHeader::new(
                    start,
                    pages,
                    self.size_class.object_size,
                    self.size_class.object_count(),
                    arena.next_id(),
                    self.index,
                ));
                env.block_map.insert(&header);
                trace!("New block {:?}", header);
                (arena.insert(HeapBlock::new(header)), pages)
            }
        };
        self.heap_blocks.push_front(arena, id);
        self.allocators.set_block(allocator, Some(id));
        match arena.get_mut(id).and_then(|b| b.alloc(attributes, black)) {
            Some(addr) => Ok((addr, new_pages)),
            None => fatal_error(
                FatalError::BadPageState,
                &format!("new Block#{} has no free slot", id.index()),
            ),
        }
    }

    /// Forget the allocation cursors and the explicit free list. Sweeping
    /// rebuilds free lists from the attribute and mark bits.
    pub fn stop_allocation_before_sweep(&mut self) {
        self.allocators.clear_blocks();
        self.explicit_free_list = Address::ZERO;
        self.explicit_free_count = 0;
    }

    fn link(&mut self, arena: &mut BlockArena, id: BlockId, state: SweepState) {
        match state {
            SweepState::Empty => self.empty_blocks.push_back(arena, id),
            SweepState::Full => self.full_blocks.push_back(arena, id),
            SweepState::Swept => self.heap_blocks.push_back(arena, id),
            SweepState::PendingSweep => self.pending_sweep.push_back(arena, id),
            SweepState::PendingDispose => self.pending_dispose.push_back(arena, id),
        }
    }

    fn link_swept(&mut self, arena: &mut BlockArena, swept: SweptBlock) -> BlockId {
        let id = arena.put_back(swept.block);
        self.sweeping -= 1;
        self.link(arena, id, swept.state);
        id
    }

    /// Sweep on this thread. The allocable list goes before the full list.
    /// With `touched_only`, blocks nobody allocated into since the last
    /// sweep stay unswept on the list they came from. A block an earlier
    /// partial collection retired to the full list stays there until a full
    /// collection sweeps it.
    pub fn sweep(
        &mut self,
        arena: &mut BlockArena,
        sweep: &RecyclerSweep,
        kinds: Option<&ObjectKindTable>,
        touched_only: bool,
    ) {
        let allocable = self.heap_blocks.drain(arena);
        let full = self.full_blocks.drain(arena);
        let ids = allocable
            .into_iter()
            .map(|id| (id, SweepState::Swept))
            .chain(full.into_iter().map(|id| (id, SweepState::Full)));
        for (id, unswept_state) in ids {
            let Some(block) = arena.get_mut(id) else {
                fatal_error(
                    FatalError::BadPageState,
                    &format!("Block#{} is listed but not in the arena", id.index()),
                );
            };
            let state = if touched_only && !block.is_touched() {
                unswept_state
            } else {
                let result = block.sweep(kinds);
                let state = block.sweep_state(result.live_objects, sweep.reuse_min_free_ratio());
                trace!("Swept {:?}: {}", block, state);
                sweep.counters().record(&result, state);
                state
            };
            self.link(arena, id, state);
        }
    }

    /// Move the allocable and full blocks out of the arena for the
    /// background sweeper.
    pub fn take_for_background_sweep(&mut self, arena: &mut BlockArena) -> BucketSweepWork {
        let mut ids = self.heap_blocks.drain(arena);
        ids.extend(self.full_blocks.drain(arena));
        let blocks: Vec<HeapBlock> = ids
            .into_iter()
            .map(|id| match arena.take(id) {
                Some(block) => block,
                None => fatal_error(
                    FatalError::BadPageState,
                    &format!("Block#{} is already out of the arena", id.index()),
                ),
            })
            .collect();
        self.sweeping += blocks.len();
        BucketSweepWork {
            queue: self.swept_queue.clone(),
            blocks,
        }
    }

    /// Link every block the background sweeper has published.
    pub fn transfer_swept(&mut self, arena: &mut BlockArena) {
        while let Some(swept) = self.swept_queue.pop() {
            self.link_swept(arena, swept);
        }
        debug_assert_eq!(self.sweeping, 0, "{:?} still has blocks out", self.index);
    }

    /// Decide the fate of the blocks a partial sweep held back. Retired
    /// blocks join the full list; otherwise they become allocable. Returns
    /// the free bytes in them.
    pub fn finish_pending_sweep(&mut self, arena: &mut BlockArena, retire: bool) -> usize {
        let mut free_bytes = 0;
        for id in self.pending_sweep.drain(arena) {
            free_bytes += arena.get(id).map_or(0, HeapBlock::free_bytes);
            if retire {
                self.full_blocks.push_back(arena, id);
            } else {
                self.heap_blocks.push_back(arena, id);
            }
        }
        free_bytes
    }

    /// Free bytes in blocks on the pending-sweep list.
    pub fn pending_sweep_free_bytes(&self, arena: &BlockArena) -> usize {
        self.pending_sweep
            .iter(arena)
            .filter_map(|id| arena.get(id))
            .map(HeapBlock::free_bytes)
            .sum()
    }

    /// Release empty blocks beyond `retain`. Returns the pages released.
    pub fn trim_empty_blocks(&mut self, arena: &mut BlockArena, env: BlockEnv, retain: usize) -> usize {
        let mut pages = 0;
        while self.empty_blocks.len() > retain {
            let Some(id) = self.empty_blocks.pop_front(arena) else {
                break;
            };
            let block = arena.remove(id);
            pages += block.header().pages();
            env.release_block(block);
        }
        pages
    }

    pub fn collect_pending_dispose(&self, arena: &BlockArena, out: &mut Vec<PendingDisposeObject>) {
        for id in self.pending_dispose.iter(arena) {
            let Some(block) = arena.get(id) else { continue };
            let header = block.header();
            for slot in block.pending_dispose_slots() {
                out.push(PendingDisposeObject {
                    object: header.slot_address(slot),
                    size: header.object_size(),
                    kind: header.attributes(slot).kind(),
                    block: id,
                    slot,
                });
            }
        }
    }

    /// Free one disposed object. Once its block has nothing left to dispose
    /// it rejoins the allocable, full or empty list.
    pub fn release_disposed(&mut self, arena: &mut BlockArena, id: BlockId, slot: usize) -> usize {
        let Some(block) = arena.get_mut(id) else {
            return 0;
        };
        let freed = block.release_disposed(slot);
        let (still_pending, live, has_free) = (
            block.has_pending_dispose(),
            block.live_object_count(),
            block.has_free_slot(),
        );
        if still_pending || arena.list_of(id) != ListKind::PendingDispose {
            return freed;
        }
        let state = if live == 0 {
            SweepState::Empty
        } else if has_free {
            SweepState::Swept
        } else {
            SweepState::Full
        };
        self.pending_dispose.remove(arena, id);
        self.link(arena, id, state);
        freed
    }

    /// Every block on one of this bucket's lists.
    pub fn block_ids(&self, arena: &BlockArena) -> Vec<BlockId> {
        self.lists()
            .iter()
            .flat_map(|list| list.iter(arena))
            .collect()
    }

    fn lists(&self) -> [&BlockList; 5] {
        [
            &self.heap_blocks,
            &self.full_blocks,
            &self.empty_blocks,
            &self.pending_sweep,
            &self.pending_dispose,
        ]
    }

    /// Blocks per list kind, for statistics and tests.
    pub fn list_len(&self, kind: ListKind) -> usize {
        self.lists()
            .iter()
            .find(|list| list.kind() == kind)
            .map_or(0, |list| list.len())
    }

    /// Check that every listed block is in the arena, belongs to this
    /// bucket and is recorded as being on the list it is chained into.
    pub fn verify(&self, arena: &BlockArena) -> Result<(), String> {
        for list in self.lists() {
            let mut len = 0;
            for id in list.iter(arena) {
                len += 1;
                if arena.list_of(id) != list.kind() {
                    return Err(format!(
                        "Block#{} is chained into {:?} but recorded on {:?}",
                        id.index(),
                        list.kind(),
                        arena.list_of(id)
                    ));
                }
                match arena.get(id) {
                    Some(block) if block.header().bucket() == self.index => {}
                    Some(block) => {
                        return Err(format!("{:?} is on a list of {:?}", block, self.index))
                    }
                    None => return Err(format!("Block#{} is listed but taken", id.index())),
                }
            }
            if len != list.len() {
                return Err(format!("{:?} list of {:?} miscounts", list.kind(), self.index));
            }
        }
        Ok(())
    }

    /// Unlink and release every block. Shutdown only.
    pub fn release_all(&mut self, arena: &mut BlockArena, env: BlockEnv) {
        self.transfer_swept(arena);
        self.stop_allocation_before_sweep();
        let mut ids = vec![];
        for list in [
            &mut self.heap_blocks,
            &mut self.full_blocks,
            &mut self.empty_blocks,
            &mut self.pending_sweep,
            &mut self.pending_dispose,
        ] {
            ids.extend(list.drain(arena));
        }
        for id in ids {
            env.release_block(arena.remove(id));
        }
    }
}
