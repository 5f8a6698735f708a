//! Heap blocks: a run of pages cut into equal-size object slots.
//!
//! A block has two halves. The [`BlockHeader`] is shared (through the block
//! map) with whoever marks: it holds the geometry, the mark bits and the
//! attribute bytes, all of which are atomics. The [`HeapBlock`] is the
//! allocation state (free list, free bits, bump index) and has exactly one
//! owner at a time: its bucket, or the background sweeper while the block is
//! out being swept.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use enum_map::Enum;
use strum_macros::Display;

use crate::policy::attributes::ObjectAttributes;
use crate::policy::size_class::BlockFlavor;
use crate::util::bit_vector::{AtomicBitVector, BitVector};
use crate::util::conversions;
use crate::util::fatal::{fatal_error, FatalError};
use crate::util::os::memory;
use crate::util::Address;
use crate::vm::ObjectKindTable;

/// Index of a block in its heap's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) u32);

impl BlockId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Which bucket a block belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BucketIndex {
    Sized(BlockFlavor, usize),
    Large(BlockFlavor),
}

impl BucketIndex {
    pub fn flavor(self) -> BlockFlavor {
        match self {
            BucketIndex::Sized(flavor, _) | BucketIndex::Large(flavor) => flavor,
        }
    }
}

/// Where a block goes after it has been swept.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Enum, Display)]
pub enum SweepState {
    /// No live objects.
    Empty,
    /// No free slots.
    Full,
    /// Has free slots. Allocable again.
    Swept,
    /// Partial collection only: too little was freed to be worth reusing now.
    PendingSweep,
    /// Holds finalized objects waiting for dispose.
    PendingDispose,
}

pub struct BlockHeader {
    start: Address,
    pages: usize,
    object_size: usize,
    object_count: usize,
    id: BlockId,
    bucket: BucketIndex,
    marks: AtomicBitVector,
    attributes: Box<[AtomicU8]>,
}

impl BlockHeader {
    pub fn new(
        start: Address,
        pages: usize,
        object_size: usize,
        object_count: usize,
        id: BlockId,
        bucket: BucketIndex,
    ) -> Self {
        debug_assert!(object_count * object_size <= conversions::pages_to_bytes(pages));
        BlockHeader {
            start,
            pages,
            object_size,
            object_count,
            id,
            bucket,
            marks: AtomicBitVector::new(object_count),
            attributes: (0..object_count).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    pub fn start(&self) -> Address {
        self.start
    }

    pub fn end(&self) -> Address {
        self.start + conversions::pages_to_bytes(self.pages)
    }

    /// End of the last slot. Anything between here and `end()` is padding.
    pub fn objects_end(&self) -> Address {
        self.start + self.object_count * self.object_size
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    pub fn object_count(&self) -> usize {
        self.object_count
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn bucket(&self) -> BucketIndex {
        self.bucket
    }

    pub fn flavor(&self) -> BlockFlavor {
        self.bucket.flavor()
    }

    /// The slot containing `addr`. Interior pointers resolve to their object.
    pub fn slot_of(&self, addr: Address) -> Option<usize> {
        if addr < self.start || addr >= self.objects_end() {
            return None;
        }
        Some((addr - self.start) / self.object_size)
    }

    pub fn slot_address(&self, slot: usize) -> Address {
        debug_assert!(slot < self.object_count);
        self.start + slot * self.object_size
    }

    /// Slots overlapping `[start, end)`.
    pub fn slots_overlapping(&self, start: Address, end: Address) -> std::ops::Range<usize> {
        let from = if start <= self.start {
            0
        } else {
            (start - self.start) / self.object_size
        };
        let to = if end >= self.objects_end() {
            self.object_count
        } else if end <= self.start {
            0
        } else {
            (end - self.start).div_ceil(self.object_size)
        };
        from.min(to)..to
    }

    pub fn attributes(&self, slot: usize) -> ObjectAttributes {
        ObjectAttributes::from_bits(self.attributes[slot].load(Ordering::Acquire))
    }

    pub(crate) fn set_attributes(&self, slot: usize, attributes: ObjectAttributes) {
        self.attributes[slot].store(attributes.bits(), Ordering::Release);
    }

    pub fn is_marked(&self, slot: usize) -> bool {
        self.marks.test(slot)
    }

    /// Returns true if the slot was already marked.
    pub fn test_and_set_mark(&self, slot: usize) -> bool {
        self.marks.test_and_set(slot)
    }

    pub(crate) fn set_mark(&self, slot: usize, marked: bool) {
        if marked {
            self.marks.set(slot)
        } else {
            self.marks.clear(slot)
        }
    }

    pub fn reset_marks(&self) {
        self.marks.clear_all();
    }

    pub fn marked_count(&self) -> usize {
        self.marks.count()
    }
}

impl std::fmt::Debug for BlockHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Block#{}({}, {}x{}B, {:?})",
            self.id.0, self.start, self.object_count, self.object_size, self.bucket
        )
    }
}

/// What sweeping one block found.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockSweepResult {
    pub live_objects: usize,
    pub freed_objects: usize,
    pub freed_bytes: usize,
    pub finalized_objects: usize,
}

pub struct HeapBlock {
    header: Arc<BlockHeader>,
    /// Head of the intrusive free list threaded through free slots.
    free_list: Address,
    /// Slots on `free_list`.
    free_bits: BitVector,
    free_count: usize,
    /// Slots at or above this index have never been handed out since the
    /// block was (re)initialized.
    bump_index: usize,
    /// Finalized objects waiting for dispose. They stay allocated until then.
    pending_dispose: BitVector,
    pending_dispose_count: usize,
    /// Allocated from, or explicitly freed into, since the last sweep.
    touched: bool,
}

impl HeapBlock {
    pub fn new(header: Arc<BlockHeader>) -> Self {
        let count = header.object_count();
        HeapBlock {
            header,
            free_list: Address::ZERO,
            free_bits: BitVector::new(count),
            free_count: 0,
            bump_index: 0,
            pending_dispose: BitVector::new(count),
            pending_dispose_count: 0,
            touched: false,
        }
    }

    pub fn header(&self) -> &Arc<BlockHeader> {
        &self.header
    }

    pub fn id(&self) -> BlockId {
        self.header.id()
    }

    pub fn has_free_slot(&self) -> bool {
        self.free_count > 0 || self.bump_index < self.header.object_count()
    }

    pub fn free_slot_count(&self) -> usize {
        self.free_count + (self.header.object_count() - self.bump_index)
    }

    pub fn free_bytes(&self) -> usize {
        self.free_slot_count() * self.header.object_size()
    }

    pub fn is_free(&self, slot: usize) -> bool {
        slot >= self.bump_index || self.free_bits.test(slot)
    }

    pub fn is_touched(&self) -> bool {
        self.touched
    }

    pub fn set_touched(&mut self) {
        self.touched = true;
    }

    pub fn has_pending_dispose(&self) -> bool {
        self.pending_dispose_count > 0
    }

    pub fn pending_dispose_count(&self) -> usize {
        self.pending_dispose_count
    }

    pub fn is_pending_dispose(&self, slot: usize) -> bool {
        self.pending_dispose.test(slot)
    }

    pub fn pending_dispose_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.pending_dispose.iter_set()
    }

    /// Slots below the bump index that hold an object.
    pub fn allocated_slots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.bump_index).filter(move |slot| self.header.attributes(*slot).is_allocated())
    }

    /// Forget everything: the block holds no objects and its next allocation
    /// starts at slot zero.
    pub fn reinitialize(&mut self) {
        debug_assert_eq!(self.pending_dispose_count, 0);
        for slot in 0..self.bump_index {
            self.header.set_attributes(slot, ObjectAttributes::NONE);
        }
        self.header.reset_marks();
        self.free_list = Address::ZERO;
        self.free_bits.clear_all();
        self.free_count = 0;
        self.bump_index = 0;
        self.touched = false;
    }

    fn pop_free_slot(&mut self) -> Option<usize> {
        if self.free_list.is_zero() {
            return None;
        }
        let cell = self.free_list;
        let slot = match self.header.slot_of(cell) {
            Some(slot) if self.free_bits.test(slot) => slot,
            _ => fatal_error(
                FatalError::BadPageState,
                &format!("free list of {:?} points at {}, which is not free", self.header, cell),
            ),
        };
        self.free_list = unsafe { cell.load::<Address>() };
        self.free_bits.clear(slot);
        self.free_count -= 1;
        Some(slot)
    }

    fn push_free_slot(&mut self, slot: usize) {
        debug_assert!(!self.free_bits.test(slot));
        let cell = self.header.slot_address(slot);
        unsafe { cell.store::<Address>(self.free_list) };
        self.free_list = cell;
        self.free_bits.set(slot);
        self.free_count += 1;
    }

    /// Take a free slot, zero it, and publish it as an object with
    /// `attributes`. When `black` is set the object is marked before its
    /// attributes are published, so a concurrent marker that finds it never
    /// traces it.
    pub fn alloc(&mut self, attributes: ObjectAttributes, black: bool) -> Option<Address> {
        let slot = match self.pop_free_slot() {
            Some(slot) => slot,
            None if self.bump_index < self.header.object_count() => {
                self.bump_index += 1;
                self.bump_index - 1
            }
            None => return None,
        };
        let addr = self.header.slot_address(slot);
        memory::zero(addr, self.header.object_size());
        self.header.set_mark(slot, black);
        self.header.set_attributes(slot, attributes.allocated());
        self.touched = true;
        Some(addr)
    }

    /// Turn an allocated object back into an unpublished slot, without
    /// putting it on this block's free list. The caller owns the slot.
    pub fn detach_object(&mut self, slot: usize) {
        debug_assert!(self.header.attributes(slot).is_allocated());
        self.header.set_attributes(slot, ObjectAttributes::NONE);
        self.header.set_mark(slot, false);
        self.touched = true;
    }

    /// Hand back a slot claimed from the explicit free list.
    pub fn claim_detached(&mut self, slot: usize, attributes: ObjectAttributes, black: bool) -> Address {
        debug_assert!(!self.header.attributes(slot).is_allocated());
        let addr = self.header.slot_address(slot);
        memory::zero(addr, self.header.object_size());
        self.header.set_mark(slot, black);
        self.header.set_attributes(slot, attributes.allocated());
        self.touched = true;
        addr
    }

    /// Free a disposed object. Returns the bytes freed, zero if the slot was
    /// not waiting for dispose.
    pub fn release_disposed(&mut self, slot: usize) -> usize {
        if !self.pending_dispose.test(slot) {
            return 0;
        }
        self.header.set_attributes(slot, ObjectAttributes::NONE);
        self.header.set_mark(slot, false);
        self.pending_dispose.clear(slot);
        self.pending_dispose_count -= 1;
        self.push_free_slot(slot);
        self.header.object_size()
    }

    /// Live objects after a sweep: allocated slots, disposed or not.
    pub fn live_object_count(&self) -> usize {
        self.allocated_slots().count()
    }

    /// Rebuild the free list from the mark bits. Unmarked finalizable objects
    /// are finalized (when `kinds` is given) and kept until dispose; other
    /// unmarked objects are freed.
    pub fn sweep(&mut self, kinds: Option<&ObjectKindTable>) -> BlockSweepResult {
        let mut result = BlockSweepResult::default();
        let size = self.header.object_size();
        self.free_list = Address::ZERO;
        self.free_bits.clear_all();
        self.free_count = 0;
        // Walk backwards so the free list hands out low addresses first.
        for slot in (0..self.bump_index).rev() {
            let attributes = self.header.attributes(slot);
            if !attributes.is_allocated() {
                self.push_free_slot(slot);
                continue;
            }
            if self.header.is_marked(slot) || self.pending_dispose.test(slot) {
                result.live_objects += 1;
                continue;
            }
            if attributes.is_finalizable() {
                if let Some(kinds) = kinds {
                    let addr = self.header.slot_address(slot);
                    if let Some(finalize) = kinds.get(attributes.kind()).finalize {
                        finalize(addr, size);
                    }
                    self.pending_dispose.set(slot);
                    self.pending_dispose_count += 1;
                    result.finalized_objects += 1;
                    result.live_objects += 1;
                    continue;
                }
            }
            trace!("Free {} in {:?}", self.header.slot_address(slot), self.header);
            self.header.set_attributes(slot, ObjectAttributes::NONE);
            self.push_free_slot(slot);
            result.freed_objects += 1;
            result.freed_bytes += size;
        }
        self.touched = false;
        result
    }

    /// Classify a swept block. `reuse_min_free_ratio` is only given during a
    /// partial collection.
    pub fn sweep_state(&self, live_objects: usize, reuse_min_free_ratio: Option<f64>) -> SweepState {
        if self.pending_dispose_count > 0 {
            SweepState::PendingDispose
        } else if live_objects == 0 {
            SweepState::Empty
        } else if !self.has_free_slot() {
            SweepState::Full
        } else if reuse_min_free_ratio.is_some_and(|ratio| {
            (self.free_slot_count() as f64) < ratio * self.header.object_count() as f64
        }) {
            SweepState::PendingSweep
        } else {
            SweepState::Swept
        }
    }
}

impl std::fmt::Debug for HeapBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} free {} bump {} pending {}",
            self.header, self.free_count, self.bump_index, self.pending_dispose_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_PAGE;
    use crate::util::os::memory::{dzmmap, munmap, MmapProtection};
    use crate::vm::{ObjectKindInfo, ObjectKindTable};
    use std::sync::atomic::AtomicUsize;

    fn test_block(object_size: usize) -> HeapBlock {
        let start = dzmmap(None, BYTES_IN_PAGE, MmapProtection::ReadWrite, crate::mmap_anno_test!()).unwrap();
        let header = BlockHeader::new(
            start,
            1,
            object_size,
            BYTES_IN_PAGE / object_size,
            BlockId(0),
            BucketIndex::Sized(BlockFlavor::Normal, object_size / 16 - 1),
        );
        HeapBlock::new(Arc::new(header))
    }

    fn unmap(block: HeapBlock) {
        munmap(block.header().start(), BYTES_IN_PAGE).unwrap();
    }

    #[test]
    fn bump_then_free_list() {
        let mut block = test_block(1024);
        let objects: Vec<Address> = (0..4)
            .map(|_| block.alloc(ObjectAttributes::NONE, false).unwrap())
            .collect();
        assert!(block.alloc(ObjectAttributes::NONE, false).is_none());
        assert_eq!(objects[1] - objects[0], 1024);

        // Keep objects 0 and 2.
        block.header().test_and_set_mark(0);
        block.header().test_and_set_mark(2);
        let result = block.sweep(None);
        assert_eq!(result.live_objects, 2);
        assert_eq!(result.freed_bytes, 2048);
        assert!(block.is_free(1) && block.is_free(3));
        assert_eq!(block.sweep_state(result.live_objects, None), SweepState::Swept);

        // The free list hands back the lowest slot first.
        assert_eq!(block.alloc(ObjectAttributes::NONE, false), Some(objects[1]));
        unmap(block);
    }

    #[test]
    fn allocation_zeroes_and_marks_black() {
        let mut block = test_block(64);
        let a = block.alloc(ObjectAttributes::NONE, false).unwrap();
        unsafe { a.store(0xffusize) };
        block.sweep(None);
        let b = block.alloc(ObjectAttributes::LEAF, true).unwrap();
        assert_eq!(a, b);
        assert_eq!(unsafe { b.load::<usize>() }, 0);
        assert!(block.header().is_marked(0));
        assert!(block.header().attributes(0).is_leaf());
        unmap(block);
    }

    #[test]
    fn empty_and_full_states() {
        let mut block = test_block(2048);
        block.alloc(ObjectAttributes::NONE, false).unwrap();
        block.alloc(ObjectAttributes::NONE, false).unwrap();
        block.header().test_and_set_mark(0);
        block.header().test_and_set_mark(1);
        let result = block.sweep(None);
        assert_eq!(block.sweep_state(result.live_objects, None), SweepState::Full);
        block.header().reset_marks();
        let result = block.sweep(None);
        assert_eq!(block.sweep_state(result.live_objects, None), SweepState::Empty);
        unmap(block);
    }

    #[test]
    fn low_free_ratio_is_pending_in_partial_mode() {
        let mut block = test_block(256);
        for _ in 0..16 {
            block.alloc(ObjectAttributes::NONE, false).unwrap();
        }
        for slot in 1..16 {
            block.header().test_and_set_mark(slot);
        }
        let result = block.sweep(None);
        assert_eq!(block.sweep_state(result.live_objects, Some(0.25)), SweepState::PendingSweep);
        assert_eq!(block.sweep_state(result.live_objects, None), SweepState::Swept);
        unmap(block);
    }

    static FINALIZED: AtomicUsize = AtomicUsize::new(0);

    #[test]
    fn finalizable_objects_wait_for_dispose() {
        fn finalize(_: Address, _: usize) {
            FINALIZED.fetch_add(1, Ordering::SeqCst);
        }
        let mut kinds = ObjectKindTable::new();
        let kind = kinds
            .register(ObjectKindInfo {
                finalize: Some(finalize),
                ..ObjectKindInfo::conservative("finalizable")
            })
            .unwrap();
        let mut block = test_block(512);
        let attributes = ObjectAttributes::FINALIZE.with_kind(kind);
        block.alloc(attributes, false).unwrap();

        let result = block.sweep(Some(&kinds));
        assert_eq!(result.finalized_objects, 1);
        assert_eq!(result.freed_bytes, 0);
        assert_eq!(block.sweep_state(result.live_objects, None), SweepState::PendingDispose);
        assert!(!block.is_free(0));

        // A second sweep neither finalizes again nor frees it.
        let result = block.sweep(Some(&kinds));
        assert_eq!(result.finalized_objects, 0);
        assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);

        assert_eq!(block.release_disposed(0), 512);
        assert_eq!(block.release_disposed(0), 0);
        assert!(block.is_free(0));
        assert_eq!(block.live_object_count(), 0);
        assert!(!block.has_pending_dispose());
        unmap(block);
    }

    #[test]
    fn slot_geometry() {
        let block = test_block(48);
        let header = block.header();
        let start = header.start();
        assert_eq!(header.slot_of(start + 47usize), Some(0));
        assert_eq!(header.slot_of(start + 48usize), Some(1));
        assert_eq!(header.slot_of(header.objects_end()), None);
        assert_eq!(header.slots_overlapping(start + 40usize, start + 100usize), 0..3);
        unmap(block);
    }
}
