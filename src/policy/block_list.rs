//! Blocks live in an arena and are chained into lists by index. The links are
//! kept in the arena rather than in the block, so a block can leave the arena
//! (to be swept on the background thread) while its list bookkeeping stays put.

use crate::policy::heap_block::{BlockId, HeapBlock};
use crate::util::fatal::{fatal_error, FatalError};

/// Which list a block is on. A block is on at most one list at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListKind {
    /// Not linked: being allocated into, or out with the background sweeper.
    Detached,
    Allocable,
    Full,
    Empty,
    PendingSweep,
    PendingDispose,
    Large,
}

struct ArenaSlot {
    block: Option<HeapBlock>,
    prev: Option<BlockId>,
    next: Option<BlockId>,
    list: ListKind,
    in_use: bool,
}

#[derive(Default)]
pub struct BlockArena {
    slots: Vec<ArenaSlot>,
    free_ids: Vec<BlockId>,
    /// Blocks taken out with `take`.
    taken: usize,
}

impl BlockArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// The id the next `insert` will use.
    pub fn next_id(&self) -> BlockId {
        self.free_ids
            .last()
            .copied()
            .unwrap_or(BlockId(self.slots.len() as u32))
    }

    pub fn insert(&mut self, block: HeapBlock) -> BlockId {
        let id = block.id();
        debug_assert_eq!(id, self.next_id());
        let slot = ArenaSlot {
            block: Some(block),
            prev: None,
            next: None,
            list: ListKind::Detached,
            in_use: true,
        };
        if self.free_ids.last() == Some(&id) {
            self.free_ids.pop();
            self.slots[id.index()] = slot;
        } else {
            self.slots.push(slot);
        }
        id
    }

    /// Drop a detached block from the arena for good.
    pub fn remove(&mut self, id: BlockId) -> HeapBlock {
        let slot = &mut self.slots[id.index()];
        debug_assert_eq!(slot.list, ListKind::Detached);
        debug_assert!(slot.in_use);
        slot.in_use = false;
        self.free_ids.push(id);
        match slot.block.take() {
            Some(block) => block,
            None => fatal_error(
                FatalError::BadPageState,
                &format!("Block#{} is out of the arena", id.0),
            ),
        }
    }

    /// Move a detached block out, leaving its id reserved.
    pub fn take(&mut self, id: BlockId) -> Option<HeapBlock> {
        let slot = &mut self.slots[id.index()];
        debug_assert_eq!(slot.list, ListKind::Detached);
        let block = slot.block.take();
        if block.is_some() {
            self.taken += 1;
        }
        block
    }

    /// Return a block moved out with `take`.
    pub fn put_back(&mut self, block: HeapBlock) -> BlockId {
        let id = block.id();
        let slot = &mut self.slots[id.index()];
        debug_assert!(slot.block.is_none() && slot.in_use);
        slot.block = Some(block);
        self.taken -= 1;
        id
    }

    pub fn taken_count(&self) -> usize {
        self.taken
    }

    pub fn get(&self, id: BlockId) -> Option<&HeapBlock> {
        self.slots.get(id.index()).and_then(|slot| slot.block.as_ref())
    }

    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut HeapBlock> {
        self.slots
            .get_mut(id.index())
            .and_then(|slot| slot.block.as_mut())
    }

    pub fn list_of(&self, id: BlockId) -> ListKind {
        self.slots[id.index()].list
    }

    pub fn next(&self, id: BlockId) -> Option<BlockId> {
        self.slots[id.index()].next
    }

    /// Blocks in the arena, including taken ones.
    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free_ids.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.in_use)
            .map(|(i, _)| BlockId(i as u32))
    }
}

/// A doubly linked list of arena blocks. O(1) push, pop and unlink.
#[derive(Debug)]
pub struct BlockList {
    kind: ListKind,
    first: Option<BlockId>,
    last: Option<BlockId>,
    len: usize,
}

impl BlockList {
    pub const fn new(kind: ListKind) -> Self {
        BlockList {
            kind,
            first: None,
            last: None,
            len: 0,
        }
    }

    pub fn kind(&self) -> ListKind {
        self.kind
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn first(&self) -> Option<BlockId> {
        self.first
    }

    // Push block to the front of the list
    pub fn push_front(&mut self, arena: &mut BlockArena, id: BlockId) {
        debug_assert_eq!(arena.list_of(id), ListKind::Detached, "Block#{} is linked", id.0);
        {
            let slot = &mut arena.slots[id.index()];
            slot.prev = None;
            slot.next = self.first;
            slot.list = self.kind;
        }
        match self.first {
            Some(first) => arena.slots[first.index()].prev = Some(id),
            None => self.last = Some(id),
        }
        self.first = Some(id);
        self.len += 1;
    }

    pub fn push_back(&mut self, arena: &mut BlockArena, id: BlockId) {
        debug_assert_eq!(arena.list_of(id), ListKind::Detached, "Block#{} is linked", id.0);
        {
            let slot = &mut arena.slots[id.index()];
            slot.prev = self.last;
            slot.next = None;
            slot.list = self.kind;
        }
        match self.last {
            Some(last) => arena.slots[last.index()].next = Some(id),
            None => self.first = Some(id),
        }
        self.last = Some(id);
        self.len += 1;
    }

    // Remove a block from the list
    pub fn remove(&mut self, arena: &mut BlockArena, id: BlockId) {
        debug_assert_eq!(arena.list_of(id), self.kind);
        let (prev, next) = {
            let slot = &mut arena.slots[id.index()];
            let links = (slot.prev, slot.next);
            slot.prev = None;
            slot.next = None;
            slot.list = ListKind::Detached;
            links
        };
        match prev {
            Some(prev) => arena.slots[prev.index()].next = next,
            None => self.first = next,
        }
        match next {
            Some(next) => arena.slots[next.index()].prev = prev,
            None => self.last = prev,
        }
        self.len -= 1;
    }

    // Pop the first block in the list
    pub fn pop_front(&mut self, arena: &mut BlockArena) -> Option<BlockId> {
        let first = self.first?;
        self.remove(arena, first);
        Some(first)
    }

    /// Unlink every block, returning them in list order.
    pub fn drain(&mut self, arena: &mut BlockArena) -> Vec<BlockId> {
        let mut ids = Vec::with_capacity(self.len);
        while let Some(id) = self.pop_front(arena) {
            ids.push(id);
        }
        ids
    }

    pub fn iter<'a>(&self, arena: &'a BlockArena) -> impl Iterator<Item = BlockId> + 'a {
        let mut cursor = self.first;
        std::iter::from_fn(move || {
            let id = cursor?;
            cursor = arena.next(id);
            Some(id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::heap_block::{BlockHeader, BucketIndex};
    use crate::policy::size_class::BlockFlavor;
    use crate::util::Address;
    use std::sync::Arc;

    fn fake_block(arena: &BlockArena) -> HeapBlock {
        // The blocks are never touched, so any address will do.
        let start = unsafe { Address::from_usize(0x1000_0000 + arena.next_id().index() * 4096) };
        HeapBlock::new(Arc::new(BlockHeader::new(
            start,
            1,
            64,
            64,
            arena.next_id(),
            BucketIndex::Sized(BlockFlavor::Normal, 3),
        )))
    }

    #[test]
    fn push_remove_keeps_links() {
        let mut arena = BlockArena::new();
        let mut list = BlockList::new(ListKind::Allocable);
        let ids: Vec<BlockId> = (0..4)
            .map(|_| {
                let block = fake_block(&arena);
                arena.insert(block)
            })
            .collect();
        for id in &ids {
            list.push_back(&mut arena, *id);
        }
        assert_eq!(list.iter(&arena).collect::<Vec<_>>(), ids);
        list.remove(&mut arena, ids[1]);
        list.remove(&mut arena, ids[3]);
        assert_eq!(list.iter(&arena).collect::<Vec<_>>(), vec![ids[0], ids[2]]);
        assert_eq!(list.len(), 2);
        assert_eq!(arena.list_of(ids[1]), ListKind::Detached);

        list.push_front(&mut arena, ids[3]);
        assert_eq!(list.drain(&mut arena), vec![ids[3], ids[0], ids[2]]);
        assert!(list.is_empty());
    }

    #[test]
    fn ids_are_reused_after_remove() {
        let mut arena = BlockArena::new();
        let a = {
            let block = fake_block(&arena);
            arena.insert(block)
        };
        let b = {
            let block = fake_block(&arena);
            arena.insert(block)
        };
        arena.remove(a);
        assert_eq!(arena.next_id(), a);
        assert_eq!(arena.live_count(), 1);
        let c = {
            let block = fake_block(&arena);
            arena.insert(block)
        };
        assert_eq!(c, a);
        assert_ne!(c, b);
    }

    #[test]
    fn taken_blocks_keep_their_id() {
        let mut arena = BlockArena::new();
        let id = {
            let block = fake_block(&arena);
            arena.insert(block)
        };
        let block = arena.take(id).unwrap();
        assert!(arena.get(id).is_none());
        assert_eq!(arena.taken_count(), 1);
        assert_eq!(arena.put_back(block), id);
        assert_eq!(arena.taken_count(), 0);
    }
}
