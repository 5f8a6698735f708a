//! Allocation cursors. Each bucket keeps a ring of them anchored at a sentinel
//! head; a cursor caches the block it is currently allocating from so the fast
//! path never walks the bucket's lists.

use crate::policy::heap_block::BlockId;

/// Handle of one cursor in an [`AllocatorRing`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocatorId(usize);

struct AllocatorNode {
    prev: usize,
    next: usize,
    block: Option<BlockId>,
    in_use: bool,
}

/// A circular doubly linked list of cursors. Slot 0 is the sentinel head.
pub struct AllocatorRing {
    nodes: Vec<AllocatorNode>,
    free: Vec<usize>,
}

const HEAD: usize = 0;

impl AllocatorRing {
    /// A ring holding the sentinel and one default cursor.
    pub fn new() -> Self {
        let mut ring = AllocatorRing {
            nodes: vec![AllocatorNode {
                prev: HEAD,
                next: HEAD,
                block: None,
                in_use: true,
            }],
            free: vec![],
        };
        ring.add();
        ring
    }

    /// The cursor every bucket starts with.
    pub const fn default_allocator() -> AllocatorId {
        AllocatorId(1)
    }

    /// Splice a new cursor in right after the head.
    pub fn add(&mut self) -> AllocatorId {
        let node = AllocatorNode {
            prev: HEAD,
            next: self.nodes[HEAD].next,
            block: None,
            in_use: true,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.nodes[index] = node;
                index
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        let next = self.nodes[index].next;
        self.nodes[next].prev = index;
        self.nodes[HEAD].next = index;
        AllocatorId(index)
    }

    /// Unlink a cursor. Returns the block it was allocating from.
    pub fn remove(&mut self, id: AllocatorId) -> Option<BlockId> {
        debug_assert!(id.0 != HEAD && self.nodes[id.0].in_use);
        let (prev, next) = (self.nodes[id.0].prev, self.nodes[id.0].next);
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
        let node = &mut self.nodes[id.0];
        node.in_use = false;
        self.free.push(id.0);
        node.block.take()
    }

    pub fn block(&self, id: AllocatorId) -> Option<BlockId> {
        self.nodes[id.0].block
    }

    pub fn set_block(&mut self, id: AllocatorId, block: Option<BlockId>) {
        self.nodes[id.0].block = block;
    }

    /// Visit every cursor, from the one after the head back around to the head.
    pub fn for_each_allocator<F: FnMut(AllocatorId, &mut Option<BlockId>)>(&mut self, mut f: F) {
        let mut cursor = self.nodes[HEAD].next;
        while cursor != HEAD {
            let next = self.nodes[cursor].next;
            f(AllocatorId(cursor), &mut self.nodes[cursor].block);
            cursor = next;
        }
    }

    /// Forget every cached block.
    pub fn clear_blocks(&mut self) {
        self.for_each_allocator(|_, block| *block = None);
    }

    /// Does any cursor hold `block`?
    pub fn holds(&self, block: BlockId) -> bool {
        let mut cursor = self.nodes[HEAD].next;
        while cursor != HEAD {
            if self.nodes[cursor].block == Some(block) {
                return true;
            }
            cursor = self.nodes[cursor].next;
        }
        false
    }

    pub fn len(&self) -> usize {
        self.nodes.len() - 1 - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AllocatorRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visit(ring: &mut AllocatorRing) -> Vec<AllocatorId> {
        let mut seen = vec![];
        ring.for_each_allocator(|id, _| seen.push(id));
        seen
    }

    #[test]
    fn add_and_remove_splice() {
        let mut ring = AllocatorRing::new();
        let default = AllocatorRing::default_allocator();
        let a = ring.add();
        let b = ring.add();
        assert_eq!(visit(&mut ring), vec![b, a, default]);

        ring.set_block(a, Some(BlockId(7)));
        assert!(ring.holds(BlockId(7)));
        assert_eq!(ring.remove(a), Some(BlockId(7)));
        assert!(!ring.holds(BlockId(7)));
        assert_eq!(visit(&mut ring), vec![b, default]);
        assert_eq!(ring.len(), 2);

        // The freed node is reused.
        let c = ring.add();
        assert_eq!(c, a);
        assert_eq!(ring.block(c), None);
    }

    #[test]
    fn clear_blocks_resets_every_cursor() {
        let mut ring = AllocatorRing::new();
        let a = ring.add();
        ring.set_block(a, Some(BlockId(1)));
        ring.set_block(AllocatorRing::default_allocator(), Some(BlockId(2)));
        ring.clear_blocks();
        assert_eq!(ring.block(a), None);
        assert_eq!(ring.block(AllocatorRing::default_allocator()), None);
    }
}
