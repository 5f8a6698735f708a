//! The marker's worklist and the tracer it hands to trace functions.

use std::sync::Arc;

use crate::policy::attributes::ObjectAttributes;
use crate::policy::block_map::BlockMap;
use crate::policy::heap_block::BlockHeader;
use crate::util::constants::BYTES_IN_CARD;
use crate::util::mark::page_stack::PageStack;
use crate::util::write_barrier::CardTable;
use crate::util::Address;
use crate::vm::{ObjectKind, ObjectKindTable, ObjectTracer};

/// A marked object whose fields still have to be traced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanItem {
    pub object: Address,
    pub size: usize,
    pub kind: ObjectKind,
}

/// How a candidate resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkOutcome {
    /// Not a pointer to an allocated object.
    NotAnObject,
    AlreadyMarked,
    NewlyMarked,
}

pub struct MarkContext {
    block_map: Arc<BlockMap>,
    kinds: Arc<ObjectKindTable>,
    mark_stack: PageStack<ScanItem>,
    /// Tracked objects, traced once `mark_stack` runs dry.
    track_stack: PageStack<ScanItem>,
    /// A push failed. Some marked objects were not traced.
    out_of_memory: bool,
    marked_objects: usize,
    marked_bytes: usize,
}

impl MarkContext {
    pub fn new(block_map: Arc<BlockMap>, kinds: Arc<ObjectKindTable>, max_chunks: usize) -> Self {
        MarkContext {
            block_map,
            kinds,
            mark_stack: PageStack::new(max_chunks),
            track_stack: PageStack::new(0),
            out_of_memory: false,
            marked_objects: 0,
            marked_bytes: 0,
        }
    }

    /// A context sharing this one's heap view, with empty stacks.
    pub fn fork(&self, max_chunks: usize) -> Self {
        MarkContext::new(self.block_map.clone(), self.kinds.clone(), max_chunks)
    }

    pub fn block_map(&self) -> &Arc<BlockMap> {
        &self.block_map
    }

    pub fn has_out_of_memory(&self) -> bool {
        self.out_of_memory
    }

    pub fn clear_out_of_memory(&mut self) {
        self.out_of_memory = false;
    }

    pub fn marked_objects(&self) -> usize {
        self.marked_objects
    }

    pub fn marked_bytes(&self) -> usize {
        self.marked_bytes
    }

    pub fn reset_counters(&mut self) {
        self.marked_objects = 0;
        self.marked_bytes = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.mark_stack.is_empty() && self.track_stack.is_empty()
    }

    pub fn mark_stack_chunks(&self) -> usize {
        self.mark_stack.chunk_count()
    }

    /// Mark the object `candidate` points into, if it is one, and queue it
    /// for tracing.
    pub fn mark_candidate(&mut self, candidate: Address) -> MarkOutcome {
        let found = self.block_map.with_block(candidate, |header| {
            let slot = header.slot_of(candidate)?;
            let attributes = header.attributes(slot);
            if !attributes.is_allocated() {
                return None;
            }
            if header.test_and_set_mark(slot) {
                return Some(None);
            }
            Some(Some((
                header.slot_address(slot),
                header.object_size(),
                attributes,
            )))
        });
        match found.flatten() {
            None => MarkOutcome::NotAnObject,
            Some(None) => MarkOutcome::AlreadyMarked,
            Some(Some((object, size, attributes))) => {
                self.marked_objects += 1;
                self.marked_bytes += size;
                self.enqueue(object, size, attributes);
                MarkOutcome::NewlyMarked
            }
        }
    }

    fn enqueue(&mut self, object: Address, size: usize, attributes: ObjectAttributes) {
        if attributes.is_leaf() {
            return;
        }
        let item = ScanItem {
            object,
            size,
            kind: attributes.kind(),
        };
        let pushed = if attributes.is_tracked() {
            self.track_stack.push(item)
        } else {
            self.mark_stack.push(item)
        };
        if !pushed {
            if !self.out_of_memory {
                warn!("Mark stack is full; {} will be traced by a rescan", object);
            }
            self.out_of_memory = true;
        }
    }

    /// Trace the fields of an object that is (or is about to be treated as)
    /// marked. Does not drain.
    pub fn scan_object(&mut self, object: Address, size: usize, kind: ObjectKind) {
        let info = *self.kinds.get(kind);
        info.trace(object, size, self);
    }

    /// Trace every marked, allocated, non-leaf object of `header` in `slots`.
    pub fn scan_marked_slots(&mut self, header: &BlockHeader, slots: std::ops::Range<usize>) -> usize {
        let mut scanned = 0;
        for slot in slots {
            let attributes = header.attributes(slot);
            if attributes.is_allocated() && !attributes.is_leaf() && header.is_marked(slot) {
                self.scan_object(header.slot_address(slot), header.object_size(), attributes.kind());
                scanned += 1;
            }
        }
        scanned
    }

    /// Trace until both stacks are empty. Tracked objects wait for the main
    /// stack to run dry.
    pub fn drain(&mut self) {
        loop {
            while let Some(item) = self.mark_stack.pop() {
                self.scan_object(item.object, item.size, item.kind);
            }
            match self.track_stack.pop() {
                Some(item) => self.scan_object(item.object, item.size, item.kind),
                None => return,
            }
        }
    }

    /// Clear `bit` on every dirty card of the heap and retrace the marked
    /// objects on it. Each card is cleared before its objects are read, so a
    /// write racing with the scan dirties it again. Returns the number of
    /// cards processed.
    pub fn rescan_dirty_cards(&mut self, card_table: &CardTable, bit: u8) -> usize {
        let mut cards = 0;
        for header in self.block_map.blocks() {
            let mut card = header.start();
            while card < header.objects_end() {
                if card_table.test_and_clear(card, bit) {
                    cards += 1;
                    let slots = header.slots_overlapping(card, card + BYTES_IN_CARD);
                    self.scan_marked_slots(&header, slots);
                    self.drain();
                }
                card = card + BYTES_IN_CARD;
            }
        }
        cards
    }

    /// Retrace every marked object in the heap. This is how marking recovers
    /// after the mark stack overflowed.
    pub fn rescan_all_marked(&mut self) -> usize {
        let mut scanned = 0;
        for header in self.block_map.blocks() {
            for slot in 0..header.object_count() {
                scanned += self.scan_marked_slots(&header, slot..slot + 1);
                self.drain();
            }
        }
        scanned
    }

    /// Move about `1/(parts + 1)` of the pending work each into at most
    /// `parts` new contexts.
    pub fn split(&mut self, parts: usize) -> Vec<MarkContext> {
        let max_chunks = self.max_chunks();
        self.mark_stack
            .split(parts)
            .into_iter()
            .map(|stack| {
                let mut context = self.fork(max_chunks);
                context.mark_stack = stack;
                context
            })
            .collect()
    }

    fn max_chunks(&self) -> usize {
        self.mark_stack.max_chunks()
    }

    /// Take back a context produced by `split`.
    pub fn merge(&mut self, mut other: MarkContext) {
        self.mark_stack.append(&mut other.mark_stack);
        self.track_stack.append(&mut other.track_stack);
        self.out_of_memory |= other.out_of_memory;
        self.marked_objects += other.marked_objects;
        self.marked_bytes += other.marked_bytes;
    }

    pub fn clear(&mut self) {
        self.mark_stack.clear();
        self.track_stack.clear();
        self.out_of_memory = false;
    }
}

impl ObjectTracer for MarkContext {
    fn trace_candidate(&mut self, candidate: Address) {
        self.mark_candidate(candidate);
    }
}
