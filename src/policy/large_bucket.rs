//! Objects above the medium size limit. Each gets a page-granular block of
//! its own, so a dead large object gives its pages back as soon as it is
//! swept. Large blocks are always swept on the mutator thread.

use std::sync::Arc;

use crate::policy::attributes::ObjectAttributes;
use crate::policy::block_list::{BlockArena, BlockList, ListKind};
use crate::policy::heap_block::{BlockHeader, BlockId, BucketIndex, HeapBlock, SweepState};
use crate::policy::heap_bucket::{BlockEnv, PendingDisposeObject};
use crate::policy::size_class::{large_object_size, BlockFlavor};
use crate::policy::sweep::RecyclerSweep;
use crate::util::conversions;
use crate::util::error::AllocationError;
use crate::util::fatal::{fatal_error, FatalError};
use crate::util::Address;
use crate::vm::ObjectKindTable;

pub struct LargeBucket {
    flavor: BlockFlavor,
    blocks: BlockList,
    pending_dispose: BlockList,
}

impl LargeBucket {
    pub fn new(flavor: BlockFlavor) -> Self {
        LargeBucket {
            flavor,
            blocks: BlockList::new(ListKind::Large),
            pending_dispose: BlockList::new(ListKind::PendingDispose),
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len() + self.pending_dispose.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the object and the pages it took.
    pub fn alloc(
        &mut self,
        arena: &mut BlockArena,
        env: BlockEnv,
        size: usize,
        attributes: ObjectAttributes,
        black: bool,
    ) -> Result<(Address, usize), AllocationError> {
        let object_size = large_object_size(size);
        let pages = conversions::bytes_to_pages_up(object_size);
        let start = env.page_allocator.alloc_pages(pages)?;
        let header = Arc::new(BlockHeader::new(
            start,
            pages,
            object_size,
            1,
            arena.next_id(),
            BucketIndex::Large(self.flavor),
        ));
        env.block_map.insert(&header);
        let id = arena.insert(HeapBlock::new(header));
        self.blocks.push_back(arena, id);
        match arena.get_mut(id).and_then(|b| b.alloc(attributes, black)) {
            Some(addr) => {
                debug!("Large object {} of {} pages", addr, pages);
                Ok((addr, pages))
            }
            None => fatal_error(
                FatalError::BadPageState,
                &format!("new large Block#{} has no free slot", id.index()),
            ),
        }
    }

    pub fn sweep(
        &mut self,
        arena: &mut BlockArena,
        env: BlockEnv,
        sweep: &RecyclerSweep,
        kinds: Option<&ObjectKindTable>,
        touched_only: bool,
    ) {
        for id in self.blocks.drain(arena) {
            let Some(block) = arena.get_mut(id) else {
                fatal_error(
                    FatalError::BadPageState,
                    &format!("large Block#{} is listed but not in the arena", id.index()),
                );
            };
            if touched_only && !block.is_touched() {
                self.blocks.push_back(arena, id);
                continue;
            }
            let result = block.sweep(kinds);
            let state = block.sweep_state(result.live_objects, None);
            sweep.counters().record(&result, state);
            match state {
                SweepState::Empty => env.release_block(arena.remove(id)),
                SweepState::PendingDispose => self.pending_dispose.push_back(arena, id),
                _ => self.blocks.push_back(arena, id),
            }
        }
    }

    pub fn collect_pending_dispose(&self, arena: &BlockArena, out: &mut Vec<PendingDisposeObject>) {
        for id in self.pending_dispose.iter(arena) {
            let Some(block) = arena.get(id) else { continue };
            let header = block.header();
            if block.is_pending_dispose(0) {
                out.push(PendingDisposeObject {
                    object: header.start(),
                    size: header.object_size(),
                    kind: header.attributes(0).kind(),
                    block: id,
                    slot: 0,
                });
            }
        }
    }

    /// Free a disposed large object. Its block goes straight back to the page
    /// allocator.
    pub fn release_disposed(&mut self, arena: &mut BlockArena, env: BlockEnv, id: BlockId, slot: usize) -> usize {
        let freed = match arena.get_mut(id) {
            Some(block) => block.release_disposed(slot),
            None => return 0,
        };
        if freed > 0 && arena.list_of(id) == ListKind::PendingDispose {
            self.pending_dispose.remove(arena, id);
            env.release_block(arena.remove(id));
        }
        freed
    }

    pub fn block_ids(&self, arena: &BlockArena) -> Vec<BlockId> {
        self.blocks
            .iter(arena)
            .chain(self.pending_dispose.iter(arena))
            .collect()
    }

    pub fn verify(&self, arena: &BlockArena) -> Result<(), String> {
        for list in [&self.blocks, &self.pending_dispose] {
            for id in list.iter(arena) {
                if arena.list_of(id) != list.kind() {
                    return Err(format!("large Block#{} is on the wrong list", id.index()));
                }
                match arena.get(id) {
                    Some(block) if block.header().bucket() == BucketIndex::Large(self.flavor) => {}
                    _ => return Err(format!("large Block#{} does not belong here", id.index())),
                }
            }
        }
        Ok(())
    }

    pub fn release_all(&mut self, arena: &mut BlockArena, env: BlockEnv) {
        let mut ids = self.blocks.drain(arena);
        ids.extend(self.pending_dispose.drain(arena));
        for id in ids {
            env.release_block(arena.remove(id));
        }
    }
}
