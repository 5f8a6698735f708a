//! Allocation. The fast path never collects; the slow path ("snail alloc")
//! escalates from a heuristic collection to a new block to a forced full
//! collection before it gives up.

use super::{CollectionFlags, CollectionState, Recycler};
use crate::policy::allocator::AllocatorId;
use crate::policy::attributes::ObjectAttributes;
use crate::util::error::AllocationError;
use crate::util::Address;

impl Recycler {
    /// Allocate a zeroed object. On failure the host's out-of-memory handler
    /// takes over and this does not return.
    pub fn alloc(&mut self, size: usize, attributes: ObjectAttributes) -> Address {
        match self.alloc_with(Self::default_allocator(), size, attributes) {
            Ok(addr) => addr,
            Err(e) => self.host.out_of_memory(e),
        }
    }

    /// Allocate a zeroed object, or `None` if the heap is exhausted.
    pub fn alloc_nothrow(&mut self, size: usize, attributes: ObjectAttributes) -> Option<Address> {
        self.alloc_with(Self::default_allocator(), size, attributes).ok()
    }

    /// Allocate through a specific allocation cursor.
    pub fn alloc_with(
        &mut self,
        allocator: AllocatorId,
        size: usize,
        attributes: ObjectAttributes,
    ) -> Result<Address, AllocationError> {
        let attributes = attributes.sanitized();
        if let Some(addr) = self.try_alloc(allocator, size, attributes) {
            return Ok(addr);
        }
        self.snail_alloc(allocator, size, attributes)
    }

    /// Add an allocation cursor of its own for some part of the host.
    pub fn add_allocator(&mut self) -> AllocatorId {
        self.heap.add_allocator()
    }

    pub fn remove_allocator(&mut self, allocator: AllocatorId) {
        self.heap.remove_allocator(allocator);
    }

    fn try_alloc(&mut self, allocator: AllocatorId, size: usize, attributes: ObjectAttributes) -> Option<Address> {
        let state = self.collection_state();
        let concurrent_sweep_alloc = self.options.concurrent_sweep_alloc
            && matches!(
                state,
                CollectionState::ConcurrentSweep | CollectionState::TransferSweptWait
            );
        self.heap
            .try_alloc(size, attributes, state.allocates_black(), allocator, concurrent_sweep_alloc)
    }

    fn alloc_from_new_block(
        &mut self,
        allocator: AllocatorId,
        size: usize,
        attributes: ObjectAttributes,
    ) -> Result<Address, AllocationError> {
        let black = self.collection_state().allocates_black();
        self.heap.alloc_from_new_block(size, attributes, black, allocator)
    }

    fn snail_alloc(
        &mut self,
        allocator: AllocatorId,
        size: usize,
        attributes: ObjectAttributes,
    ) -> Result<Address, AllocationError> {
        if self.options.collect_on_allocation && !self.in_dispose {
            self.collect_now(CollectionFlags::COLLECT_ON_ALLOCATION);
            if let Some(addr) = self.try_alloc(allocator, size, attributes) {
                return Ok(addr);
            }
        }

        let err = match self.alloc_from_new_block(allocator, size, attributes) {
            Ok(addr) => return Ok(addr),
            Err(e) => e,
        };

        warn!(
            "{}: {} allocating {} bytes, collecting before retrying",
            self.id, err, size
        );
        self.collect_now(CollectionFlags::COLLECT_NOW_EXHAUSTIVE);
        // Every block with no live object goes back so other size classes
        // can have its pages.
        let released = self.heap.trim_empty_blocks(0);
        let decommitted = self.page_allocator().decommit_now();
        debug!("{}: released {} pages, decommitted {}", self.id, released, decommitted);

        if let Some(addr) = self.try_alloc(allocator, size, attributes) {
            return Ok(addr);
        }
        self.alloc_from_new_block(allocator, size, attributes).map_err(|e| {
            error!("{}: out of memory allocating {} bytes: {}", self.id, size, e);
            e
        })
    }

    /// Give back a small or medium object outside of a collection. Only the
    /// exact start of a normal or leaf object is accepted.
    pub fn explicit_free(&mut self, object: Address) -> bool {
        if self.is_collection_in_progress() {
            return false;
        }
        self.heap.explicit_free(object)
    }
}
