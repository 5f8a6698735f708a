//! Custom-heap (JIT code) pages carved out of a single up-front reservation.
//!
//! Reserving address space for executable code one mapping at a time is slow
//! under a code-integrity policy, so the region is reserved once, lazily, and
//! handed out in allocation-granularity segments tracked by a bit vector
//! (set = free). The reservation itself lives until the allocator is dropped.

use spin::Mutex;

use crate::util::bit_vector::BitVector;
use crate::util::constants::*;
use crate::util::conversions;
use crate::util::error::PageError;
use crate::util::heap::virtual_alloc::{commit_pages, AllocationType, FreeType};
use crate::util::os::memory::{self, MmapAnnotation, MmapProtection};
use crate::util::Address;

struct PreReservedState {
    start: Option<Address>,
    /// Set once the reservation was refused. The allocator never retries.
    reservation_failed: bool,
    free_segments: BitVector,
    /// No segment below this index is free.
    first_free_hint: usize,
}

pub struct PreReservedVirtualAllocWrapper {
    region_size: usize,
    code_integrity_guard: bool,
    cs: Mutex<PreReservedState>,
}

impl PreReservedVirtualAllocWrapper {
    pub fn new(region_size: usize, code_integrity_guard: bool) -> Self {
        debug_assert!(region_size % BYTES_IN_ALLOCATION_GRANULARITY == 0);
        let segments = region_size >> LOG_BYTES_IN_ALLOCATION_GRANULARITY;
        PreReservedVirtualAllocWrapper {
            region_size,
            code_integrity_guard,
            cs: Mutex::new(PreReservedState {
                start: None,
                reservation_failed: false,
                free_segments: BitVector::new_all_set(segments),
                first_free_hint: 0,
            }),
        }
    }

    fn ensure_pre_reserved(&self, state: &mut PreReservedState) -> Option<Address> {
        if state.start.is_some() || state.reservation_failed {
            return state.start;
        }
        match memory::mmap_reserve(None, self.region_size, &MmapAnnotation::PreReserved) {
            Ok(start) => {
                info!(
                    "Pre-reserved {} for custom heap at {}",
                    conversions::bytes_to_formatted_string(self.region_size),
                    start
                );
                state.start = Some(start);
            }
            Err(e) => {
                warn!("Pre-reservation of {} bytes failed: {}", self.region_size, e);
                state.reservation_failed = true;
            }
        }
        state.start
    }

    /// Start of the region, reserving it if this is the first use.
    pub fn ensure_region(&self) -> Option<Address> {
        let mut state = self.cs.lock();
        self.ensure_pre_reserved(&mut state)
    }

    pub fn region_start(&self) -> Option<Address> {
        self.cs.lock().start
    }

    pub fn is_in_range(&self, address: Address) -> bool {
        self.cs
            .lock()
            .start
            .is_some_and(|start| address.is_in(start, start + self.region_size))
    }

    fn segment_index(start: Address, address: Address) -> usize {
        (address - start) >> LOG_BYTES_IN_ALLOCATION_GRANULARITY
    }

    /// Allocate `size` bytes from the region. Without a hint a first-fit run of
    /// free segments is taken. With a hint, the range must already belong to a
    /// previous allocation, and is (re)committed.
    pub fn alloc(
        &self,
        address_hint: Option<Address>,
        size: usize,
        allocation_type: AllocationType,
        prot: MmapProtection,
        is_custom_heap: bool,
    ) -> Result<Address, PageError> {
        let mut state = self.cs.lock();
        let region = self
            .ensure_pre_reserved(&mut state)
            .ok_or(PageError::ReservationUnavailable)?;
        let segments = conversions::bytes_to_granularity_segments_up(size);

        let (address, newly_taken) = match address_hint {
            None => {
                let from = state.first_free_hint;
                let index = state
                    .free_segments
                    .first_set_run(from, segments)
                    .ok_or(PageError::InvalidRange)?;
                state.free_segments.clear_range(index, segments);
                if index == state.first_free_hint {
                    state.first_free_hint = index + segments;
                }
                (region + (index << LOG_BYTES_IN_ALLOCATION_GRANULARITY), Some(index))
            }
            Some(hint) => {
                if !hint.is_in(region, region + self.region_size)
                    || hint + size > region + self.region_size
                {
                    return Err(PageError::InvalidRange);
                }
                debug_assert!(
                    state.free_segments.all_clear_in_range(
                        Self::segment_index(region, hint),
                        conversions::bytes_to_granularity_segments_up(
                            size + (hint - hint.align_down(BYTES_IN_ALLOCATION_GRANULARITY))
                        )
                    ),
                    "Hinted pre-reserved range {} is not allocated",
                    hint
                );
                (hint, None)
            }
        };

        if allocation_type.commits() {
            if let Err(e) = commit_pages(
                address,
                size,
                prot,
                is_custom_heap,
                self.code_integrity_guard,
            ) {
                if let Some(index) = newly_taken {
                    state.free_segments.set_range(index, segments);
                    state.first_free_hint = state.first_free_hint.min(index);
                }
                return Err(e.into());
            }
        }
        trace!(
            "Pre-reserved alloc {:?} {} bytes at {}",
            allocation_type,
            size,
            address
        );
        Ok(address)
    }

    /// Decommit, or decommit and return to the pool. Unlike the base allocator
    /// a release passes its size, since the region tracks segments, not reservations.
    /// Releasing segments that are already free fails without touching any state.
    pub fn free(&self, address: Address, size: usize, free_type: FreeType) -> Result<(), PageError> {
        let mut state = self.cs.lock();
        let region = state.start.ok_or(PageError::ReservationUnavailable)?;
        if size == 0 || !address.is_in(region, region + self.region_size) {
            return Err(PageError::InvalidRange);
        }
        match free_type {
            FreeType::Decommit => {
                memory::decommit(address, size)?;
            }
            FreeType::Release => {
                if !address.is_aligned_to(BYTES_IN_ALLOCATION_GRANULARITY) {
                    return Err(PageError::InvalidRange);
                }
                let index = Self::segment_index(region, address);
                let segments = conversions::bytes_to_granularity_segments_up(size);
                if index + segments > state.free_segments.len() {
                    return Err(PageError::InvalidRange);
                }
                if !state.free_segments.all_clear_in_range(index, segments) {
                    error!(
                        "Pre-reserved release of {} ({} segments) overlaps free segments",
                        address, segments
                    );
                    return Err(PageError::BadPageState);
                }
                memory::decommit(address, segments << LOG_BYTES_IN_ALLOCATION_GRANULARITY)?;
                state.free_segments.set_range(index, segments);
                state.first_free_hint = state.first_free_hint.min(index);
            }
        }
        Ok(())
    }

    /// A copy of the free-segment bit vector.
    pub fn free_segments(&self) -> BitVector {
        self.cs.lock().free_segments.clone()
    }

    pub fn free_segment_count(&self) -> usize {
        self.cs.lock().free_segments.count()
    }
}

impl Drop for PreReservedVirtualAllocWrapper {
    fn drop(&mut self) {
        if let Some(start) = self.cs.lock().start.take() {
            let _ = memory::munmap(start, self.region_size);
        }
    }
}
