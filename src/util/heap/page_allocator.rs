//! The segmented page allocator every heap block's memory comes from.
//!
//! Address space is reserved one 1MB segment at a time and committed page by
//! page as blocks need it. Freed pages go back to their segment's free map and
//! stay committed so the next block can reuse them without a syscall, up to
//! `max_free_page_count`; beyond that they are decommitted on release.
//! Requests larger than [`MAX_PAGES_IN_SHARED_SEGMENT`] get a dedicated
//! reservation that is released as a whole.
//!
//! Custom-heap (code) pages for the host are handed out here too. They come
//! from the pre-reserved region when one is configured and from their own
//! reservation otherwise, and never count against the heap limit.
//!
//! The allocator is shared by the mutator and the background sweeper, so its
//! state sits behind one mutex.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::util::bit_vector::BitVector;
use crate::util::constants::*;
use crate::util::conversions;
use crate::util::error::{AllocationError, PageError};
use crate::util::heap::accounting::PageAccounting;
use crate::util::heap::pre_reserved::PreReservedVirtualAllocWrapper;
use crate::util::heap::virtual_alloc::{AllocationType, FreeType, VirtualAllocWrapper};
use crate::util::os::memory::{self, MmapProtection};
use crate::util::write_barrier::CardTable;
use crate::util::Address;

struct PageSegment {
    start: Address,
    pages: usize,
    /// Dedicated segments hold exactly one allocation and have no page maps.
    dedicated: bool,
    free_pages: BitVector,
    /// Free pages without physical memory. Always a subset of `free_pages`.
    decommitted_pages: BitVector,
}

impl PageSegment {
    fn shared(start: Address) -> Self {
        PageSegment {
            start,
            pages: PAGES_IN_SEGMENT,
            dedicated: false,
            free_pages: BitVector::new_all_set(PAGES_IN_SEGMENT),
            decommitted_pages: BitVector::new_all_set(PAGES_IN_SEGMENT),
        }
    }

    fn dedicated(start: Address, pages: usize) -> Self {
        PageSegment {
            start,
            pages,
            dedicated: true,
            free_pages: BitVector::new(0),
            decommitted_pages: BitVector::new(0),
        }
    }

    fn end(&self) -> Address {
        self.start + conversions::pages_to_bytes(self.pages)
    }

    fn page_address(&self, index: usize) -> Address {
        self.start + conversions::pages_to_bytes(index)
    }

    fn page_index(&self, addr: Address) -> usize {
        (addr - self.start) >> LOG_BYTES_IN_PAGE
    }

    fn is_all_free(&self) -> bool {
        !self.dedicated && self.free_pages.count() == self.pages
    }

    /// A run of free pages that are all still committed.
    fn find_committed_run(&self, pages: usize) -> Option<usize> {
        let mut from = 0;
        while let Some(index) = self.free_pages.first_set_run(from, pages) {
            match (index..index + pages).find(|i| self.decommitted_pages.test(*i)) {
                None => return Some(index),
                Some(decommitted) => from = decommitted + 1,
            }
        }
        None
    }
}

struct PageAllocatorSync {
    /// Keyed by segment start.
    segments: BTreeMap<Address, PageSegment>,
    /// Pages handed out and not yet released.
    used_page_count: usize,
    /// Free pages that are still committed.
    free_page_count: usize,
}

/// A live custom-heap allocation.
struct CustomHeapRange {
    pages: usize,
    pre_reserved: bool,
}

pub struct PageAllocator {
    virtual_alloc: VirtualAllocWrapper,
    pre_reserved: Option<PreReservedVirtualAllocWrapper>,
    /// Custom-heap allocations by start address.
    custom_heap: Mutex<HashMap<Address, CustomHeapRange>>,
    card_table: Arc<CardTable>,
    sync: Mutex<PageAllocatorSync>,
    accounting: PageAccounting,
    max_heap_pages: usize,
    max_free_page_count: usize,
}

impl PageAllocator {
    /// A page allocator without a pre-reserved region or code-integrity guard.
    pub fn new(card_table: Arc<CardTable>, max_heap_size: usize, max_free_page_count: usize) -> Self {
        Self::with_custom_heap(card_table, max_heap_size, max_free_page_count, 0, false)
    }

    /// `pre_reserved_region_size` of zero means custom-heap pages get a
    /// reservation each.
    pub fn with_custom_heap(
        card_table: Arc<CardTable>,
        max_heap_size: usize,
        max_free_page_count: usize,
        pre_reserved_region_size: usize,
        code_integrity_guard: bool,
    ) -> Self {
        let pre_reserved = (pre_reserved_region_size > 0)
            .then(|| PreReservedVirtualAllocWrapper::new(pre_reserved_region_size, code_integrity_guard));
        PageAllocator {
            virtual_alloc: VirtualAllocWrapper::new(code_integrity_guard),
            pre_reserved,
            custom_heap: Mutex::new(HashMap::new()),
            card_table,
            sync: Mutex::new(PageAllocatorSync {
                segments: BTreeMap::new(),
                used_page_count: 0,
                free_page_count: 0,
            }),
            accounting: PageAccounting::new(),
            max_heap_pages: max_heap_size >> LOG_BYTES_IN_PAGE,
            max_free_page_count,
        }
    }

    /// Allocate `pages` contiguous, committed, read-write pages. The content of
    /// reused pages is not cleared.
    pub fn alloc_pages(&self, pages: usize) -> Result<Address, AllocationError> {
        debug_assert!(pages > 0);
        let mut sync = self.sync.lock().unwrap();
        if sync.used_page_count + pages > self.max_heap_pages {
            debug!(
                "Page allocation of {} pages exceeds the heap limit ({} of {} used)",
                pages, sync.used_page_count, self.max_heap_pages
            );
            return Err(AllocationError::HeapOutOfMemory);
        }
        self.accounting.reserve(pages);
        let result = if pages > MAX_PAGES_IN_SHARED_SEGMENT {
            self.alloc_dedicated(&mut sync, pages)
        } else {
            self.alloc_shared(&mut sync, pages)
        };
        match result {
            Ok(addr) => {
                sync.used_page_count += pages;
                trace!("Allocated {} pages at {}", pages, addr);
                Ok(addr)
            }
            Err(e) => {
                self.accounting.clear_reserved(pages);
                warn!("Page allocation of {} pages failed: {}", pages, e);
                Err(e.to_allocation_error())
            }
        }
    }

    fn alloc_dedicated(&self, sync: &mut PageAllocatorSync, pages: usize) -> Result<Address, PageError> {
        let bytes = conversions::pages_to_bytes(pages);
        let start = self.virtual_alloc.alloc(
            None,
            bytes,
            AllocationType::ReserveAndCommit,
            MmapProtection::ReadWrite,
            false,
        )?;
        if let Err(e) = self.card_table.ensure_committed(start, bytes) {
            let _ = self.virtual_alloc.free(start, 0, FreeType::Release);
            return Err(e.into());
        }
        self.accounting.commit(pages);
        sync.segments.insert(start, PageSegment::dedicated(start, pages));
        Ok(start)
    }

    fn alloc_shared(&self, sync: &mut PageAllocatorSync, pages: usize) -> Result<Address, PageError> {
        // Prefer committed free pages, then any free pages, then a new segment.
        let found = sync
            .segments
            .values()
            .filter(|s| !s.dedicated)
            .find_map(|s| s.find_committed_run(pages).map(|i| (s.start, i)))
            .or_else(|| {
                sync.segments
                    .values()
                    .filter(|s| !s.dedicated)
                    .find_map(|s| s.free_pages.first_set_run(0, pages).map(|i| (s.start, i)))
            });

        let (segment_start, index) = match found {
            Some(found) => found,
            None => {
                let start = self.virtual_alloc.alloc(
                    None,
                    BYTES_IN_SEGMENT,
                    AllocationType::Reserve,
                    MmapProtection::NoAccess,
                    false,
                )?;
                if let Err(e) = self.card_table.ensure_committed(start, BYTES_IN_SEGMENT) {
                    let _ = self.virtual_alloc.free(start, 0, FreeType::Release);
                    return Err(e.into());
                }
                debug!("Reserved page segment at {}", start);
                sync.segments.insert(start, PageSegment::shared(start));
                (start, 0)
            }
        };

        let Some(segment) = sync.segments.get_mut(&segment_start) else {
            return Err(PageError::BadPageState);
        };
        let decommitted = segment.decommitted_pages.count_in_range(index, pages);
        let committed_free = pages - decommitted;
        if decommitted > 0 {
            memory::commit(
                segment.page_address(index),
                conversions::pages_to_bytes(pages),
                MmapProtection::ReadWrite,
            )?;
            segment.decommitted_pages.clear_range(index, pages);
            self.accounting.commit(decommitted);
        }
        segment.free_pages.clear_range(index, pages);
        let addr = segment.page_address(index);
        sync.free_page_count -= committed_free;
        Ok(addr)
    }

    /// Return pages obtained from [`alloc_pages`](Self::alloc_pages).
    pub fn release_pages(&self, addr: Address, pages: usize) -> Result<(), PageError> {
        let mut guard = self.sync.lock().unwrap();
        let sync = &mut *guard;
        let (&start, segment) = sync
            .segments
            .range_mut(..=addr)
            .next_back()
            .ok_or(PageError::InvalidRange)?;
        if addr + conversions::pages_to_bytes(pages) > segment.end() {
            return Err(PageError::InvalidRange);
        }

        if segment.dedicated {
            if addr != start || pages != segment.pages {
                return Err(PageError::InvalidRange);
            }
            sync.segments.remove(&start);
            self.virtual_alloc.free(start, 0, FreeType::Release)?;
            self.accounting.release(pages);
            sync.used_page_count -= pages;
            trace!("Released dedicated segment at {}", start);
            return Ok(());
        }

        let index = segment.page_index(addr);
        if !segment.free_pages.all_clear_in_range(index, pages) {
            error!("Releasing {} pages at {} that are already free", pages, addr);
            return Err(PageError::BadPageState);
        }
        segment.free_pages.set_range(index, pages);
        self.accounting.unreserve(pages);

        let decommit = sync.free_page_count + pages > self.max_free_page_count;
        if decommit {
            memory::decommit(addr, conversions::pages_to_bytes(pages))?;
            // Re-borrow after the syscall; the segment map did not change.
            if let Some(segment) = sync.segments.get_mut(&start) {
                segment.decommitted_pages.set_range(index, pages);
            }
            self.accounting.decommit(pages);
        } else {
            sync.free_page_count += pages;
        }
        sync.used_page_count -= pages;
        trace!("Released {} pages at {} (decommitted: {})", pages, addr, decommit);
        Ok(())
    }

    /// Allocate `pages` committed custom-heap pages with protection `prot`.
    /// The pre-reserved region is tried first; once it is full or could not be
    /// reserved, the pages get a reservation of their own.
    pub fn alloc_custom_heap_pages(&self, pages: usize, prot: MmapProtection) -> Result<Address, AllocationError> {
        debug_assert!(pages > 0);
        let bytes = conversions::pages_to_bytes(pages);
        let from_region = self.pre_reserved.as_ref().and_then(|region| {
            match region.alloc(None, bytes, AllocationType::ReserveAndCommit, prot, true) {
                Ok(start) => Some(start),
                Err(e) => {
                    debug!("Pre-reserved region cannot take {} pages: {}", pages, e);
                    None
                }
            }
        });
        let (start, pre_reserved) = match from_region {
            Some(start) => (start, true),
            None => {
                let start = self
                    .virtual_alloc
                    .alloc(None, bytes, AllocationType::ReserveAndCommit, prot, true)
                    .map_err(|e| {
                        warn!("Custom-heap allocation of {} pages failed: {}", pages, e);
                        e.to_allocation_error()
                    })?;
                (start, false)
            }
        };
        self.custom_heap
            .lock()
            .unwrap()
            .insert(start, CustomHeapRange { pages, pre_reserved });
        trace!("Allocated {} custom-heap pages at {} (pre-reserved: {})", pages, start, pre_reserved);
        Ok(start)
    }

    /// Give the physical pages of a custom-heap allocation back, keeping its
    /// address range for [`recommit_custom_heap_pages`](Self::recommit_custom_heap_pages).
    pub fn decommit_custom_heap_pages(&self, start: Address) -> Result<(), PageError> {
        let (bytes, pre_reserved) = self.custom_heap_range(start)?;
        match (pre_reserved, self.pre_reserved.as_ref()) {
            (true, Some(region)) => region.free(start, bytes, FreeType::Decommit),
            (true, None) => Err(PageError::BadPageState),
            (false, _) => self.virtual_alloc.free(start, bytes, FreeType::Decommit),
        }
    }

    pub fn recommit_custom_heap_pages(&self, start: Address, prot: MmapProtection) -> Result<(), PageError> {
        let (bytes, pre_reserved) = self.custom_heap_range(start)?;
        let committed = match (pre_reserved, self.pre_reserved.as_ref()) {
            (true, Some(region)) => region.alloc(Some(start), bytes, AllocationType::Commit, prot, true),
            (true, None) => Err(PageError::BadPageState),
            (false, _) => self
                .virtual_alloc
                .alloc(Some(start), bytes, AllocationType::Commit, prot, true),
        };
        committed.map(|_| ())
    }

    /// Return a custom-heap allocation. Pre-reserved pages go back to the
    /// region; the region itself stays reserved.
    pub fn release_custom_heap_pages(&self, start: Address) -> Result<(), PageError> {
        let range = self
            .custom_heap
            .lock()
            .unwrap()
            .remove(&start)
            .ok_or(PageError::InvalidRange)?;
        let bytes = conversions::pages_to_bytes(range.pages);
        match (range.pre_reserved, self.pre_reserved.as_ref()) {
            (true, Some(region)) => region.free(start, bytes, FreeType::Release),
            (true, None) => Err(PageError::BadPageState),
            (false, _) => self.virtual_alloc.free(start, 0, FreeType::Release),
        }
    }

    fn custom_heap_range(&self, start: Address) -> Result<(usize, bool), PageError> {
        self.custom_heap
            .lock()
            .unwrap()
            .get(&start)
            .map(|range| (conversions::pages_to_bytes(range.pages), range.pre_reserved))
            .ok_or(PageError::InvalidRange)
    }

    pub fn custom_heap_allocation_count(&self) -> usize {
        self.custom_heap.lock().unwrap().len()
    }

    /// Is `addr` inside the pre-reserved region, if there is one?
    pub fn is_pre_reserved(&self, addr: Address) -> bool {
        self.pre_reserved
            .as_ref()
            .is_some_and(|region| region.is_in_range(addr))
    }

    /// Decommit every free page and release segments that are entirely free.
    /// Returns the number of pages decommitted.
    pub fn decommit_now(&self) -> usize {
        let mut guard = self.sync.lock().unwrap();
        let sync = &mut *guard;
        let mut decommitted = 0;
        let mut empty_segments = vec![];
        for segment in sync.segments.values_mut().filter(|s| !s.dedicated) {
            for index in 0..segment.pages {
                if segment.free_pages.test(index) && !segment.decommitted_pages.test(index) {
                    let page = segment.page_address(index);
                    match memory::decommit(page, BYTES_IN_PAGE) {
                        Ok(()) => {
                            segment.decommitted_pages.set(index);
                            decommitted += 1;
                        }
                        Err(e) => warn!("Failed to decommit page {}: {}", page, e),
                    }
                }
            }
            if segment.is_all_free() {
                empty_segments.push(segment.start);
            }
        }
        for start in empty_segments {
            sync.segments.remove(&start);
            if let Err(e) = self.virtual_alloc.free(start, 0, FreeType::Release) {
                warn!("Failed to release segment {}: {}", start, e);
            }
        }
        sync.free_page_count = 0;
        self.accounting.decommit(decommitted);
        debug!("Decommitted {} free pages", decommitted);
        decommitted
    }

    /// Decommit committed free pages above the retention limit.
    pub fn trim_free_pages(&self) {
        let over = {
            let sync = self.sync.lock().unwrap();
            sync.free_page_count > self.max_free_page_count
        };
        if over {
            self.decommit_now();
        }
    }

    pub fn used_pages(&self) -> usize {
        self.sync.lock().unwrap().used_page_count
    }

    pub fn free_page_count(&self) -> usize {
        self.sync.lock().unwrap().free_page_count
    }

    pub fn segment_count(&self) -> usize {
        self.sync.lock().unwrap().segments.len()
    }

    pub fn committed_pages(&self) -> usize {
        self.accounting.get_committed_pages()
    }

    pub fn reserved_pages(&self) -> usize {
        self.accounting.get_reserved_pages()
    }

    pub fn card_table(&self) -> &Arc<CardTable> {
        &self.card_table
    }

    /// Is `addr` inside memory this allocator currently has in use?
    pub fn is_in_use(&self, addr: Address) -> bool {
        let sync = self.sync.lock().unwrap();
        sync.segments
            .range(..=addr)
            .next_back()
            .is_some_and(|(_, s)| {
                addr < s.end() && (s.dedicated || !s.free_pages.test(s.page_index(addr)))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_allocator(max_free: usize) -> PageAllocator {
        PageAllocator::new(Arc::new(CardTable::new()), 64 * BYTES_IN_MBYTE, max_free)
    }

    #[test]
    fn pages_are_writable_and_covered_by_cards() {
        let pa = new_allocator(1024);
        let addr = pa.alloc_pages(2).unwrap();
        assert!(conversions::is_page_aligned(addr));
        unsafe {
            (addr + (BYTES_IN_PAGE + 8)).store(99usize);
        }
        assert!(pa.card_table().covers(addr));
        assert!(pa.is_in_use(addr));
        assert_eq!(pa.used_pages(), 2);
        assert_eq!(pa.committed_pages(), 2);
    }

    #[test]
    fn released_pages_are_reused() {
        let pa = new_allocator(1024);
        let a = pa.alloc_pages(1).unwrap();
        pa.release_pages(a, 1).unwrap();
        assert_eq!(pa.free_page_count(), 1);
        assert!(!pa.is_in_use(a));
        let b = pa.alloc_pages(1).unwrap();
        assert_eq!(a, b);
        assert_eq!(pa.free_page_count(), 0);
        assert_eq!(pa.segment_count(), 1);
    }

    #[test]
    fn double_release_is_bad_page_state() {
        let pa = new_allocator(1024);
        let a = pa.alloc_pages(4).unwrap();
        pa.release_pages(a, 4).unwrap();
        assert!(matches!(pa.release_pages(a, 4), Err(PageError::BadPageState)));
        assert_eq!(pa.free_page_count(), 4);
    }

    #[test]
    fn release_beyond_retention_decommits() {
        let pa = new_allocator(0);
        let a = pa.alloc_pages(2).unwrap();
        unsafe {
            a.store(5usize);
        }
        pa.release_pages(a, 2).unwrap();
        assert_eq!(pa.free_page_count(), 0);
        assert_eq!(pa.committed_pages(), 0);
        // Re-committed pages read as zero.
        let b = pa.alloc_pages(2).unwrap();
        assert_eq!(a, b);
        unsafe {
            assert_eq!(b.load::<usize>(), 0);
        }
    }

    #[test]
    fn large_requests_get_dedicated_segments() {
        let pa = new_allocator(1024);
        let pages = MAX_PAGES_IN_SHARED_SEGMENT + 1;
        let a = pa.alloc_pages(pages).unwrap();
        assert_eq!(pa.segment_count(), 1);
        assert!(pa.is_in_use(a + conversions::pages_to_bytes(pages - 1)));
        pa.release_pages(a, pages).unwrap();
        assert_eq!(pa.segment_count(), 0);
        assert_eq!(pa.used_pages(), 0);
    }

    #[test]
    fn decommit_now_releases_empty_segments() {
        let pa = new_allocator(1024);
        let a = pa.alloc_pages(3).unwrap();
        let b = pa.alloc_pages(1).unwrap();
        pa.release_pages(a, 3).unwrap();
        assert_eq!(pa.decommit_now(), 3);
        assert_eq!(pa.segment_count(), 1);
        pa.release_pages(b, 1).unwrap();
        pa.decommit_now();
        assert_eq!(pa.segment_count(), 0);
        assert_eq!(pa.committed_pages(), 0);
    }

    #[test]
    fn custom_heap_pages_come_from_the_pre_reserved_region() {
        let region = 4 * BYTES_IN_ALLOCATION_GRANULARITY;
        let pa = PageAllocator::with_custom_heap(Arc::new(CardTable::new()), 4 * BYTES_IN_PAGE, 1024, region, true);
        let code = pa.alloc_custom_heap_pages(2, MmapProtection::ReadWrite).unwrap();
        assert!(pa.is_pre_reserved(code));
        unsafe {
            code.store(0xC3u8);
        }
        // Code pages are not heap pages.
        assert_eq!(pa.used_pages(), 0);
        assert!(!pa.is_in_use(code));

        pa.decommit_custom_heap_pages(code).unwrap();
        pa.recommit_custom_heap_pages(code, MmapProtection::ReadWrite).unwrap();
        unsafe {
            assert_eq!(code.load::<u8>(), 0);
        }
        pa.release_custom_heap_pages(code).unwrap();
        assert_eq!(pa.custom_heap_allocation_count(), 0);
        assert!(matches!(pa.release_custom_heap_pages(code), Err(PageError::InvalidRange)));

        // The released segment is reused.
        let again = pa.alloc_custom_heap_pages(1, MmapProtection::ReadWrite).unwrap();
        assert_eq!(again, code);
    }

    #[test]
    fn full_region_falls_back_to_own_reservation() {
        let region = BYTES_IN_ALLOCATION_GRANULARITY;
        let pa = PageAllocator::with_custom_heap(Arc::new(CardTable::new()), 4 * BYTES_IN_PAGE, 1024, region, false);
        let pages = region >> LOG_BYTES_IN_PAGE;
        let first = pa.alloc_custom_heap_pages(pages, MmapProtection::ReadWrite).unwrap();
        let second = pa.alloc_custom_heap_pages(1, MmapProtection::ReadWrite).unwrap();
        assert!(pa.is_pre_reserved(first));
        assert!(!pa.is_pre_reserved(second));
        pa.release_custom_heap_pages(second).unwrap();
        pa.release_custom_heap_pages(first).unwrap();
    }

    #[test]
    fn heap_limit_is_enforced() {
        let pa = PageAllocator::new(Arc::new(CardTable::new()), 4 * BYTES_IN_PAGE, 1024);
        let a = pa.alloc_pages(4).unwrap();
        assert_eq!(pa.alloc_pages(1), Err(AllocationError::HeapOutOfMemory));
        pa.release_pages(a, 4).unwrap();
        assert!(pa.alloc_pages(1).is_ok());
    }
}
