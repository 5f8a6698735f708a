extern crate recycler;

use recycler::util::constants::{BYTES_IN_PAGE, MAX_PAGES_IN_SHARED_SEGMENT};
use recycler::util::error::{AllocationError, PageError};
use recycler::util::heap::PageAllocator;
use recycler::ProcessContext;

fn allocator(max_heap_pages: usize, max_free_page_count: usize) -> PageAllocator {
    let context = ProcessContext::new();
    PageAllocator::new(
        context.card_table().clone(),
        max_heap_pages * BYTES_IN_PAGE,
        max_free_page_count,
    )
}

#[test]
fn allocated_pages_are_usable() {
    let pa = allocator(1024, 1024);
    let addr = pa.alloc_pages(4).unwrap();
    assert!(addr.is_aligned_to(BYTES_IN_PAGE));
    assert_eq!(pa.used_pages(), 4);
    assert!(pa.is_in_use(addr));
    assert!(pa.is_in_use(addr + 3 * BYTES_IN_PAGE));

    unsafe {
        let last = addr + (4 * BYTES_IN_PAGE - std::mem::size_of::<usize>());
        last.store::<usize>(0xdead);
        assert_eq!(last.load::<usize>(), 0xdead);
    }

    pa.release_pages(addr, 4).unwrap();
    assert_eq!(pa.used_pages(), 0);
    assert!(!pa.is_in_use(addr));
    // Kept committed for reuse.
    assert_eq!(pa.free_page_count(), 4);
}

#[test]
fn double_release_is_rejected() {
    let pa = allocator(1024, 1024);
    let addr = pa.alloc_pages(2).unwrap();
    pa.release_pages(addr, 2).unwrap();
    assert!(matches!(pa.release_pages(addr, 2), Err(PageError::BadPageState)));
}

#[test]
fn large_requests_get_their_own_segment() {
    let pa = allocator(1024, 1024);
    let small = pa.alloc_pages(1).unwrap();
    assert_eq!(pa.segment_count(), 1);

    let pages = MAX_PAGES_IN_SHARED_SEGMENT + 1;
    let large = pa.alloc_pages(pages).unwrap();
    assert_eq!(pa.segment_count(), 2);
    assert!(matches!(pa.release_pages(large, 1), Err(PageError::InvalidRange)));

    pa.release_pages(large, pages).unwrap();
    assert_eq!(pa.segment_count(), 1);
    pa.release_pages(small, 1).unwrap();
}

#[test]
fn heap_limit_is_enforced() {
    let pa = allocator(16, 1024);
    let first = pa.alloc_pages(12).unwrap();
    assert_eq!(pa.alloc_pages(8), Err(AllocationError::HeapOutOfMemory));
    pa.release_pages(first, 12).unwrap();
    assert!(pa.alloc_pages(16).is_ok());
}

#[test]
fn decommit_returns_free_pages() {
    let pa = allocator(1024, 1024);
    let addrs: Vec<_> = (0..8).map(|_| pa.alloc_pages(2).unwrap()).collect();
    for addr in addrs {
        pa.release_pages(addr, 2).unwrap();
    }
    assert_eq!(pa.free_page_count(), 16);

    assert_eq!(pa.decommit_now(), 16);
    assert_eq!(pa.free_page_count(), 0);
    // The segment was entirely free, so its reservation is gone too.
    assert_eq!(pa.segment_count(), 0);
    assert!(pa.alloc_pages(2).is_ok());
}

#[test]
fn release_beyond_retention_decommits() {
    let pa = allocator(1024, 2);
    let a = pa.alloc_pages(2).unwrap();
    let b = pa.alloc_pages(2).unwrap();
    pa.release_pages(a, 2).unwrap();
    assert_eq!(pa.free_page_count(), 2);
    pa.release_pages(b, 2).unwrap();
    assert_eq!(pa.free_page_count(), 2);
}
