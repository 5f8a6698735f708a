//! Page-level memory: the OS wrapper, the pre-reserved custom-heap region, and
//! the segmented page allocator heap blocks are carved from.

mod accounting;
pub mod page_allocator;
pub mod pre_reserved;
pub mod virtual_alloc;

pub use self::accounting::PageAccounting;
pub use self::page_allocator::PageAllocator;
pub use self::pre_reserved::PreReservedVirtualAllocWrapper;
pub use self::virtual_alloc::{AllocationType, FreeType, VirtualAllocWrapper};
