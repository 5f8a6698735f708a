//! The heap: blocks of same-sized objects grouped into buckets by size class
//! and flavor, the lists that track them through a collection, and the
//! sweeping that rebuilds their free lists.

pub mod allocator;
pub mod attributes;
pub mod block_list;
pub mod block_map;
pub mod heap_block;
pub mod heap_bucket;
pub mod heap_info;
pub mod large_bucket;
pub mod size_class;
pub mod sweep;

pub use self::attributes::ObjectAttributes;
pub use self::heap_info::HeapInfo;
