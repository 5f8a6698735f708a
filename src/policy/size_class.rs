//! Size classes. Small objects live in one-page blocks, medium objects in
//! eight-page blocks, and anything larger gets a block of its own.

use enum_map::Enum;
use static_assertions::const_assert;
use strum_macros::{Display, EnumIter};

use crate::policy::attributes::ObjectAttributes;
use crate::util::constants::*;
use crate::util::conversions::raw_align_up;

pub const SMALL_ALLOCATION_GRANULARITY: usize = OBJECT_GRANULARITY;
pub const MAX_SMALL_OBJECT_SIZE: usize = 768;
pub const SMALL_BLOCK_PAGES: usize = 1;
pub const SMALL_BUCKET_COUNT: usize = MAX_SMALL_OBJECT_SIZE / SMALL_ALLOCATION_GRANULARITY;

pub const MEDIUM_ALLOCATION_GRANULARITY: usize = 256;
pub const MIN_MEDIUM_OBJECT_SIZE: usize = 1024;
pub const MAX_MEDIUM_OBJECT_SIZE: usize = 8192;
pub const MEDIUM_BLOCK_PAGES: usize = 8;
pub const MEDIUM_BUCKET_COUNT: usize =
    (MAX_MEDIUM_OBJECT_SIZE - MIN_MEDIUM_OBJECT_SIZE) / MEDIUM_ALLOCATION_GRANULARITY + 1;

pub const BUCKET_COUNT: usize = SMALL_BUCKET_COUNT + MEDIUM_BUCKET_COUNT;

const_assert!(MAX_SMALL_OBJECT_SIZE * 4 <= SMALL_BLOCK_PAGES * BYTES_IN_PAGE);
const_assert!(MAX_MEDIUM_OBJECT_SIZE * 4 <= MEDIUM_BLOCK_PAGES * BYTES_IN_PAGE);
const_assert!(MAX_SMALL_OBJECT_SIZE < MIN_MEDIUM_OBJECT_SIZE);
const_assert!(MEDIUM_BLOCK_PAGES <= MAX_PAGES_IN_SHARED_SEGMENT);

/// Which block family an allocation with the given attributes goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum, Display, EnumIter)]
pub enum BlockFlavor {
    /// Never traced.
    Leaf,
    Normal,
    /// Swept on the mutator thread, with finalize and dispose.
    Finalizable,
}

impl BlockFlavor {
    pub fn of(attributes: ObjectAttributes) -> Self {
        if attributes.is_finalizable() || attributes.is_tracked() {
            BlockFlavor::Finalizable
        } else if attributes.is_leaf() {
            BlockFlavor::Leaf
        } else {
            BlockFlavor::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeCategory {
    Small,
    Medium,
    Large,
}

/// The geometry of the blocks of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
    pub index: usize,
    pub object_size: usize,
    pub block_pages: usize,
}

impl SizeClass {
    pub const fn object_count(&self) -> usize {
        (self.block_pages << LOG_BYTES_IN_PAGE) / self.object_size
    }

    pub const fn category(&self) -> SizeCategory {
        if self.index < SMALL_BUCKET_COUNT {
            SizeCategory::Small
        } else {
            SizeCategory::Medium
        }
    }

    pub const fn from_index(index: usize) -> SizeClass {
        if index < SMALL_BUCKET_COUNT {
            SizeClass {
                index,
                object_size: (index + 1) * SMALL_ALLOCATION_GRANULARITY,
                block_pages: SMALL_BLOCK_PAGES,
            }
        } else {
            SizeClass {
                index,
                object_size: MIN_MEDIUM_OBJECT_SIZE
                    + (index - SMALL_BUCKET_COUNT) * MEDIUM_ALLOCATION_GRANULARITY,
                block_pages: MEDIUM_BLOCK_PAGES,
            }
        }
    }

    /// The bucketed size class for `size`, or `None` for a large object.
    pub const fn for_size(size: usize) -> Option<SizeClass> {
        let size = if size == 0 { 1 } else { size };
        if size <= MAX_SMALL_OBJECT_SIZE {
            Some(Self::from_index(
                raw_align_up(size, SMALL_ALLOCATION_GRANULARITY) / SMALL_ALLOCATION_GRANULARITY - 1,
            ))
        } else if size <= MAX_MEDIUM_OBJECT_SIZE {
            let aligned = if size <= MIN_MEDIUM_OBJECT_SIZE {
                MIN_MEDIUM_OBJECT_SIZE
            } else {
                raw_align_up(size, MEDIUM_ALLOCATION_GRANULARITY)
            };
            Some(Self::from_index(
                SMALL_BUCKET_COUNT
                    + (aligned - MIN_MEDIUM_OBJECT_SIZE) / MEDIUM_ALLOCATION_GRANULARITY,
            ))
        } else {
            None
        }
    }
}

/// Size of a large object after rounding.
pub const fn large_object_size(size: usize) -> usize {
    raw_align_up(size, OBJECT_GRANULARITY)
}
