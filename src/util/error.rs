//! Errors that leave the collector through ordinary return values.

use std::fmt;

/// Why an allocation could not be satisfied.
///
/// This is the only error a mutator ever sees from the recycler. Failures
/// inside the collector's own bookkeeping are fatal instead, see
/// [`crate::util::fatal`].
#[repr(C)]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum AllocationError {
    /// The heap limit (`max_heap_size`) is too small for the program to continue,
    /// even after a full collection.
    HeapOutOfMemory,
    /// The OS is unable to reserve or commit more memory. Critical error. The host
    /// is expected to abort if such an error is reported.
    MmapOutOfMemory,
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationError::HeapOutOfMemory => write!(f, "heap out of memory"),
            AllocationError::MmapOutOfMemory => write!(f, "out of virtual memory"),
        }
    }
}

impl std::error::Error for AllocationError {}

/// Errors from the page-level allocators.
#[derive(Debug)]
pub enum PageError {
    /// The page bookkeeping does not match the request, e.g. releasing pages
    /// that are already free. Callers inside the collector treat this as fatal.
    BadPageState,
    /// The range is not inside memory this allocator handed out, or the size
    /// does not follow the free-type convention.
    InvalidRange,
    /// The single up-front reservation failed earlier; the allocator is unusable.
    ReservationUnavailable,
    /// The OS call itself failed.
    Os(std::io::Error),
}

impl fmt::Display for PageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageError::BadPageState => write!(f, "bad page state"),
            PageError::InvalidRange => write!(f, "invalid range"),
            PageError::ReservationUnavailable => write!(f, "pre-reserved region unavailable"),
            PageError::Os(e) => write!(f, "os error: {}", e),
        }
    }
}

impl std::error::Error for PageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PageError::Os(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PageError {
    fn from(e: std::io::Error) -> Self {
        PageError::Os(e)
    }
}

impl PageError {
    /// Map a page allocator failure onto what the mutator is told.
    pub fn to_allocation_error(&self) -> AllocationError {
        match self {
            PageError::Os(_) | PageError::ReservationUnavailable => {
                AllocationError::MmapOutOfMemory
            }
            PageError::BadPageState | PageError::InvalidRange => AllocationError::HeapOutOfMemory,
        }
    }
}
