//! Thin wrappers over the OS virtual memory interface.

pub mod memory;

pub use memory::{MmapAnnotation, MmapProtection};
