//! The recycler is a precise, non-moving mark-and-sweep garbage collector for
//! language runtimes, together with the segmented page allocator its heap is
//! carved from.
//!
//! Objects live in size-classed heap blocks. Their mark, free and attribute
//! bits are kept out of band, so objects carry no header. A collection can
//! mark on a background thread while the host keeps running (concurrent), can
//! split the mark across helper threads (parallel), and can skip blocks that
//! are unlikely to hold garbage (partial). Finalizable objects get a finalize
//! callback during sweep and a dispose callback once the collection is over.
//!
//! Hosts talk to the recycler through [`memory_manager`] and describe
//! themselves with the traits in [`vm`]:
//!
//! * [`vm::HostBinding`] reports roots the recycler cannot see and handles
//!   out-of-memory conditions.
//! * [`vm::ObjectKindTable`] holds the trace, finalize and dispose callbacks of
//!   every kind of object the host allocates.
//!
//! Every write of a reference into a recycler object must go through the
//! write barrier ([`memory_manager::object_reference_write`]), or concurrent
//! and partial collections will miss it.

#[macro_use]
extern crate log;

pub mod context;
pub mod memory_manager;
pub mod policy;
pub mod recycler;
pub mod scheduler;
pub mod util;
pub mod vm;

pub use crate::context::{ProcessContext, RecyclerId};
pub use crate::policy::ObjectAttributes;
pub use crate::recycler::{CollectionFlags, CollectionState, CollectionStats, Recycler, WeakReference};
pub use crate::util::options::Options;
pub use crate::util::Address;

#[cfg(test)]
mod tests;
