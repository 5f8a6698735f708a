//! The interface between the recycler and the runtime that embeds it.
//!
//! A host implements [`HostBinding`] for root enumeration and out-of-memory
//! handling, and describes its object layouts with an [`ObjectKindTable`].

mod binding;
mod object_kind;

pub use self::binding::HostBinding;
pub use self::object_kind::*;
