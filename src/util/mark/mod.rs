//! Marking state: the chunked stacks and the context that drives them.

pub mod mark_context;
pub mod page_stack;

pub use mark_context::{MarkContext, MarkOutcome, ScanItem};
pub use page_stack::PageStack;
