//! Background execution for the recycler: a dedicated collection thread (or a
//! host thread service), parallel mark helpers, and the events they are
//! driven by.

mod event;
mod thread_service;
mod worker;

pub use event::AutoResetEvent;
pub use thread_service::{DeferredThreadService, Job, ThreadService};
pub use worker::{BackgroundExecutor, WorkerThread};
