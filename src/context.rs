//! The process-wide context.
//!
//! The card table covers the whole address space, so every recycler in the
//! process shares one. A [`ProcessContext`] owns it and knows which recyclers
//! are alive. It is created before the first recycler and torn down after the
//! last one is dropped.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::util::write_barrier::CardTable;

/// Identifies one recycler within its context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecyclerId(usize);

impl fmt::Display for RecyclerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "recycler#{}", self.0)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ContextError {
    /// Recyclers are still registered.
    InUse(usize),
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextError::InUse(count) => write!(f, "{} recyclers are still alive", count),
        }
    }
}

impl std::error::Error for ContextError {}

pub struct ProcessContext {
    card_table: Arc<CardTable>,
    recyclers: Mutex<BTreeSet<RecyclerId>>,
    next_id: AtomicUsize,
}

impl ProcessContext {
    pub fn new() -> Arc<Self> {
        Arc::new(ProcessContext {
            card_table: Arc::new(CardTable::new()),
            recyclers: Mutex::new(BTreeSet::new()),
            next_id: AtomicUsize::new(1),
        })
    }

    pub fn card_table(&self) -> &Arc<CardTable> {
        &self.card_table
    }

    pub(crate) fn register(&self) -> RecyclerId {
        let id = RecyclerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.recyclers.lock().unwrap().insert(id);
        debug!("Registered {}", id);
        id
    }

    pub(crate) fn unregister(&self, id: RecyclerId) {
        let removed = self.recyclers.lock().unwrap().remove(&id);
        debug_assert!(removed, "{} was not registered", id);
        debug!("Unregistered {}", id);
    }

    pub fn recycler_count(&self) -> usize {
        self.recyclers.lock().unwrap().len()
    }

    pub fn recyclers(&self) -> Vec<RecyclerId> {
        self.recyclers.lock().unwrap().iter().copied().collect()
    }

    /// The second half of the lifecycle. Fails while any recycler is alive.
    /// The card table goes away with the last reference to the context.
    pub fn teardown(self: Arc<Self>) -> Result<(), ContextError> {
        match self.recycler_count() {
            0 => {
                debug!(
                    "Process context torn down, {} card table sections were committed",
                    self.card_table.committed_sections()
                );
                Ok(())
            }
            count => Err(ContextError::InUse(count)),
        }
    }
}
