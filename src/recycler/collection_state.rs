use std::sync::Arc;

use atomic::{Atomic, Ordering};
use bytemuck::NoUninit;
use strum_macros::Display;

/// The phase a recycler is in. Only the mutator thread changes it; background
/// jobs read it through the same atomic word.
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Copy, Clone, NoUninit, Display)]
pub enum CollectionState {
    NotCollecting,
    ResetMarks,
    FindRoots,
    Mark,
    ParallelMark,
    ConcurrentMark,
    RescanFindRoots,
    RescanMark,
    Sweep,
    ConcurrentSweep,
    TransferSweptWait,
    TransferSwept,
    PostCollectionCallback,
    /// Terminal. Set when the recycler is shutting down.
    Exit,
}

impl Default for CollectionState {
    fn default() -> Self {
        Self::NotCollecting
    }
}

impl CollectionState {
    pub fn is_collecting(self) -> bool {
        !matches!(self, CollectionState::NotCollecting | CollectionState::Exit)
    }

    /// A phase whose work runs on the background thread while the mutator
    /// continues.
    pub fn is_concurrent(self) -> bool {
        matches!(
            self,
            CollectionState::ConcurrentMark
                | CollectionState::ConcurrentSweep
                | CollectionState::TransferSweptWait
        )
    }

    /// Objects allocated in this phase are born marked.
    pub fn allocates_black(self) -> bool {
        matches!(
            self,
            CollectionState::ConcurrentMark
                | CollectionState::RescanFindRoots
                | CollectionState::RescanMark
        )
    }

    /// Marking has started but its result is not final yet.
    pub fn is_marking(self) -> bool {
        matches!(
            self,
            CollectionState::FindRoots
                | CollectionState::Mark
                | CollectionState::ParallelMark
                | CollectionState::ConcurrentMark
                | CollectionState::RescanFindRoots
                | CollectionState::RescanMark
        )
    }
}

#[derive(Clone)]
pub struct CollectionStateWatcher(Arc<Atomic<CollectionState>>);

impl CollectionStateWatcher {
    pub(super) fn new(state: Arc<Atomic<CollectionState>>) -> Self {
        CollectionStateWatcher(state)
    }

    pub fn get(&self) -> CollectionState {
        self.0.load(Ordering::Acquire)
    }
}
