//! Parallel marking. The mark stack is split into pieces, the helpers drain
//! one piece each while the calling thread drains what is left, and the pieces
//! are merged back once every helper is done.

use std::sync::{Arc, Mutex};

use crate::scheduler::WorkerThread;
use crate::util::mark::MarkContext;

pub struct ParallelMarker {
    helpers: Vec<WorkerThread>,
    wanted: usize,
    min_chunks: usize,
    /// Spawning failed once. Do not try again.
    spawn_failed: bool,
}

impl ParallelMarker {
    pub fn new(threads: usize, min_chunks: usize) -> Self {
        ParallelMarker {
            helpers: vec![],
            wanted: threads,
            min_chunks,
            spawn_failed: false,
        }
    }

    pub fn helper_count(&self) -> usize {
        self.helpers.len()
    }

    fn ensure_helpers(&mut self) -> usize {
        while !self.spawn_failed && self.helpers.len() < self.wanted {
            let name = format!("recycler-mark-{}", self.helpers.len());
            match WorkerThread::spawn(&name) {
                Ok(helper) => self.helpers.push(helper),
                Err(e) => {
                    warn!("Unable to start {}: {}. Marking with {} helpers", name, e, self.helpers.len());
                    self.spawn_failed = true;
                }
            }
        }
        self.helpers.len()
    }

    /// Is there enough work in `context` to share, and anyone to share it
    /// with?
    pub fn should_share(&mut self, context: &MarkContext) -> bool {
        self.wanted != 0 && context.mark_stack_chunks() >= self.min_chunks && self.ensure_helpers() != 0
    }

    /// Drain `context` together with the helpers. The caller has checked
    /// [`should_share`](Self::should_share).
    pub fn drain_shared(&mut self, context: &mut MarkContext) {
        debug_assert!(!self.helpers.is_empty());
        let pieces = context.split(self.helpers.len());
        let mut slots = Vec::with_capacity(pieces.len());
        for (helper, piece) in self.helpers.iter().zip(pieces) {
            let slot = Arc::new(Mutex::new(Some(piece)));
            let job_slot = slot.clone();
            helper.submit(Box::new(move || {
                let piece = job_slot.lock().unwrap().take();
                if let Some(mut piece) = piece {
                    piece.drain();
                    *job_slot.lock().unwrap() = Some(piece);
                }
            }));
            slots.push(slot);
        }
        debug!("Parallel mark with {} helpers", slots.len());

        context.drain();
        for (helper, slot) in self.helpers.iter().zip(slots.iter()) {
            helper.wait_done(None);
            if let Some(piece) = slot.lock().unwrap().take() {
                context.merge(piece);
            }
        }
        // Whatever a helper could not push went to its track stack or set its
        // out-of-memory flag; both came back with the merge.
        context.drain();
    }

    pub fn shutdown(&mut self) {
        self.helpers.clear();
    }
}
