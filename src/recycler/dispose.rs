use super::Recycler;
use crate::util::constants::INFINITE;

const SHUTDOWN_DISPOSE_ROUNDS: usize = 3;

impl Recycler {
    /// Run dispose for every finalized object and free them. Does nothing
    /// during a collection or from inside a dispose callback. Returns the
    /// number of objects disposed.
    pub fn dispose(&mut self) -> usize {
        if self.in_dispose || self.is_collection_in_progress() {
            return 0;
        }
        self.dispose_objects(false)
    }

    pub fn has_pending_dispose(&self) -> bool {
        self.heap.has_pending_dispose()
    }

    pub fn is_in_dispose(&self) -> bool {
        self.in_dispose
    }

    /// Nothing outlives the recycler: every finalizable object left gets
    /// finalized and disposed. Dispose may allocate more of them, so this
    /// repeats a bounded number of times.
    pub(super) fn dispose_at_shutdown(&mut self) {
        let mut disposed = self.dispose_objects(true);
        for _ in 0..SHUTDOWN_DISPOSE_ROUNDS {
            if self.heap.finalize_all(&self.kinds) == 0 {
                break;
            }
            disposed += self.dispose_objects(true);
        }
        if disposed > 0 {
            debug!("{}: disposed {} objects at shutdown", self.id, disposed);
        }
    }

    pub(super) fn dispose_objects(&mut self, is_shutdown: bool) -> usize {
        let objects = self.heap.pending_dispose_objects();
        if objects.is_empty() {
            return 0;
        }

        self.in_dispose = true;
        for object in objects.iter() {
            let dispose = self.kinds.get(object.kind).dispose;
            if let Some(dispose) = dispose {
                dispose(self, object.object, object.size, is_shutdown);
            }
        }
        self.in_dispose = false;

        // A callback may have started a collection. The objects are still
        // roots for it, so it has to end before they are freed.
        if self.is_collection_in_progress() {
            self.finish_concurrent_collection(INFINITE);
        }
        let freed = self.heap.release_disposed(&objects);
        debug!(
            "{}: disposed {} objects, {} bytes freed{}",
            self.id,
            objects.len(),
            freed,
            if is_shutdown { " at shutdown" } else { "" }
        );
        objects.len()
    }
}
