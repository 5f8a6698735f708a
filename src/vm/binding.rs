use std::sync::Arc;

use crate::recycler::CollectionStats;
use crate::scheduler::ThreadService;
use crate::util::error::AllocationError;
use crate::util::Address;
use crate::vm::ObjectTracer;

/// What the recycler needs from the embedding runtime. Every method has a
/// default so a host only implements what it has.
pub trait HostBinding: Send + Sync + 'static {
    /// Report every root the host holds outside the recycler: handles, globals,
    /// interpreter frames. Called on the mutator thread.
    fn scan_external_roots(&self, _tracer: &mut dyn ObjectTracer) {}

    /// The `(low, high)` bounds of the mutator stack, used when `scan_stack` is on.
    /// The range must include the caller's frame.
    fn stack_range(&self) -> Option<(Address, Address)> {
        None
    }

    /// Delegated to the host on an allocation the recycler cannot satisfy, even after a
    /// forced full collection. The host either throws its own out-of-memory
    /// condition (by unwinding) or terminates.
    ///
    /// Arguments:
    /// * `err`: The type of out-of-memory error.
    fn out_of_memory(&self, err: AllocationError) -> ! {
        panic!("Out of memory with {:?}!", err);
    }

    /// A host-provided way to run background work. Without one the recycler
    /// spawns its own background thread.
    fn thread_service(&self) -> Option<Arc<dyn ThreadService>> {
        None
    }

    /// Called once a collection has completely finished, before dispose runs.
    fn post_collection(&self, _stats: &CollectionStats) {}
}
