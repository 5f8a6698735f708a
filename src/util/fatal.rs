//! Non-recoverable collector failures.
//!
//! A collection that cannot guarantee it has found every live object cannot be
//! resumed, so these never travel as return values. They are logged and the
//! process panics (hosts usually build with `panic = "abort"`).

use strum_macros::Display;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum FatalError {
    /// The mark stack could not grow, and marking still failed after the
    /// configured number of decommit-and-rescan retries.
    MarkStackOutOfMemory,
    /// Page or free-bit bookkeeping is corrupted.
    BadPageState,
    /// A write to a heap object was not recorded in the card table.
    WriteBarrierVerification,
}

#[cold]
pub fn fatal_error(kind: FatalError, detail: &str) -> ! {
    error!("Fatal recycler error {}: {}", kind, detail);
    panic!("Fatal recycler error {}: {}", kind, detail);
}
