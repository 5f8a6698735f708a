//! Sweep sessions and the heuristics that decide how much to sweep.

pub mod recycler_sweep;
pub mod sweep_manager;

pub use recycler_sweep::{RecyclerSweep, SweepCounters};
pub use sweep_manager::{PartialAdjustment, RecyclerSweepManager};
