//! The incremental collector.
//!
//! - [`incremental`]: phase machine, pacing, the step and full-collection
//!   entry points
//! - `mark`: root marking, propagation and the atomic closing step
//! - `sweep`: string and object sweeping, object freeing
//! - `finalize`: the pending-finalization queue and finalizer calls

pub mod incremental;
mod finalize;
mod mark;
mod sweep;
pub(crate) mod tracing;

pub use incremental::{
    GcConfig, GcPhase, DEFAULT_PAUSE, DEFAULT_STEP_MULTIPLIER, GC_FINALIZE_COST, GC_STEP_SIZE,
    GC_SWEEP_COST, GC_SWEEP_MAX,
};
pub use finalize::FinalizerInvoker;
pub(crate) use incremental::GcState;
