//! Collector debug events.

use super::GcPhase;

#[cfg(feature = "tracing")]
pub fn log_step(budget: usize, phase: GcPhase, debt: usize) {
    tracing::debug!(budget, phase = ?phase, debt, "gc_step");
}

#[cfg(feature = "tracing")]
pub fn log_phase_transition(from: GcPhase, to: GcPhase, total_bytes: usize) {
    tracing::debug!(from = ?from, to = ?to, total_bytes, "phase_transition");
}

#[cfg(feature = "tracing")]
pub fn log_atomic(estimate: usize, weak_tables: usize, separated: usize) {
    tracing::debug!(estimate, weak_tables, separated, "atomic");
}

#[cfg(feature = "tracing")]
pub fn log_sweep_done(phase: GcPhase, freed: usize, bytes: usize) {
    tracing::debug!(phase = ?phase, freed, bytes, "sweep_done");
}

#[cfg(feature = "tracing")]
pub fn log_finalizer(pending: usize) {
    tracing::debug!(pending, "finalizer");
}

#[cfg(feature = "tracing")]
pub fn log_emergency(requested: usize, total_bytes: usize) {
    tracing::warn!(requested, total_bytes, "emergency_collection");
}

#[cfg(not(feature = "tracing"))]
#[inline(always)]
pub const fn log_step(_budget: usize, _phase: GcPhase, _debt: usize) {}

#[cfg(not(feature = "tracing"))]
#[inline(always)]
pub const fn log_phase_transition(_from: GcPhase, _to: GcPhase, _total_bytes: usize) {}

#[cfg(not(feature = "tracing"))]
#[inline(always)]
pub const fn log_atomic(_estimate: usize, _weak_tables: usize, _separated: usize) {}

#[cfg(not(feature = "tracing"))]
#[inline(always)]
pub const fn log_sweep_done(_phase: GcPhase, _freed: usize, _bytes: usize) {}

#[cfg(not(feature = "tracing"))]
#[inline(always)]
pub const fn log_finalizer(_pending: usize) {}

#[cfg(not(feature = "tracing"))]
#[inline(always)]
pub const fn log_emergency(_requested: usize, _total_bytes: usize) {}
