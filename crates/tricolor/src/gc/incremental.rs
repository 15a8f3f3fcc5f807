//! Phase machine and pacing.
//!
//! A cycle walks `Pause -> Propagate -> SweepStrings -> Sweep -> Finalize ->
//! Pause`. [`Runtime::step`] advances it by a bounded amount of work that
//! grows with the bytes allocated past the threshold, and
//! [`Runtime::full_collect`] drives it through a whole cycle at once.

use std::collections::VecDeque;
use std::time::Instant;

use crate::color::White;
use crate::error::GcError;
use crate::metrics::CollectionType;
use crate::object::ObjRef;
use crate::value::Value;
use crate::Runtime;

use super::tracing::{log_phase_transition, log_step};

/// Default pause between cycles, in percent of the live estimate.
pub const DEFAULT_PAUSE: usize = 200;
/// Default collector speed relative to allocation, in percent.
pub const DEFAULT_STEP_MULTIPLIER: usize = 200;
/// Bytes of allocation that buy one unit of step budget.
pub const GC_STEP_SIZE: usize = 1024;
/// Objects examined by one general sweep step.
pub const GC_SWEEP_MAX: usize = 40;
/// Work charged per object swept.
pub const GC_SWEEP_COST: usize = 10;
/// Work charged per finalizer call.
pub const GC_FINALIZE_COST: usize = 100;

/// Collector phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum GcPhase {
    /// Idle between cycles.
    Pause = 0,
    /// Draining the gray list.
    Propagate = 1,
    /// Sweeping the string table one bucket at a time.
    SweepStrings = 2,
    /// Sweeping the general object and userdata lists.
    Sweep = 3,
    /// Calling pending finalizers.
    Finalize = 4,
}

impl GcPhase {
    /// Whether `self -> to` is an edge of the cycle.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pause, Self::Propagate)
                | (Self::Propagate | Self::Pause, Self::SweepStrings)
                | (Self::SweepStrings, Self::Sweep)
                | (Self::Sweep, Self::Finalize)
                | (Self::Finalize, Self::Pause | Self::Propagate)
        )
    }
}

/// Collector tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcConfig {
    /// Wait until the heap reaches this percentage of the last live estimate
    /// before starting a new cycle.
    pub pause: usize,
    /// Collector work per allocated byte, in percent. Zero makes every step
    /// unbounded.
    pub step_multiplier: usize,
    /// When false, crossing the threshold runs a full collection instead of
    /// a step.
    pub incremental: bool,
    /// Initial and minimum string table size; must be a power of two.
    pub min_string_table_size: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            pause: DEFAULT_PAUSE,
            step_multiplier: DEFAULT_STEP_MULTIPLIER,
            incremental: true,
            min_string_table_size: crate::string::MIN_STRING_TABLE_SIZE,
        }
    }
}

/// Mutable collector bookkeeping.
#[derive(Debug)]
pub(crate) struct GcState {
    pub phase: GcPhase,
    pub current_white: White,
    /// Reached objects whose children are not traversed yet.
    pub gray: Vec<ObjRef>,
    /// Objects to re-traverse atomically: barriered tables, threads.
    pub gray_again: Vec<ObjRef>,
    /// Tables with weak references, cleared after marking.
    pub weak: Vec<ObjRef>,
    /// Userdata waiting for their finalizer, in call order.
    pub tmudata: VecDeque<ObjRef>,
    /// Next string bucket to sweep.
    pub sweep_strings: usize,
    /// Next position in the general object list.
    pub sweep_objects: usize,
    /// Next position in the userdata list, swept after the object list.
    pub sweep_udata: usize,
    pub estimate: usize,
    pub threshold: usize,
    /// Allocation past the threshold that steps have not caught up with.
    pub debt: usize,
    /// Who is driving the current cycle.
    pub driver: CollectionType,
    pub in_finalizer: bool,
    /// Reused buffer for children collected during traversal.
    pub scratch: Vec<Value>,
}

impl GcState {
    pub const fn new() -> Self {
        Self {
            phase: GcPhase::Pause,
            current_white: White::ZERO,
            gray: Vec::new(),
            gray_again: Vec::new(),
            weak: Vec::new(),
            tmudata: VecDeque::new(),
            sweep_strings: 0,
            sweep_objects: 0,
            sweep_udata: 0,
            estimate: 0,
            threshold: 0,
            debt: 0,
            driver: CollectionType::Incremental,
            in_finalizer: false,
            scratch: Vec::new(),
        }
    }

    pub fn reset_sweep(&mut self) {
        self.sweep_strings = 0;
        self.sweep_objects = 0;
        self.sweep_udata = 0;
    }

    pub fn clear_lists(&mut self) {
        self.gray.clear();
        self.gray_again.clear();
        self.weak.clear();
    }
}

impl Runtime {
    /// Current collector phase.
    #[must_use]
    pub const fn phase(&self) -> GcPhase {
        self.gc.phase
    }

    /// Bytes currently charged through the allocator.
    #[must_use]
    pub const fn total_bytes(&self) -> usize {
        self.heap.total_bytes()
    }

    /// Allocation level at which the next step or cycle starts.
    #[must_use]
    pub const fn threshold(&self) -> usize {
        self.gc.threshold
    }

    /// Live-byte estimate from the last atomic step.
    #[must_use]
    pub const fn estimate(&self) -> usize {
        self.gc.estimate
    }

    /// Bytes allocated past the threshold and not yet paid for by a step.
    ///
    /// Carried across steps until the cycle completes.
    #[must_use]
    pub const fn debt(&self) -> usize {
        self.gc.debt.saturating_add(self.excess())
    }

    const fn excess(&self) -> usize {
        self.heap.total_bytes().saturating_sub(self.gc.threshold)
    }

    /// Current tuning.
    #[must_use]
    pub const fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Sets the pause percentage and returns the previous one.
    pub fn set_pause(&mut self, pause: usize) -> usize {
        std::mem::replace(&mut self.config.pause, pause)
    }

    /// Sets the step multiplier and returns the previous one.
    pub fn set_step_multiplier(&mut self, step_multiplier: usize) -> usize {
        std::mem::replace(&mut self.config.step_multiplier, step_multiplier)
    }

    /// Switches between incremental steps and full collections at the
    /// allocation checkpoint.
    pub fn set_incremental(&mut self, incremental: bool) {
        self.config.incremental = incremental;
    }

    /// Allocation checkpoint: collects if the heap has crossed the threshold.
    ///
    /// # Errors
    ///
    /// Propagates errors raised by finalizers.
    pub fn check_gc(&mut self) -> Result<(), GcError> {
        if self.heap.total_bytes() < self.gc.threshold {
            return Ok(());
        }
        if self.config.incremental {
            self.step()
        } else {
            self.full_collect()
        }
    }

    /// Performs one incremental step.
    ///
    /// The work budget is proportional to the allocation debt (bytes past the
    /// threshold, at least [`GC_STEP_SIZE`]) times the step multiplier. The
    /// step stops early when the cycle completes. While the debt is at least
    /// [`GC_STEP_SIZE`], the threshold stays at the current total so the
    /// next allocation checkpoint steps again. Calls made while a finalizer
    /// is running do nothing.
    ///
    /// # Errors
    ///
    /// Propagates errors raised by finalizers; the collector stays in a
    /// consistent phase and can be stepped again.
    pub fn step(&mut self) -> Result<(), GcError> {
        if self.gc.in_finalizer {
            return Ok(());
        }
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_gc_collection(
            CollectionType::Incremental.as_str(),
            self.gc_id(),
        );
        let started = Instant::now();
        self.gc.driver = CollectionType::Incremental;

        let excess = self.excess();
        self.gc.debt = self.gc.debt.saturating_add(excess);
        let quantum = excess.max(GC_STEP_SIZE);
        let budget = match self.config.step_multiplier {
            0 => usize::MAX,
            mul => (quantum / 100).saturating_mul(mul),
        };
        log_step(budget, self.gc.phase, quantum);
        let result = self.run_budget(budget);

        if self.gc.phase == GcPhase::Pause {
            self.set_threshold();
        } else if self.gc.debt < GC_STEP_SIZE {
            self.gc.threshold = self.heap.total_bytes() + GC_STEP_SIZE;
        } else {
            self.gc.debt -= GC_STEP_SIZE;
            self.gc.threshold = self.heap.total_bytes();
        }
        self.end_step(started);
        result
    }

    /// Accounts for one collector entry point and publishes the cycle if it
    /// just completed.
    fn end_step(&mut self, started: Instant) {
        self.metrics.count_step();
        self.metrics.end_step(started);
        if self.gc.phase == GcPhase::Pause && self.metrics.cycle_active() {
            self.metrics.finish_cycle(self.gc.threshold);
        }
    }

    fn run_budget(&mut self, mut budget: usize) -> Result<(), GcError> {
        loop {
            let work = self.single_step()?;
            if self.gc.phase == GcPhase::Pause {
                return Ok(());
            }
            if work >= budget {
                return Ok(());
            }
            budget -= work;
        }
    }

    /// Runs a complete cycle synchronously.
    ///
    /// Marks from an interrupted propagation are discarded; an interrupted
    /// sweep is finished first. Pending finalizers are all called before this
    /// returns. A call made while a finalizer is running does nothing.
    ///
    /// Emergency collections started by a refused allocation stop short of
    /// the finalizers and leave them queued for the next step or collection.
    ///
    /// # Errors
    ///
    /// Propagates errors raised by finalizers.
    pub fn full_collect(&mut self) -> Result<(), GcError> {
        self.full_collect_as(CollectionType::Full)
    }

    pub(crate) fn full_collect_as(&mut self, kind: CollectionType) -> Result<(), GcError> {
        if self.gc.in_finalizer {
            return Ok(());
        }
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_gc_collection(kind.as_str(), self.gc_id());
        let started = Instant::now();
        self.gc.driver = kind;
        self.metrics.drive(kind);

        let result = self.run_full_cycle();

        self.set_threshold();
        self.end_step(started);
        result
    }

    fn run_full_cycle(&mut self) -> Result<(), GcError> {
        if self.gc.phase <= GcPhase::Propagate {
            // Sweep everything back to white without flipping.
            self.gc.reset_sweep();
            self.gc.clear_lists();
            self.transition_to(GcPhase::SweepStrings);
        }
        while self.gc.phase != GcPhase::Finalize {
            self.single_step()?;
        }
        self.mark_root();
        while self.gc.phase != GcPhase::Pause {
            self.single_step()?;
        }
        Ok(())
    }

    /// Advances the cycle by one unit and returns the work it cost.
    pub(crate) fn single_step(&mut self) -> Result<usize, GcError> {
        let phase = self.gc.phase;
        self.metrics.begin_phase();
        let result = self.advance();
        self.metrics.end_phase(phase);
        result
    }

    fn advance(&mut self) -> Result<usize, GcError> {
        match self.gc.phase {
            GcPhase::Pause => {
                self.mark_root();
                Ok(0)
            }
            GcPhase::Propagate => match self.propagate_mark() {
                Some(work) => Ok(work),
                None => {
                    self.atomic();
                    Ok(0)
                }
            },
            GcPhase::SweepStrings => {
                self.sweep_string_bucket();
                Ok(GC_SWEEP_COST)
            }
            GcPhase::Sweep => {
                if !self.sweep_objects(GC_SWEEP_MAX) {
                    self.check_sizes();
                    self.transition_to(GcPhase::Finalize);
                }
                Ok(GC_SWEEP_MAX * GC_SWEEP_COST)
            }
            GcPhase::Finalize => {
                if self.gc.tmudata.is_empty() || self.gc.driver == CollectionType::Emergency {
                    self.transition_to(GcPhase::Pause);
                    Ok(0)
                } else {
                    self.gc.estimate = self.gc.estimate.saturating_sub(GC_FINALIZE_COST);
                    self.call_next_finalizer()?;
                    Ok(GC_FINALIZE_COST)
                }
            }
        }
    }

    pub(crate) fn transition_to(&mut self, to: GcPhase) {
        let from = self.gc.phase;
        debug_assert!(
            from.can_transition_to(to),
            "invalid collector transition {from:?} -> {to:?}"
        );
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_phase(to);
        log_phase_transition(from, to, self.heap.total_bytes());
        self.gc.phase = to;
    }

    fn pause_threshold(&self) -> usize {
        (self.gc.estimate / 100).saturating_mul(self.config.pause)
    }

    pub(crate) fn set_threshold(&mut self) {
        self.gc.debt = 0;
        self.gc.threshold = self.pause_threshold();
    }

    #[cfg(feature = "tracing")]
    fn gc_id(&self) -> crate::tracing::GcId {
        crate::tracing::GcId(self.metrics.totals().collections as u64 + 1)
    }
}
