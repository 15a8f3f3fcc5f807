//! Collector metrics and statistics.
//!
//! All counters are per runtime. A cycle's numbers accumulate while it runs,
//! across however many incremental steps it takes, and are published as a
//! [`GcMetrics`] snapshot when the collector returns to the pause phase.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::gc::GcPhase;

/// Statistics of one completed collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcMetrics {
    /// Total time spent inside collector steps for this cycle.
    pub duration: Duration,
    /// Longest single step of the cycle.
    pub max_step_pause: Duration,
    /// Bytes returned to the allocator by sweeping.
    pub bytes_reclaimed: usize,
    /// Objects (strings excluded) freed by sweeping.
    pub objects_reclaimed: usize,
    /// Strings freed by the string sweep.
    pub strings_reclaimed: usize,
    /// Objects blackened by propagation.
    pub objects_marked: usize,
    /// Incremental steps that contributed to the cycle.
    pub steps_executed: usize,
    /// Finalizers invoked during the cycle.
    pub finalizers_run: usize,
    /// Live-byte estimate computed by the atomic step.
    pub estimate: usize,
    /// Threshold set for the next cycle.
    pub threshold: usize,
    /// How the cycle was driven.
    pub collection_type: CollectionType,
    /// Cycles completed by this runtime, this one included.
    pub total_collections: usize,
    /// Time spent in pause and propagate steps, atomic step included.
    pub mark_duration: Duration,
    /// Time spent sweeping strings and objects.
    pub sweep_duration: Duration,
    /// Time spent in finalize steps.
    pub finalize_duration: Duration,
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMetrics {
    /// A snapshot with every field zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::ZERO,
            max_step_pause: Duration::ZERO,
            bytes_reclaimed: 0,
            objects_reclaimed: 0,
            strings_reclaimed: 0,
            objects_marked: 0,
            steps_executed: 0,
            finalizers_run: 0,
            estimate: 0,
            threshold: 0,
            collection_type: CollectionType::None,
            total_collections: 0,
            mark_duration: Duration::ZERO,
            sweep_duration: Duration::ZERO,
            finalize_duration: Duration::ZERO,
        }
    }
}

/// How a collection cycle was driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionType {
    /// No collection has run yet.
    #[default]
    None = 0,
    /// Advanced by bounded steps interleaved with the mutator.
    Incremental = 1,
    /// Run to completion by an explicit full collection.
    Full = 2,
    /// Run to completion after the allocator refused a request.
    Emergency = 3,
}

impl CollectionType {
    /// Name used in tracing fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Incremental => "incremental",
            Self::Full => "full",
            Self::Emergency => "emergency",
        }
    }
}

/// Accumulates time per group of collector phases.
///
/// ```
/// use tricolor::metrics::PhaseTimer;
/// use tricolor::GcPhase;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... one propagate step ...
/// timer.end(GcPhase::Propagate);
/// assert_eq!(timer.sweep, std::time::Duration::ZERO);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseTimer {
    /// Pause and propagate steps.
    pub mark: Duration,
    /// String and object sweep steps.
    pub sweep: Duration,
    /// Finalize steps.
    pub finalize: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// A timer with nothing charged.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mark: Duration::ZERO,
            sweep: Duration::ZERO,
            finalize: Duration::ZERO,
            current_start: None,
        }
    }

    /// Starts timing one step.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// Charges the time since `start` to the group `phase` belongs to.
    pub fn end(&mut self, phase: GcPhase) {
        if let Some(start) = self.current_start.take() {
            let elapsed = start.elapsed();
            match phase {
                GcPhase::Pause | GcPhase::Propagate => self.mark += elapsed,
                GcPhase::SweepStrings | GcPhase::Sweep => self.sweep += elapsed,
                GcPhase::Finalize => self.finalize += elapsed,
            }
        }
    }
}

/// Cumulative counters over the runtime's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeMetrics {
    /// Completed cycles of any kind.
    pub collections: usize,
    /// Cycles completed by incremental steps.
    pub incremental_collections: usize,
    /// Cycles completed by an explicit full collection.
    pub full_collections: usize,
    /// Cycles forced by a refused allocation.
    pub emergency_collections: usize,
    /// Calls into the collector, steps and full collections alike.
    pub steps: usize,
    /// Bytes returned to the allocator by sweeping.
    pub bytes_reclaimed: usize,
    /// Objects (strings excluded) freed by sweeping.
    pub objects_reclaimed: usize,
    /// Strings freed by the string sweep.
    pub strings_reclaimed: usize,
    /// Finalizers invoked.
    pub finalizers_run: usize,
    /// Sum of all step durations.
    pub pause_time: Duration,
}

/// Ring buffer size for the cycle history.
const HISTORY_SIZE: usize = 64;

/// The most recent cycle snapshots, oldest first.
#[derive(Debug, Clone, Default)]
pub struct GcHistory {
    buffer: VecDeque<GcMetrics>,
    recorded: usize,
}

impl GcHistory {
    /// An empty history.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: VecDeque::with_capacity(HISTORY_SIZE),
            recorded: 0,
        }
    }

    fn push(&mut self, metrics: GcMetrics) {
        if self.buffer.len() == HISTORY_SIZE {
            self.buffer.pop_front();
        }
        self.buffer.push_back(metrics);
        self.recorded += 1;
    }

    /// Number of snapshots ever recorded; may exceed the buffer size.
    #[must_use]
    pub const fn total_recorded(&self) -> usize {
        self.recorded
    }

    /// Up to `n` most recent snapshots, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<GcMetrics> {
        let skip = self.buffer.len().saturating_sub(n);
        self.buffer.iter().skip(skip).copied().collect()
    }

    /// Mean cycle duration over the last `n` cycles.
    #[must_use]
    pub fn average_pause_time(&self, n: usize) -> Duration {
        let recent = self.recent(n);
        if recent.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = recent.iter().map(|m| m.duration).sum();
        total / u32::try_from(recent.len()).unwrap_or(u32::MAX)
    }

    /// Longest single step over the last `n` cycles.
    #[must_use]
    pub fn max_pause_time(&self, n: usize) -> Duration {
        self.recent(n)
            .iter()
            .map(|m| m.max_step_pause)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

/// Everything the runtime records about its collector.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    last: GcMetrics,
    totals: RuntimeMetrics,
    history: GcHistory,
    cycle: GcMetrics,
    timer: PhaseTimer,
}

impl Metrics {
    /// Empty counters and history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the last completed cycle.
    #[must_use]
    pub const fn last(&self) -> GcMetrics {
        self.last
    }

    /// Counters since the runtime was created.
    #[must_use]
    pub const fn totals(&self) -> RuntimeMetrics {
        self.totals
    }

    /// Snapshots of recent cycles.
    #[must_use]
    pub const fn history(&self) -> &GcHistory {
        &self.history
    }

    /// Numbers of the cycle in progress.
    #[must_use]
    pub const fn current_cycle(&self) -> GcMetrics {
        self.cycle
    }

    /// Whether a cycle has started and not yet been published.
    #[must_use]
    pub fn cycle_active(&self) -> bool {
        self.cycle.collection_type != CollectionType::None
    }

    pub(crate) fn begin_cycle(&mut self, kind: CollectionType) {
        self.cycle = GcMetrics {
            collection_type: kind,
            ..GcMetrics::new()
        };
    }

    /// Upgrades the cycle in progress when a full collection takes it over.
    pub(crate) fn drive(&mut self, kind: CollectionType) {
        if kind != CollectionType::Incremental {
            self.cycle.collection_type = kind;
        }
    }

    pub(crate) fn end_step(&mut self, started: Instant) {
        let elapsed = started.elapsed();
        self.cycle.duration += elapsed;
        self.cycle.max_step_pause = self.cycle.max_step_pause.max(elapsed);
        self.totals.pause_time += elapsed;
    }

    pub(crate) fn begin_phase(&mut self) {
        self.timer.start();
    }

    pub(crate) fn end_phase(&mut self, phase: GcPhase) {
        self.timer.end(phase);
    }

    pub(crate) fn count_step(&mut self) {
        self.cycle.steps_executed += 1;
        self.totals.steps += 1;
    }

    pub(crate) fn record_marked(&mut self, n: usize) {
        self.cycle.objects_marked += n;
    }

    pub(crate) fn record_freed(&mut self, bytes: usize, is_string: bool) {
        self.cycle.bytes_reclaimed += bytes;
        if is_string {
            self.cycle.strings_reclaimed += 1;
        } else {
            self.cycle.objects_reclaimed += 1;
        }
    }

    pub(crate) fn record_finalizer(&mut self) {
        self.cycle.finalizers_run += 1;
        self.totals.finalizers_run += 1;
    }

    pub(crate) fn set_estimate(&mut self, estimate: usize) {
        self.cycle.estimate = estimate;
    }

    /// Publishes the cycle in progress.
    pub(crate) fn finish_cycle(&mut self, threshold: usize) {
        let mut m = self.cycle;
        m.threshold = threshold;
        m.mark_duration = self.timer.mark;
        m.sweep_duration = self.timer.sweep;
        m.finalize_duration = self.timer.finalize;
        self.timer = PhaseTimer::new();

        let t = &mut self.totals;
        t.collections += 1;
        t.bytes_reclaimed += m.bytes_reclaimed;
        t.objects_reclaimed += m.objects_reclaimed;
        t.strings_reclaimed += m.strings_reclaimed;
        match m.collection_type {
            CollectionType::Incremental => t.incremental_collections += 1,
            CollectionType::Full => t.full_collections += 1,
            CollectionType::Emergency => t.emergency_collections += 1,
            CollectionType::None => {}
        }
        m.total_collections = t.collections;

        self.last = m;
        self.history.push(m);
        self.cycle = GcMetrics::new();
    }
}
