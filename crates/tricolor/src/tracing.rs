//! Collector tracing support.
//!
//! With the `tracing` feature enabled, every collector entry point runs
//! inside a `gc_collect` span carrying the kind of collection and the id of the
//! cycle it advances, and phase changes open a `gc_phase` span. Without the
//! feature this module reduces to the [`GcId`] type.

#[cfg(feature = "tracing")]
pub mod internal {
    use tracing::{span, Level};

    use crate::gc::GcPhase;

    /// Identifier of a collection cycle within one runtime.
    ///
    /// Ids start at 1 and increase by one per completed cycle, so every event
    /// emitted while a cycle is in progress carries the same id.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Span for one call into the collector.
    pub fn trace_gc_collection(collection_type: &str, gc_id: GcId) -> span::EnteredSpan {
        span!(
            Level::DEBUG,
            "gc_collect",
            collection_type = collection_type,
            gc_id = gc_id.0
        )
        .entered()
    }

    /// Span covering the work done on entering `phase`.
    pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Identifier of a collection cycle within one runtime.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);
}

pub use internal::GcId;
