//! Errors surfaced to the embedding host.
//!
//! Only conditions a host can recover from through its protected-call
//! boundary are represented here. Broken invariants (tag mismatches, dangling
//! handles, dead objects reached through a live slot) are defects elsewhere
//! in the system and panic instead.

use thiserror::Error;

/// An error raised by the memory manager or propagated through it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GcError {
    /// The allocator refused a request even after an emergency full collection.
    #[error("not enough memory")]
    OutOfMemory,
    /// A `__gc` metamethod raised an error while it was being run.
    #[error("error in __gc metamethod ({0})")]
    Finalizer(String),
    /// A runtime error raised by the host and carried through a collector entry point.
    #[error("{0}")]
    Runtime(String),
}

impl GcError {
    /// Returns `true` for memory exhaustion.
    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory)
    }
}
