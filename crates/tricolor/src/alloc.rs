//! The pluggable allocator hook.
//!
//! Every byte the runtime charges for objects, stacks, table segments and the
//! string table's bucket array flows through one [`Allocator::reallocate`]
//! call with the old and new size of the block (`old_size == 0` allocates,
//! `new_size == 0` frees). The memory itself comes from Rust's global
//! allocator; the hook decides whether a request may proceed and lets a host
//! instrument or cap usage.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Admission and accounting hook for heap growth.
pub trait Allocator {
    /// Called for every allocation, resize and free.
    ///
    /// Returning `false` refuses the request. Requests that do not grow the
    /// block (`new_size <= old_size`) must always be accepted.
    fn reallocate(&mut self, old_size: usize, new_size: usize) -> bool;
}

/// Accepts every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    fn reallocate(&mut self, _old_size: usize, _new_size: usize) -> bool {
        true
    }
}

/// Refuses growth once the running total would pass a byte limit.
#[derive(Debug, Clone)]
pub struct LimitAllocator {
    limit: usize,
    in_use: usize,
}

impl LimitAllocator {
    /// Refuses growth past `limit` bytes.
    #[must_use]
    pub const fn new(limit: usize) -> Self {
        Self { limit, in_use: 0 }
    }

    /// Bytes charged so far.
    #[must_use]
    pub const fn in_use(&self) -> usize {
        self.in_use
    }
}

impl Allocator for LimitAllocator {
    fn reallocate(&mut self, old_size: usize, new_size: usize) -> bool {
        let next = self.in_use - old_size.min(self.in_use) + new_size;
        if new_size > old_size && next > self.limit {
            return false;
        }
        self.in_use = next;
        true
    }
}

/// Counters kept by a [`CountingAllocator`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocStats {
    /// Bytes currently charged.
    pub live_bytes: usize,
    /// Highest value `live_bytes` has reached.
    pub peak_bytes: usize,
    /// Requests with `old_size == 0`.
    pub allocations: usize,
    /// Requests with `new_size == 0`.
    pub frees: usize,
    /// Requests refused because of the optional limit.
    pub refusals: usize,
}

/// An allocator that records every request.
///
/// The counters sit behind a shared handle so a host can keep observing them
/// after the allocator has been moved into a runtime.
#[derive(Clone, Default)]
pub struct CountingAllocator {
    stats: Arc<Mutex<AllocStats>>,
    limit: Option<usize>,
}

impl CountingAllocator {
    /// An allocator that never refuses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A counting allocator that also refuses growth past `limit` bytes.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            stats: Arc::default(),
            limit: Some(limit),
        }
    }

    /// Handle to the shared counters.
    #[must_use]
    pub fn stats_handle(&self) -> Arc<Mutex<AllocStats>> {
        Arc::clone(&self.stats)
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> AllocStats {
        *self.stats.lock()
    }

    /// Changes the limit; `None` removes it.
    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }
}

impl fmt::Debug for CountingAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountingAllocator")
            .field("stats", &self.stats())
            .field("limit", &self.limit)
            .finish()
    }
}

impl Allocator for CountingAllocator {
    fn reallocate(&mut self, old_size: usize, new_size: usize) -> bool {
        let mut stats = self.stats.lock();
        let next = stats.live_bytes - old_size.min(stats.live_bytes) + new_size;
        if new_size > old_size && self.limit.is_some_and(|limit| next > limit) {
            stats.refusals += 1;
            return false;
        }
        if old_size == 0 && new_size > 0 {
            stats.allocations += 1;
        }
        if new_size == 0 && old_size > 0 {
            stats.frees += 1;
        }
        stats.live_bytes = next;
        stats.peak_bytes = stats.peak_bytes.max(next);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_refuses_growth_only() {
        let mut a = LimitAllocator::new(100);
        assert!(a.reallocate(0, 80));
        assert!(!a.reallocate(0, 40));
        assert!(a.reallocate(80, 60));
        assert!(a.reallocate(0, 40));
        assert_eq!(a.in_use(), 100);
        assert!(a.reallocate(40, 0));
        assert_eq!(a.in_use(), 60);
    }

    #[test]
    fn test_counting_allocator_shared_stats() {
        let a = CountingAllocator::new();
        let handle = a.stats_handle();
        let mut boxed: Box<dyn Allocator> = Box::new(a);
        assert!(boxed.reallocate(0, 64));
        assert!(boxed.reallocate(64, 128));
        assert!(boxed.reallocate(128, 0));
        let stats = *handle.lock();
        assert_eq!(stats.live_bytes, 0);
        assert_eq!(stats.peak_bytes, 128);
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.frees, 1);
    }

    #[test]
    fn test_counting_allocator_limit() {
        let mut a = CountingAllocator::with_limit(10);
        assert!(!a.reallocate(0, 11));
        assert_eq!(a.stats().refusals, 1);
        a.set_limit(None);
        assert!(a.reallocate(0, 11));
    }
}
