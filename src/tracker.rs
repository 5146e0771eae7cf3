//! Usage tracking boundary.
//!
//! The façade can report every allocate/deallocate to an external tracker
//! for leak detection and usage statistics. Reporting is observability
//! only: a tracker must never change an allocation outcome, and calls
//! flagged [`AllocFlags::NOTRACK_ALLOC`], [`AllocFlags::INTERNAL_ALLOC`],
//! or [`AllocFlags::DEBUG_ALLOC`] are filtered out before the tracker is
//! invoked.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::flags::AllocFlags;
use crate::utils::atomic_max;

/// Receiver for allocation lifecycle events.
///
/// Implementations must be thread-safe; events arrive concurrently from
/// every thread using the façade.
pub trait AllocTracker: Send + Sync {
    /// Called after a successful allocation.
    fn record_alloc(&self, addr: usize, size: usize, flags: AllocFlags);

    /// Called before a deallocation is forwarded to the engine.
    fn record_free(&self, addr: usize, size: usize, flags: AllocFlags);

    /// Number of allocations recorded but not yet freed.
    fn live_allocations(&self) -> usize;

    /// Bytes allocated but not yet freed.
    fn live_bytes(&self) -> usize;
}

/// Point-in-time view of a [`StatsTracker`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerSnapshot {
    /// Bytes currently allocated
    pub live_bytes: usize,
    /// Peak bytes allocated
    pub peak_bytes: usize,
    /// Allocations currently live
    pub live_allocations: usize,
    /// Total allocations ever recorded
    pub total_allocations: usize,
    /// Total deallocations ever recorded
    pub total_deallocations: usize,
}

/// Atomic-counter tracker suitable for leak checks at shutdown.
///
/// Tracks counts and byte totals only; it does not retain per-allocation
/// records, so it adds a few atomic ops per event and no memory.
#[derive(Default)]
pub struct StatsTracker {
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    live_allocations: AtomicUsize,
    total_allocations: AtomicUsize,
    total_deallocations: AtomicUsize,
}

impl StatsTracker {
    /// Creates an empty tracker.
    pub const fn new() -> Self {
        Self {
            live_bytes: AtomicUsize::new(0),
            peak_bytes: AtomicUsize::new(0),
            live_allocations: AtomicUsize::new(0),
            total_allocations: AtomicUsize::new(0),
            total_deallocations: AtomicUsize::new(0),
        }
    }

    /// Peak bytes ever live at once.
    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes.load(Ordering::Relaxed)
    }

    /// Whether more allocations were recorded than deallocations.
    pub fn has_leaks(&self) -> bool {
        self.live_allocations() > 0
    }

    /// Snapshot of all counters.
    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
            live_allocations: self.live_allocations.load(Ordering::Relaxed),
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
            total_deallocations: self.total_deallocations.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.live_bytes.store(0, Ordering::Relaxed);
        self.peak_bytes.store(0, Ordering::Relaxed);
        self.live_allocations.store(0, Ordering::Relaxed);
        self.total_allocations.store(0, Ordering::Relaxed);
        self.total_deallocations.store(0, Ordering::Relaxed);
    }
}

impl AllocTracker for StatsTracker {
    fn record_alloc(&self, _addr: usize, size: usize, _flags: AllocFlags) {
        let live = self.live_bytes.fetch_add(size, Ordering::Relaxed) + size;
        atomic_max(&self.peak_bytes, live);
        self.live_allocations.fetch_add(1, Ordering::Relaxed);
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
    }

    fn record_free(&self, _addr: usize, size: usize, _flags: AllocFlags) {
        // Saturating: a mismatched free is a caller bug, but the tracker
        // must stay observability-only and never panic the process.
        let mut live = self.live_bytes.load(Ordering::Relaxed);
        loop {
            let next = live.saturating_sub(size);
            match self.live_bytes.compare_exchange_weak(
                live,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => live = x,
            }
        }
        let mut count = self.live_allocations.load(Ordering::Relaxed);
        loop {
            let next = count.saturating_sub(1);
            match self.live_allocations.compare_exchange_weak(
                count,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => count = x,
            }
        }
        self.total_deallocations.fetch_add(1, Ordering::Relaxed);
    }

    fn live_allocations(&self) -> usize {
        self.live_allocations.load(Ordering::Relaxed)
    }

    fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for StatsTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsTracker")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
