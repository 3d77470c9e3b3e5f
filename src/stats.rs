//! Allocation counters
//!
//! Relaxed atomic counters kept per block allocator. Cheap enough to stay
//! on in release builds; read as a consistent-enough snapshot for
//! diagnostics overlays.

use core::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for one allocator instance.
#[derive(Debug, Default)]
pub struct AllocationStats {
    allocations: AtomicU64,
    frees: AtomicU64,
    regions_created: AtomicU64,
    bytes_reserved: AtomicU64,
    grow_hits: AtomicU64,
    grow_misses: AtomicU64,
}

impl AllocationStats {
    pub(crate) fn record_allocation(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_free(&self) {
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_region(&self, bytes: u64) {
        self.regions_created.fetch_add(1, Ordering::Relaxed);
        self.bytes_reserved.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_grow(&self, succeeded: bool) {
        if succeeded {
            self.grow_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.grow_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Read all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            regions_created: self.regions_created.load(Ordering::Relaxed),
            bytes_reserved: self.bytes_reserved.load(Ordering::Relaxed),
            grow_hits: self.grow_hits.load(Ordering::Relaxed),
            grow_misses: self.grow_misses.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`AllocationStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Allocations served (all strategies that hit the block allocator).
    pub allocations: u64,
    /// Allocations freed.
    pub frees: u64,
    /// Coarse regions reserved from the provider.
    pub regions_created: u64,
    /// Cumulative bytes reserved from the provider.
    pub bytes_reserved: u64,
    /// In-place growths that succeeded.
    pub grow_hits: u64,
    /// In-place growths that fell back to a new allocation.
    pub grow_misses: u64,
}

impl StatsSnapshot {
    /// Allocations currently live.
    #[must_use]
    pub fn live(&self) -> u64 {
        self.allocations.saturating_sub(self.frees)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_recording() {
        let stats = AllocationStats::default();
        stats.record_allocation();
        stats.record_allocation();
        stats.record_free();
        stats.record_region(64);
        stats.record_grow(true);
        stats.record_grow(false);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.allocations, 2);
        assert_eq!(snapshot.frees, 1);
        assert_eq!(snapshot.live(), 1);
        assert_eq!(snapshot.regions_created, 1);
        assert_eq!(snapshot.bytes_reserved, 64);
        assert_eq!(snapshot.grow_hits, 1);
        assert_eq!(snapshot.grow_misses, 1);
    }
}
