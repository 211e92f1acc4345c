//! Cache statistics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Fresh reads
    pub hits: AtomicU64,
    /// Reads that found nothing fresh
    pub misses: AtomicU64,
    /// Stale values served after a failed refresh
    pub stale_served: AtomicU64,
    /// Successful upstream refreshes
    pub refreshes: AtomicU64,
    /// Failed upstream refreshes
    pub refresh_failures: AtomicU64,
    /// Reads answered while another caller held the refresh
    pub coalesced: AtomicU64,
}

impl CacheStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current cache hit count
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get current cache miss count
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Calculate hit rate as a fraction (0.0-1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self, size: usize) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            size,
            hit_rate: self.hit_rate(),
        }
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStatsSnapshot {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Stale values served after a failed refresh
    pub stale_served: u64,
    /// Successful refreshes
    pub refreshes: u64,
    /// Failed refreshes
    pub refresh_failures: u64,
    /// Reads that piggybacked on another caller's refresh
    pub coalesced: u64,
    /// Current number of entries
    pub size: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats::default();
        assert!(stats.hit_rate().abs() < f64::EPSILON);

        CacheStats::incr(&stats.hits);
        CacheStats::incr(&stats.hits);
        CacheStats::incr(&stats.misses);

        let snapshot = stats.snapshot(1);
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.size, 1);
        assert!((snapshot.hit_rate - 0.666).abs() < 0.01);
    }
}
