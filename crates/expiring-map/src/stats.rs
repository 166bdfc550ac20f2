//! Statistics tracking for expiring maps.
//!
//! Lock-free counters shared by the store, the scheduler, and the
//! notification dispatcher. Listener and scheduler faults never reach
//! callers, so these counters (together with the `tracing` output) are how
//! they are observed.
//!
//! # Usage
//!
//! ```
//! use expiring_map::stats::MapStats;
//!
//! let stats = MapStats::new();
//! stats.record_hit();
//! stats.record_miss();
//!
//! let snapshot = stats.snapshot();
//! assert_eq!(snapshot.hit_rate(), 0.5);
//! ```

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one map instance.
#[derive(Debug, Default)]
pub struct MapStats {
    /// Lookups that found a live entry.
    pub hits: AtomicU64,
    /// Lookups that found nothing (or a due entry).
    pub misses: AtomicU64,
    /// Values produced by an entry loader.
    pub loads: AtomicU64,
    /// Entries evicted because their TTL elapsed.
    pub expirations: AtomicU64,
    /// Entries re-scheduled after their deadline was extended.
    pub reschedules: AtomicU64,
    /// Completed sweep cycles.
    pub sweeps: AtomicU64,
    /// Stale heap entries dropped by compaction.
    pub compacted: AtomicU64,
    /// Sync listener invocations that completed.
    pub sync_notifications: AtomicU64,
    /// Async listener invocations that completed.
    pub async_notifications: AtomicU64,
    /// Listener invocations that panicked.
    pub listener_failures: AtomicU64,
    /// Sweeps that panicked and were recovered.
    pub scheduler_faults: AtomicU64,
}

impl MapStats {
    /// Create new empty statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a lookup hit.
    #[inline]
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a lookup miss.
    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a loader-produced value.
    #[inline]
    pub fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an expiration.
    #[inline]
    pub fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a lazy re-schedule.
    #[inline]
    pub fn record_reschedule(&self) {
        self.reschedules.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed sweep.
    #[inline]
    pub fn record_sweep(&self) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
    }

    /// Record heap entries dropped by compaction.
    pub fn record_compaction(&self, removed: usize) {
        self.compacted.fetch_add(removed as u64, Ordering::Relaxed);
    }

    /// Record a successful sync listener call.
    #[inline]
    pub fn record_sync_notification(&self) {
        self.sync_notifications.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful async listener call.
    #[inline]
    pub fn record_async_notification(&self) {
        self.async_notifications.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a listener panic.
    #[inline]
    pub fn record_listener_failure(&self) {
        self.listener_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a recovered scheduler fault.
    #[inline]
    pub fn record_scheduler_fault(&self) {
        self.scheduler_faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of all counters.
    pub fn snapshot(&self) -> MapStatsSnapshot {
        MapStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            reschedules: self.reschedules.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
            compacted: self.compacted.load(Ordering::Relaxed),
            sync_notifications: self.sync_notifications.load(Ordering::Relaxed),
            async_notifications: self.async_notifications.load(Ordering::Relaxed),
            listener_failures: self.listener_failures.load(Ordering::Relaxed),
            scheduler_faults: self.scheduler_faults.load(Ordering::Relaxed),
        }
    }
}

/// A serializable snapshot of map statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MapStatsSnapshot {
    /// Lookups that found a live entry.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Values produced by an entry loader.
    pub loads: u64,
    /// Entries evicted because their TTL elapsed.
    pub expirations: u64,
    /// Lazy re-schedules of extended deadlines.
    pub reschedules: u64,
    /// Completed sweep cycles.
    pub sweeps: u64,
    /// Stale heap entries dropped by compaction.
    pub compacted: u64,
    /// Completed sync listener calls.
    pub sync_notifications: u64,
    /// Completed async listener calls.
    pub async_notifications: u64,
    /// Listener calls that panicked.
    pub listener_failures: u64,
    /// Recovered scheduler faults.
    pub scheduler_faults: u64,
}

impl MapStatsSnapshot {
    /// Fraction of lookups that hit (0.0 when there were none).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Total listener calls, successful or not.
    pub fn total_notifications(&self) -> u64 {
        self.sync_notifications + self.async_notifications + self.listener_failures
    }
}
