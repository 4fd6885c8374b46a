//! Built-in metrics sink backed by atomic counters.
//!
//! Good enough for tests and for embedders that only want a snapshot to dump
//! into their own exporter. Anything fancier implements
//! [`MetricsSink`](crate::hooks::MetricsSink) directly.

use crate::hooks::MetricsSink;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpTimings {
    pub count: u64,
    pub total_micros: u64,
}

impl OpTimings {
    /// Mean duration of the recorded calls.
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(self.total_micros / self.count)
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub migrations_ok: u64,
    pub migrations_failed: u64,
    pub rebalances_ok: u64,
    pub rebalances_failed: u64,
    pub evicted_keys: u64,
    pub timings: HashMap<String, OpTimings>,
}

impl MetricsSnapshot {
    /// Fraction of reads that hit, 0.0 when nothing was read.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Atomic-counter [`MetricsSink`].
#[derive(Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    migrations_ok: AtomicU64,
    migrations_failed: AtomicU64,
    rebalances_ok: AtomicU64,
    rebalances_failed: AtomicU64,
    evicted_keys: AtomicU64,
    timings: Mutex<HashMap<String, OpTimings>>,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            migrations_ok: self.migrations_ok.load(Ordering::Relaxed),
            migrations_failed: self.migrations_failed.load(Ordering::Relaxed),
            rebalances_ok: self.rebalances_ok.load(Ordering::Relaxed),
            rebalances_failed: self.rebalances_failed.load(Ordering::Relaxed),
            evicted_keys: self.evicted_keys.load(Ordering::Relaxed),
            timings: self.timings.lock().clone(),
        }
    }
}

impl MetricsSink for CacheMetrics {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_duration(&self, op: &str, duration: Duration) {
        let mut timings = self.timings.lock();
        let entry = timings.entry(op.to_string()).or_default();
        entry.count += 1;
        entry.total_micros += duration.as_micros() as u64;
    }

    fn record_migration(&self, success: bool) {
        if success {
            self.migrations_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.migrations_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_rebalance(&self, success: bool) {
        if success {
            self.rebalances_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rebalances_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_eviction(&self, keys: u64) {
        self.evicted_keys.fetch_add(keys, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::ops;

    #[test]
    fn test_hit_rate() {
        let m = CacheMetrics::new();
        assert_eq!(m.snapshot().hit_rate(), 0.0);
        m.record_hit();
        m.record_hit();
        m.record_hit();
        m.record_miss();
        assert_eq!(m.snapshot().hit_rate(), 0.75);
    }

    #[test]
    fn test_timings_accumulate() {
        let m = CacheMetrics::new();
        m.record_duration(ops::GET, Duration::from_micros(100));
        m.record_duration(ops::GET, Duration::from_micros(300));

        let snap = m.snapshot();
        let get = &snap.timings[ops::GET];
        assert_eq!(get.count, 2);
        assert_eq!(get.mean(), Duration::from_micros(200));
    }

    #[test]
    fn test_outcome_counters() {
        let m = CacheMetrics::new();
        m.record_migration(true);
        m.record_migration(false);
        m.record_rebalance(true);
        m.record_eviction(7);

        let snap = m.snapshot();
        assert_eq!(snap.migrations_ok, 1);
        assert_eq!(snap.migrations_failed, 1);
        assert_eq!(snap.rebalances_ok, 1);
        assert_eq!(snap.rebalances_failed, 0);
        assert_eq!(snap.evicted_keys, 7);
    }
}
