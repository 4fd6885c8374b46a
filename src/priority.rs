//! Priority tracking for cached keys.
//!
//! Keys carry an externally assigned priority used by priority eviction. The
//! high and medium tiers are bounded: when a tier overflows, its oldest entry
//! is demoted one tier so that recently prioritized keys keep their standing.
//! Assignments may expire; a periodic sweep drops the stale ones.

use crate::config::PriorityConfig;
use crate::types::{now_ms, Priority};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct Entry {
    priority: Priority,
    expires_at_ms: Option<u64>,
    /// Assignment order within the tracker, oldest first.
    seq: u64,
}

#[derive(Default)]
struct TrackerInner {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

/// Bounded-tier priority map.
pub struct PriorityTracker {
    config: PriorityConfig,
    inner: Mutex<TrackerInner>,
}

impl PriorityTracker {
    pub fn new(config: PriorityConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(TrackerInner::default()),
        }
    }

    /// Assign a priority to `key`, optionally expiring after `ttl`.
    ///
    /// Overflowing a bounded tier demotes that tier's oldest entry.
    pub fn set(&self, key: impl Into<String>, priority: Priority, ttl: Option<Duration>) {
        let key = key.into();
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            key,
            Entry {
                priority,
                expires_at_ms: ttl.map(|t| now_ms() + t.as_millis() as u64),
                seq,
            },
        );
        self.enforce_caps(&mut inner);
    }

    /// Priority of `key`. Untracked and expired keys read as low.
    pub fn get(&self, key: &str) -> Priority {
        let mut inner = self.inner.lock();
        match inner.entries.get(key) {
            Some(entry) => {
                if entry
                    .expires_at_ms
                    .is_some_and(|expires| expires <= now_ms())
                {
                    inner.entries.remove(key);
                    Priority::Low
                } else {
                    entry.priority
                }
            }
            None => Priority::Low,
        }
    }

    /// Drop the assignment for `key`.
    pub fn remove(&self, key: &str) {
        self.inner.lock().entries.remove(key);
    }

    /// Drop every assignment. Used by `clear()` on the coordinator.
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    /// Number of tracked assignments.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether no assignments are tracked.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Tracked assignments per tier, indexed low/medium/high.
    pub fn counts(&self) -> [usize; 3] {
        let inner = self.inner.lock();
        let mut counts = [0usize; 3];
        for entry in inner.entries.values() {
            counts[entry.priority as usize] += 1;
        }
        counts
    }

    /// Drop expired assignments. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = now_ms();
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, e| !e.expires_at_ms.is_some_and(|expires| expires <= now));
        let removed = before - inner.entries.len();
        if removed > 0 {
            debug!(removed, "expired priority assignments swept");
        }
        removed
    }

    /// Run the periodic sweep until `shutdown` flips to true.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                }
            }
        })
    }

    /// Demote the oldest entries of any tier above its cap.
    fn enforce_caps(&self, inner: &mut TrackerInner) {
        Self::demote_overflow(inner, Priority::High, Priority::Medium, self.config.max_high);
        Self::demote_overflow(inner, Priority::Medium, Priority::Low, self.config.max_medium);
    }

    fn demote_overflow(inner: &mut TrackerInner, from: Priority, to: Priority, cap: usize) {
        loop {
            let over = inner
                .entries
                .values()
                .filter(|e| e.priority == from)
                .count();
            if over <= cap {
                return;
            }
            let oldest = inner
                .entries
                .iter()
                .filter(|(_, e)| e.priority == from)
                .min_by_key(|(_, e)| e.seq)
                .map(|(k, _)| k.clone());
            if let Some(key) = oldest {
                if let Some(entry) = inner.entries.get_mut(&key) {
                    entry.priority = to;
                    debug!(key = %key, from = %from, to = %to, "priority demoted, tier full");
                }
            } else {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(max_high: usize, max_medium: usize) -> PriorityTracker {
        PriorityTracker::new(PriorityConfig {
            max_high,
            max_medium,
            sweep_interval: Duration::from_secs(300),
        })
    }

    #[test]
    fn test_untracked_key_is_low() {
        let t = tracker(10, 10);
        assert_eq!(t.get("missing"), Priority::Low);
    }

    #[test]
    fn test_set_and_get() {
        let t = tracker(10, 10);
        t.set("k1", Priority::High, None);
        t.set("k2", Priority::Medium, None);
        assert_eq!(t.get("k1"), Priority::High);
        assert_eq!(t.get("k2"), Priority::Medium);
        t.remove("k1");
        assert_eq!(t.get("k1"), Priority::Low);
    }

    #[test]
    fn test_high_tier_overflow_demotes_oldest() {
        let t = tracker(2, 10);
        t.set("oldest", Priority::High, None);
        t.set("middle", Priority::High, None);
        t.set("newest", Priority::High, None);

        assert_eq!(t.get("oldest"), Priority::Medium);
        assert_eq!(t.get("middle"), Priority::High);
        assert_eq!(t.get("newest"), Priority::High);
    }

    #[test]
    fn test_demotion_cascades_through_medium() {
        let t = tracker(1, 1);
        t.set("a", Priority::High, None);
        t.set("b", Priority::High, None);
        t.set("c", Priority::High, None);

        // "a" fell out of high, then out of medium when "b" followed it down.
        assert_eq!(t.get("c"), Priority::High);
        assert_eq!(t.get("b"), Priority::Medium);
        assert_eq!(t.get("a"), Priority::Low);
        assert_eq!(t.counts(), [1, 1, 1]);
    }

    #[test]
    fn test_expired_assignment_reads_low() {
        let t = tracker(10, 10);
        t.set("k", Priority::High, Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(t.get("k"), Priority::Low);
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn test_sweep_removes_expired() {
        let t = tracker(10, 10);
        t.set("stale", Priority::High, Some(Duration::from_millis(1)));
        t.set("fresh", Priority::High, Some(Duration::from_secs(60)));
        t.set("forever", Priority::Medium, None);
        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(t.sweep(), 1);
        assert_eq!(t.len(), 2);
        assert_eq!(t.get("fresh"), Priority::High);
    }

    #[tokio::test]
    async fn test_sweeper_task_shuts_down() {
        let t = Arc::new(PriorityTracker::new(PriorityConfig {
            max_high: 10,
            max_medium: 10,
            sweep_interval: Duration::from_millis(10),
        }));
        t.set("stale", Priority::High, Some(Duration::from_millis(1)));

        let (tx, rx) = watch::channel(false);
        let handle = t.clone().spawn_sweeper(rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(t.len(), 0);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
