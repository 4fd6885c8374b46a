//! Budget-driven eviction cleaner.
//!
//! A periodic task sums usage across all healthy nodes and, when the size or
//! item budget is exceeded, evicts candidates until usage drops to 70% of the
//! budget. Candidates are whole keys: evicting one deletes every replica copy,
//! so an evicted key is gone from the logical cache, not just thinned out. All
//! copies count against the budget. Candidate order follows the configured
//! strategy; nodes that cannot enumerate keys are skipped. Eviction is best
//! effort: a copy that fails to delete is logged and the pass moves on.

use crate::config::{CleanerConfig, EvictionStrategy};
use crate::error::Error;
use crate::events::{CacheEvent, EventBus, EventType};
use crate::hooks::MetricsSink;
use crate::node::{KeyInfo, NodeRegistry};
use crate::priority::PriorityTracker;
use crate::types::{now_ms, NodeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Fraction of the budget usage is trimmed down to once exceeded.
const TRIM_TARGET: f64 = 0.7;

/// Counters for one cleaner instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanerStats {
    /// Completed passes.
    pub runs: u64,
    /// Keys evicted across all passes.
    pub evicted_keys: u64,
    /// Bytes reclaimed across all passes.
    pub evicted_bytes: u64,
    /// End of the last pass, epoch milliseconds. Zero before the first pass.
    pub last_run_ms: u64,
}

/// One evictable key with every replica copy found during the scan.
struct Candidate {
    key: String,
    /// Nodes holding a copy, with that copy's stored size.
    copies: Vec<(NodeId, u64)>,
    /// Most recent access across copies.
    last_access_ms: u64,
    /// Highest access count across copies.
    access_count: u64,
    /// Soonest expiry across copies.
    expires_at_ms: Option<u64>,
}

impl Candidate {
    fn merge(&mut self, node: NodeId, info: KeyInfo) {
        self.copies.push((node, info.size_bytes));
        self.last_access_ms = self.last_access_ms.max(info.last_access_ms);
        self.access_count = self.access_count.max(info.access_count);
        self.expires_at_ms = match (self.expires_at_ms, info.expires_at_ms) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
}

/// Periodic eviction driver.
pub struct EvictionCleaner {
    config: CleanerConfig,
    registry: Arc<NodeRegistry>,
    tracker: Arc<PriorityTracker>,
    bus: Arc<EventBus>,
    metrics: Arc<dyn MetricsSink>,
    runs: AtomicU64,
    evicted_keys: AtomicU64,
    evicted_bytes: AtomicU64,
    last_run_ms: AtomicU64,
}

impl EvictionCleaner {
    pub fn new(
        config: CleanerConfig,
        registry: Arc<NodeRegistry>,
        tracker: Arc<PriorityTracker>,
        bus: Arc<EventBus>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            config,
            registry,
            tracker,
            bus,
            metrics,
            runs: AtomicU64::new(0),
            evicted_keys: AtomicU64::new(0),
            evicted_bytes: AtomicU64::new(0),
            last_run_ms: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> CleanerStats {
        CleanerStats {
            runs: self.runs.load(Ordering::Relaxed),
            evicted_keys: self.evicted_keys.load(Ordering::Relaxed),
            evicted_bytes: self.evicted_bytes.load(Ordering::Relaxed),
            last_run_ms: self.last_run_ms.load(Ordering::Relaxed),
        }
    }

    /// Run the cleaner until `shutdown` flips to true.
    pub fn spawn(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let interval = self.config.interval;
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
                        self.run_once().await;
                    }
                }
            }
        })
    }

    /// One eviction pass. Returns the number of keys evicted.
    pub async fn run_once(&self) -> u64 {
        let (size, items) = self.total_usage().await;
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.last_run_ms.store(now_ms(), Ordering::Relaxed);

        if size <= self.config.max_size_bytes && items <= self.config.max_items {
            debug!(size, items, "usage within budget");
            return 0;
        }

        info!(
            size,
            items,
            max_size = self.config.max_size_bytes,
            max_items = self.config.max_items,
            "budget exceeded, starting eviction"
        );
        self.bus.publish(
            CacheEvent::new(EventType::ThresholdExceeded)
                .with_metadata("size_bytes", size.to_string())
                .with_metadata("items", items.to_string()),
        );

        let mut candidates = self.collect_candidates().await;
        self.order_candidates(&mut candidates);

        let size_target = (self.config.max_size_bytes as f64 * TRIM_TARGET) as u64;
        let items_target = (self.config.max_items as f64 * TRIM_TARGET) as u64;
        let mut size_left = size;
        let mut items_left = items;
        let mut evicted = 0u64;
        let mut reclaimed = 0u64;

        for candidate in candidates {
            if size_left <= size_target && items_left <= items_target {
                break;
            }
            // Delete every copy so the key leaves the logical cache; a
            // surviving replica would keep it readable through quorum reads.
            let mut removed_copies = 0u64;
            for (node, copy_size) in &candidate.copies {
                let backend = match self.registry.backend(node) {
                    Ok(b) => b,
                    Err(_) => continue,
                };
                match backend.delete(&candidate.key).await {
                    Ok(true) => {
                        size_left = size_left.saturating_sub(*copy_size);
                        items_left = items_left.saturating_sub(1);
                        reclaimed += copy_size;
                        removed_copies += 1;
                    }
                    Ok(false) => {
                        // Expired or removed since the scan.
                        items_left = items_left.saturating_sub(1);
                    }
                    Err(e) => {
                        warn!(
                            node_id = %node,
                            key = %candidate.key,
                            error = %e,
                            "eviction delete failed, continuing"
                        );
                    }
                }
            }
            if removed_copies > 0 {
                evicted += 1;
                self.tracker.remove(&candidate.key);
                self.bus.publish(
                    CacheEvent::new(EventType::Cleanup)
                        .with_key(candidate.key)
                        .with_metadata("copies", removed_copies.to_string()),
                );
            }
        }

        self.evicted_keys.fetch_add(evicted, Ordering::Relaxed);
        self.evicted_bytes.fetch_add(reclaimed, Ordering::Relaxed);
        self.metrics.record_eviction(evicted);
        info!(evicted, reclaimed, "eviction pass finished");
        evicted
    }

    async fn total_usage(&self) -> (u64, u64) {
        let mut size = 0u64;
        let mut items = 0u64;
        for id in self.registry.healthy_ids() {
            let Ok(backend) = self.registry.backend(&id) else {
                continue;
            };
            match backend.stats().await {
                Ok(stats) => {
                    size += stats.size_bytes;
                    items += stats.items;
                }
                Err(e) => warn!(node_id = %id, error = %e, "stats unavailable"),
            }
        }
        (size, items)
    }

    async fn collect_candidates(&self) -> Vec<Candidate> {
        let mut by_key: HashMap<String, Candidate> = HashMap::new();
        for id in self.registry.healthy_ids() {
            let Ok(backend) = self.registry.backend(&id) else {
                continue;
            };
            let keys = match backend.scan_keys().await {
                Ok(keys) => keys,
                Err(Error::Unsupported { kind, .. }) => {
                    debug!(node_id = %id, kind = %kind, "node cannot enumerate keys, skipped");
                    continue;
                }
                Err(e) => {
                    warn!(node_id = %id, error = %e, "key scan failed, node skipped");
                    continue;
                }
            };
            for key in keys {
                if let Ok(Some(info)) = backend.key_info(&key).await {
                    by_key
                        .entry(key.clone())
                        .or_insert_with(|| Candidate {
                            key,
                            copies: Vec::new(),
                            last_access_ms: 0,
                            access_count: 0,
                            expires_at_ms: None,
                        })
                        .merge(id.clone(), info);
                }
            }
        }
        by_key.into_values().collect()
    }

    fn order_candidates(&self, candidates: &mut [Candidate]) {
        match self.config.strategy {
            EvictionStrategy::Lru => {
                candidates.sort_by_key(|c| c.last_access_ms);
            }
            EvictionStrategy::Lfu => {
                candidates.sort_by_key(|c| (c.access_count, c.last_access_ms));
            }
            EvictionStrategy::Ttl => {
                // Soonest expiry first; keys without a TTL are kept longest.
                candidates.sort_by_key(|c| c.expires_at_ms.unwrap_or(u64::MAX));
            }
            EvictionStrategy::Priority => {
                candidates.sort_by_key(|c| (self.tracker.get(&c.key), c.last_access_ms));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EventBusConfig, NodeConfig, NodeKind, PriorityConfig};
    use crate::hooks::NoMetrics;
    use crate::types::Priority;
    use std::time::Duration;

    fn cleaner_over(
        configs: &[NodeConfig],
        strategy: EvictionStrategy,
        max_size_bytes: u64,
        max_items: u64,
    ) -> (Arc<EvictionCleaner>, Arc<NodeRegistry>, Arc<PriorityTracker>) {
        let registry = Arc::new(NodeRegistry::in_memory(configs));
        let tracker = Arc::new(PriorityTracker::new(PriorityConfig::default()));
        let bus = Arc::new(EventBus::new(EventBusConfig {
            queue_capacity: 64,
            workers_per_lane: 1,
            max_retries: 1,
            retry_delay: Duration::from_millis(10),
        }));
        let cleaner = Arc::new(EvictionCleaner::new(
            CleanerConfig {
                interval: Duration::from_secs(300),
                strategy,
                max_size_bytes,
                max_items,
            },
            registry.clone(),
            tracker.clone(),
            bus,
            Arc::new(NoMetrics),
        ));
        (cleaner, registry, tracker)
    }

    fn redis_only() -> Vec<NodeConfig> {
        vec![NodeConfig::new("redis-1", NodeKind::Redis, "127.0.0.1", 6379)]
    }

    #[tokio::test]
    async fn test_within_budget_evicts_nothing() {
        let (cleaner, registry, _) =
            cleaner_over(&redis_only(), EvictionStrategy::Lru, 1 << 20, 100);
        let backend = registry.backend("redis-1").unwrap();
        backend.set("k", vec![1, 2, 3], None).await.unwrap();

        assert_eq!(cleaner.run_once().await, 0);
        assert!(backend.get("k").await.unwrap().is_some());
        assert_eq!(cleaner.stats().runs, 1);
    }

    #[tokio::test]
    async fn test_lru_evicts_coldest_first() {
        let (cleaner, registry, _) = cleaner_over(&redis_only(), EvictionStrategy::Lru, 1 << 20, 3);
        let backend = registry.backend("redis-1").unwrap();
        backend.set("cold", vec![0; 10], None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        backend.set("warm", vec![0; 10], None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        backend.set("hot1", vec![0; 10], None).await.unwrap();
        backend.set("hot2", vec![0; 10], None).await.unwrap();

        let evicted = cleaner.run_once().await;
        assert!(evicted >= 1);
        assert!(backend.get("cold").await.unwrap().is_none());

        let stats = backend.stats().await.unwrap();
        assert!(stats.items <= 2); // 70% of 3
    }

    #[tokio::test]
    async fn test_priority_strategy_protects_hot_keys() {
        let (cleaner, registry, tracker) =
            cleaner_over(&redis_only(), EvictionStrategy::Priority, 1 << 20, 2);
        let backend = registry.backend("redis-1").unwrap();
        backend.set("important", vec![0; 10], None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        backend.set("ordinary-1", vec![0; 10], None).await.unwrap();
        backend.set("ordinary-2", vec![0; 10], None).await.unwrap();
        tracker.set("important", Priority::High, None);

        cleaner.run_once().await;
        assert!(backend.get("important").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ttl_strategy_evicts_soonest_expiry() {
        let (cleaner, registry, _) = cleaner_over(&redis_only(), EvictionStrategy::Ttl, 1 << 20, 2);
        let backend = registry.backend("redis-1").unwrap();
        backend
            .set("soonest", vec![0; 10], Some(Duration::from_secs(5)))
            .await
            .unwrap();
        backend
            .set("middle", vec![0; 10], Some(Duration::from_secs(60)))
            .await
            .unwrap();
        backend.set("durable", vec![0; 10], None).await.unwrap();

        cleaner.run_once().await;
        assert!(backend.get("soonest").await.unwrap().is_none());
        assert!(backend.get("durable").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_eviction_removes_every_replica_copy() {
        let configs = vec![
            NodeConfig::new("redis-1", NodeKind::Redis, "127.0.0.1", 6379),
            NodeConfig::new("redis-2", NodeKind::Redis, "127.0.0.1", 6380),
        ];
        let (cleaner, registry, _) = cleaner_over(&configs, EvictionStrategy::Lru, 1 << 20, 3);
        let node_1 = registry.backend("redis-1").unwrap();
        let node_2 = registry.backend("redis-2").unwrap();

        // Two replicated keys, four copies total; "stale" is the coldest.
        node_1.set("stale", vec![0; 10], None).await.unwrap();
        node_2.set("stale", vec![0; 10], None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        node_1.set("fresh", vec![0; 10], None).await.unwrap();
        node_2.set("fresh", vec![0; 10], None).await.unwrap();

        assert_eq!(cleaner.run_once().await, 1);

        // Both copies of the evicted key are gone; no replica keeps it alive.
        assert!(node_1.get("stale").await.unwrap().is_none());
        assert!(node_2.get("stale").await.unwrap().is_none());
        assert!(node_1.get("fresh").await.unwrap().is_some());
        assert!(node_2.get("fresh").await.unwrap().is_some());
        assert_eq!(cleaner.stats().evicted_keys, 1);
    }

    #[tokio::test]
    async fn test_unscannable_node_skipped() {
        let configs = vec![
            NodeConfig::new("redis-1", NodeKind::Redis, "127.0.0.1", 6379),
            NodeConfig::new("memcached-1", NodeKind::Memcached, "127.0.0.1", 11211),
        ];
        let (cleaner, registry, _) = cleaner_over(&configs, EvictionStrategy::Lru, 1 << 20, 1);
        let redis = registry.backend("redis-1").unwrap();
        let memcached = registry.backend("memcached-1").unwrap();
        redis.set("a", vec![0; 10], None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        redis.set("b", vec![0; 10], None).await.unwrap();
        memcached.set("c", vec![0; 10], None).await.unwrap();

        // Memcached keys are invisible to the scan; the pass still trims redis.
        let evicted = cleaner.run_once().await;
        assert!(evicted >= 1);
        assert!(memcached.get("c").await.unwrap().is_some());
    }
}
