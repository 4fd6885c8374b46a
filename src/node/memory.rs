//! Embedded backend implementations, one per node kind.
//!
//! These are in-process stores with the capability surface of their wire
//! counterparts: the redis-style node supports key enumeration and TTL
//! inspection, the memcached-style node does not. Wire connectors for real
//! deployments implement [`Backend`] in the embedding process.

use super::{Backend, BackendStats, KeyInfo};
use crate::error::{Error, Result};
use crate::types::now_ms;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at_ms: Option<u64>,
    last_access_ms: u64,
    access_count: u64,
}

impl Entry {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| now >= at)
    }
}

/// Storage shared by both embedded node kinds.
#[derive(Debug, Default)]
struct MemoryStore {
    id: String,
    entries: DashMap<String, Entry>,
    /// Simulates an unreachable node; toggled by tests and by recovery
    /// exercises. All operations fail with a connection error while set.
    offline: AtomicBool,
    /// Artificial per-operation delay in milliseconds, for timeout tests.
    latency_ms: AtomicU64,
}

impl MemoryStore {
    fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    async fn check_reachable(&self) -> Result<()> {
        let delay = self.latency_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.offline.load(Ordering::Relaxed) {
            return Err(Error::Connection {
                node: self.id.clone(),
                reason: "node offline".into(),
            });
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = now_ms();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.last_access_ms = now;
                entry.access_count += 1;
                Some(entry.value.clone())
            }
            Some(entry) => {
                drop(entry);
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        let now = now_ms();
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at_ms: ttl.map(|t| now + t.as_millis() as u64),
                last_access_ms: now,
                access_count: 0,
            },
        );
    }

    fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn live_keys(&self) -> Vec<String> {
        let now = now_ms();
        self.entries
            .iter()
            .filter(|e| !e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect()
    }

    fn key_info(&self, key: &str) -> Option<KeyInfo> {
        let now = now_ms();
        self.entries.get(key).and_then(|entry| {
            if entry.is_expired(now) {
                return None;
            }
            Some(KeyInfo {
                size_bytes: (key.len() + entry.value.len()) as u64,
                last_access_ms: entry.last_access_ms,
                access_count: entry.access_count,
                expires_at_ms: entry.expires_at_ms,
            })
        })
    }

    fn stats(&self) -> BackendStats {
        let now = now_ms();
        let mut stats = BackendStats::default();
        for e in self.entries.iter() {
            if !e.value().is_expired(now) {
                stats.items += 1;
                stats.size_bytes += (e.key().len() + e.value().value.len()) as u64;
            }
        }
        stats
    }
}

/// Redis-style embedded node: full key enumeration and TTL inspection.
pub struct RedisNode {
    store: Arc<MemoryStore>,
}

impl RedisNode {
    /// Create a new node with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            store: Arc::new(MemoryStore::new(id)),
        }
    }

    /// Simulate the node going down or coming back.
    pub fn set_offline(&self, offline: bool) {
        self.store.offline.store(offline, Ordering::Relaxed);
    }

    /// Inject a fixed per-operation delay.
    pub fn set_latency(&self, latency: Duration) {
        self.store
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }
}

#[async_trait]
impl Backend for RedisNode {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.store.check_reachable().await?;
        Ok(self.store.get(key))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.store.check_reachable().await?;
        self.store.set(key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.store.check_reachable().await?;
        Ok(self.store.delete(key))
    }

    async fn clear(&self) -> Result<()> {
        self.store.check_reachable().await?;
        self.store.entries.clear();
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.store.check_reachable().await
    }

    async fn scan_keys(&self) -> Result<Vec<String>> {
        self.store.check_reachable().await?;
        Ok(self.store.live_keys())
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.store.check_reachable().await?;
        let now = now_ms();
        Ok(self
            .store
            .entries
            .get(key)
            .and_then(|e| e.expires_at_ms)
            .filter(|&at| at > now)
            .map(|at| Duration::from_millis(at - now)))
    }

    async fn key_info(&self, key: &str) -> Result<Option<KeyInfo>> {
        self.store.check_reachable().await?;
        Ok(self.store.key_info(key))
    }

    async fn stats(&self) -> Result<BackendStats> {
        self.store.check_reachable().await?;
        Ok(self.store.stats())
    }
}

/// Memcached-style embedded node.
///
/// Matches the wire protocol's limits: no key enumeration and no TTL
/// inspection. Keys stored here are invisible to migration and to TTL-based
/// eviction ordering.
pub struct MemcachedNode {
    store: Arc<MemoryStore>,
}

impl MemcachedNode {
    /// Create a new node with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            store: Arc::new(MemoryStore::new(id)),
        }
    }

    /// Simulate the node going down or coming back.
    pub fn set_offline(&self, offline: bool) {
        self.store.offline.store(offline, Ordering::Relaxed);
    }
}

#[async_trait]
impl Backend for MemcachedNode {
    fn kind(&self) -> &'static str {
        "memcached"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.store.check_reachable().await?;
        Ok(self.store.get(key))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.store.check_reachable().await?;
        self.store.set(key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.store.check_reachable().await?;
        Ok(self.store.delete(key))
    }

    async fn clear(&self) -> Result<()> {
        self.store.check_reachable().await?;
        self.store.entries.clear();
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.store.check_reachable().await
    }

    async fn scan_keys(&self) -> Result<Vec<String>> {
        self.store.check_reachable().await?;
        Err(Error::Unsupported {
            kind: "memcached",
            operation: "scan_keys",
        })
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.store.check_reachable().await?;
        let _ = key;
        Ok(None)
    }

    async fn key_info(&self, key: &str) -> Result<Option<KeyInfo>> {
        self.store.check_reachable().await?;
        Ok(self.store.key_info(key))
    }

    async fn stats(&self) -> Result<BackendStats> {
        self.store.check_reachable().await?;
        Ok(self.store.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let node = RedisNode::new("redis-1");
        node.set("k", b"v".to_vec(), None).await.unwrap();
        assert_eq!(node.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(node.delete("k").await.unwrap());
        assert_eq!(node.get("k").await.unwrap(), None);
        assert!(!node.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let node = RedisNode::new("redis-1");
        node.set("k", b"v".to_vec(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(node.get("k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(node.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_offline_node_errors() {
        let node = RedisNode::new("redis-1");
        node.set_offline(true);
        assert!(matches!(
            node.get("k").await,
            Err(Error::Connection { .. })
        ));
        node.set_offline(false);
        assert!(node.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_memcached_cannot_scan() {
        let node = MemcachedNode::new("memcached-1");
        node.set("k", b"v".to_vec(), None).await.unwrap();
        assert!(matches!(
            node.scan_keys().await,
            Err(Error::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_key_info_tracks_access() {
        let node = RedisNode::new("redis-1");
        node.set("k", b"v".to_vec(), None).await.unwrap();
        node.get("k").await.unwrap();
        node.get("k").await.unwrap();
        let info = node.key_info("k").await.unwrap().unwrap();
        assert_eq!(info.access_count, 2);
        assert_eq!(info.size_bytes, 2);
    }

    #[tokio::test]
    async fn test_stats_counts_live_entries() {
        let node = RedisNode::new("redis-1");
        node.set("a", b"123".to_vec(), None).await.unwrap();
        node.set("b", b"4567".to_vec(), None).await.unwrap();
        let stats = node.stats().await.unwrap();
        assert_eq!(stats.items, 2);
        assert_eq!(stats.size_bytes, 1 + 3 + 1 + 4);
    }
}
