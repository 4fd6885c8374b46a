//! Backup support.
//!
//! The coordinator exposes `get_keys`/`get`/`set` as the primitives a backup
//! subsystem polls and replays. The manager here subscribes to `Set` and
//! `Delete` events so it always knows which keys changed since the last
//! snapshot, takes full snapshots through the public read path (so values
//! come back decrypted and decompressed), and can replay a snapshot into a
//! cluster.

use crate::coordinator::CacheCoordinator;
use crate::error::Result;
use crate::events::{CacheEvent, EventBus, EventType};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// A materialized point-in-time copy of the cache.
pub type BackupSnapshot = HashMap<String, Bytes>;

/// Tracks mutations and produces/replays snapshots.
pub struct BackupManager {
    changed: Arc<Mutex<BTreeSet<String>>>,
}

impl BackupManager {
    /// Subscribe to mutation events on `bus` and start tracking changes.
    pub fn attach(bus: &EventBus) -> Self {
        let changed = Arc::new(Mutex::new(BTreeSet::new()));
        for event_type in [EventType::Set, EventType::Delete] {
            let changed = changed.clone();
            bus.subscribe(event_type, move |event| {
                if let Some(key) = &event.key {
                    changed.lock().insert(key.clone());
                }
                Ok(())
            });
        }
        Self { changed }
    }

    /// Keys mutated since the last snapshot, sorted.
    pub fn pending(&self) -> Vec<String> {
        self.changed.lock().iter().cloned().collect()
    }

    /// Whether any key changed since the last snapshot.
    pub fn has_changes(&self) -> bool {
        !self.changed.lock().is_empty()
    }

    /// Take a full snapshot through the coordinator's read path.
    ///
    /// Keys that fail to read are logged and left out rather than failing
    /// the whole snapshot. Clears the change set and publishes a `Backup`
    /// event.
    pub async fn snapshot(&self, coordinator: &CacheCoordinator) -> BackupSnapshot {
        let mut snapshot = BackupSnapshot::new();
        for key in coordinator.get_keys().await {
            match coordinator.get(&key, None).await {
                Ok(Some(value)) => {
                    snapshot.insert(key, value);
                }
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "backup read failed, key skipped"),
            }
        }

        self.changed.lock().clear();
        info!(keys = snapshot.len(), "backup snapshot taken");
        coordinator.bus().publish(
            CacheEvent::new(EventType::Backup).with_metadata("keys", snapshot.len().to_string()),
        );
        snapshot
    }

    /// Replay a snapshot through the coordinator's write path.
    ///
    /// Returns the number of keys restored; individual failures are logged
    /// and skipped. Publishes a `Restore` event.
    pub async fn restore(
        &self,
        coordinator: &CacheCoordinator,
        snapshot: &BackupSnapshot,
    ) -> Result<usize> {
        let mut restored = 0usize;
        for (key, value) in snapshot {
            match coordinator.set(key, value.clone(), None, None, None).await {
                Ok(()) => restored += 1,
                Err(e) => warn!(key = %key, error = %e, "restore write failed, key skipped"),
            }
        }

        info!(restored, total = snapshot.len(), "restore finished");
        coordinator.bus().publish(
            CacheEvent::new(EventType::Restore).with_metadata("keys", restored.to_string()),
        );
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoordinatorConfig, NodeConfig, NodeKind};
    use std::time::Duration;

    async fn coordinator() -> CacheCoordinator {
        let nodes = vec![
            NodeConfig::new("redis-1", NodeKind::Redis, "127.0.0.1", 6379),
            NodeConfig::new("redis-2", NodeKind::Redis, "127.0.0.1", 6380),
        ];
        CacheCoordinator::new(
            CoordinatorConfig::new(nodes)
                .with_replication_factor(2)
                .with_retries(1, Duration::from_millis(5)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_tracks_changes_from_events() {
        let c = coordinator().await;
        let backup = BackupManager::attach(c.bus());

        c.set("k1", Bytes::from_static(b"v1"), None, None, None)
            .await
            .unwrap();
        c.delete("k1", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(backup.has_changes());
        assert_eq!(backup.pending(), vec!["k1".to_string()]);
        c.close().await;
    }

    #[tokio::test]
    async fn test_snapshot_and_restore_roundtrip() {
        let c = coordinator().await;
        let backup = BackupManager::attach(c.bus());

        for i in 0..10 {
            c.set(&format!("key-{i}"), Bytes::from(vec![i as u8]), None, None, None)
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = backup.snapshot(&c).await;
        assert_eq!(snapshot.len(), 10);
        assert!(!backup.has_changes());

        c.clear().await;
        assert_eq!(c.get("key-3", None).await.unwrap(), None);

        let restored = backup.restore(&c, &snapshot).await.unwrap();
        assert_eq!(restored, 10);
        assert_eq!(
            c.get("key-3", None).await.unwrap(),
            Some(Bytes::from(vec![3]))
        );
        c.close().await;
    }
}
