//! Node recovery supervisor.
//!
//! Consumes `NodeDown` events and drives the node back into service:
//! repeated reconnect probes with a fixed delay, a `RecoveryComplete` event
//! and an optional rebalance once the node answers again, or a
//! `RecoveryFailed` event once the attempt budget is spent. Key-level
//! divergence after an outage is handled separately through
//! [`CacheCoordinator::repair_key`].

use crate::coordinator::CacheCoordinator;
use crate::events::{CacheEvent, EventType};
use crate::types::NodeId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{info, warn};

/// Recovery tuning.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Reconnect probes per `NodeDown` event.
    pub attempts: u32,
    /// Delay between probes.
    pub delay: Duration,
    /// Whether to rebalance after a node comes back.
    pub rebalance_after: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(5),
            rebalance_after: false,
        }
    }
}

/// Background task reacting to `NodeDown` events.
pub struct RecoverySupervisor {
    shutdown_tx: watch::Sender<bool>,
    handle: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RecoverySupervisor {
    /// Subscribe to the coordinator's bus and start the recovery worker.
    pub fn attach(coordinator: Arc<CacheCoordinator>, config: RecoveryConfig) -> Self {
        let (node_tx, mut node_rx) = mpsc::unbounded_channel::<NodeId>();
        coordinator.bus().subscribe(EventType::NodeDown, move |event| {
            if let Some(node) = &event.node_id {
                let _ = node_tx.send(node.clone());
            }
            Ok(())
        });

        let (shutdown_tx, mut shutdown) = watch::channel(false);
        let handle = tokio::spawn(async move {
            loop {
                let node = tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                    node = node_rx.recv() => match node {
                        Some(node) => node,
                        None => break,
                    },
                };

                if coordinator.registry().is_healthy(&node) {
                    // Recovered between the event and now.
                    continue;
                }
                recover_node(&coordinator, &node, &config).await;
            }
        });

        Self {
            shutdown_tx,
            handle: AsyncMutex::new(Some(handle)),
        }
    }

    /// Stop the worker and wait for it to exit.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

async fn recover_node(coordinator: &CacheCoordinator, node: &NodeId, config: &RecoveryConfig) {
    info!(node_id = %node, "recovery started");
    coordinator
        .bus()
        .publish(CacheEvent::new(EventType::RecoveryStart).with_node(node.clone()));

    for attempt in 1..=config.attempts.max(1) {
        match coordinator.reconnect(node).await {
            Ok(()) => {
                info!(node_id = %node, attempt, "node recovered");
                coordinator
                    .bus()
                    .publish(CacheEvent::new(EventType::RecoveryComplete).with_node(node.clone()));
                if config.rebalance_after {
                    if let Err(e) = coordinator.rebalance().await {
                        warn!(node_id = %node, error = %e, "post-recovery rebalance failed");
                    }
                }
                return;
            }
            Err(e) => {
                warn!(node_id = %node, attempt, error = %e, "reconnect probe failed");
                if attempt < config.attempts {
                    tokio::time::sleep(config.delay).await;
                }
            }
        }
    }

    coordinator
        .bus()
        .publish(CacheEvent::new(EventType::RecoveryFailed).with_node(node.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoordinatorConfig, NodeConfig, NodeKind};
    use crate::node::{Backend, RedisNode};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cluster() -> (Arc<CacheCoordinator>, HashMap<NodeId, Arc<RedisNode>>) {
        let configs = vec![
            NodeConfig::new("redis-1", NodeKind::Redis, "127.0.0.1", 6379),
            NodeConfig::new("redis-2", NodeKind::Redis, "127.0.0.1", 6380),
        ];
        let mut handles = HashMap::new();
        let backends = configs
            .iter()
            .map(|c| {
                let node = Arc::new(RedisNode::new(c.id.clone()));
                handles.insert(c.id.clone(), node.clone());
                (c.clone(), node as Arc<dyn Backend>)
            })
            .collect();
        let coordinator = Arc::new(
            CacheCoordinator::builder(
                CoordinatorConfig::new(configs)
                    .with_replication_factor(2)
                    .with_retries(1, Duration::from_millis(5)),
            )
            .backends(backends)
            .build()
            .unwrap(),
        );
        (coordinator, handles)
    }

    fn fast_recovery(attempts: u32) -> RecoveryConfig {
        RecoveryConfig {
            attempts,
            delay: Duration::from_millis(10),
            rebalance_after: false,
        }
    }

    #[tokio::test]
    async fn test_node_down_triggers_reconnect() {
        let (c, handles) = cluster();
        let recovered = Arc::new(AtomicUsize::new(0));
        let counter = recovered.clone();
        c.bus().subscribe(EventType::RecoveryComplete, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let supervisor = RecoverySupervisor::attach(c.clone(), fast_recovery(20));

        // Take the node down long enough for a health check to notice, then
        // bring it back so a reconnect probe can succeed.
        handles["redis-1"].set_offline(true);
        c.check_health().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        handles["redis-1"].set_offline(false);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(c.registry().is_healthy("redis-1"));
        assert_eq!(recovered.load(Ordering::SeqCst), 1);

        supervisor.close().await;
        c.close().await;
    }

    #[tokio::test]
    async fn test_exhausted_attempts_publish_failure() {
        let (c, handles) = cluster();
        let failed = Arc::new(AtomicUsize::new(0));
        let counter = failed.clone();
        c.bus().subscribe(EventType::RecoveryFailed, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let supervisor = RecoverySupervisor::attach(c.clone(), fast_recovery(2));

        handles["redis-2"].set_offline(true);
        c.check_health().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!c.registry().is_healthy("redis-2"));
        assert_eq!(failed.load(Ordering::SeqCst), 1);

        supervisor.close().await;
        c.close().await;
    }
}
