//! Test support.
//!
//! A small harness around a coordinator running entirely on embedded
//! in-memory nodes, with direct handles kept for fault injection. Timings
//! are shortened so breaker and retry behavior can be exercised quickly.

use crate::config::{BreakerConfig, CoordinatorConfig, EventBusConfig, NodeConfig, NodeKind};
use crate::coordinator::CacheCoordinator;
use crate::node::{Backend, RedisNode};
use crate::types::NodeId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// An in-process cluster for tests.
pub struct TestCluster {
    pub coordinator: Arc<CacheCoordinator>,
    handles: HashMap<NodeId, Arc<RedisNode>>,
}

impl TestCluster {
    /// Cluster of `nodes` in-memory redis-kind nodes named `redis-1..n`.
    pub fn new(nodes: usize, replication_factor: usize) -> Self {
        let configs: Vec<NodeConfig> = (1..=nodes)
            .map(|i| {
                NodeConfig::new(
                    format!("redis-{i}"),
                    NodeKind::Redis,
                    "127.0.0.1",
                    6378 + i as u16,
                )
            })
            .collect();

        let mut handles = HashMap::new();
        let backends = configs
            .iter()
            .map(|config| {
                let node = Arc::new(RedisNode::new(config.id.clone()));
                handles.insert(config.id.clone(), node.clone());
                (config.clone(), node as Arc<dyn Backend>)
            })
            .collect();

        let config = CoordinatorConfig::new(configs)
            .with_replication_factor(replication_factor)
            .with_retries(2, Duration::from_millis(5))
            .with_breaker(BreakerConfig {
                failure_threshold: 2,
                reset_timeout: Duration::from_millis(50),
                half_open_timeout: Duration::from_millis(50),
                operation_timeout: Duration::from_millis(200),
            })
            .with_event_bus(EventBusConfig {
                queue_capacity: 256,
                workers_per_lane: 1,
                max_retries: 2,
                retry_delay: Duration::from_millis(10),
            });

        let coordinator = CacheCoordinator::builder(config)
            .backends(backends)
            .build()
            .expect("test cluster configuration is valid");

        Self {
            coordinator: Arc::new(coordinator),
            handles,
        }
    }

    /// Direct handle to one node, for fault injection.
    pub fn node(&self, id: &str) -> Arc<RedisNode> {
        self.handles
            .get(id)
            .cloned()
            .unwrap_or_else(|| panic!("no test node named {id}"))
    }

    /// Take a node offline or bring it back.
    pub fn set_offline(&self, id: &str, offline: bool) {
        self.node(id).set_offline(offline);
    }

    pub async fn close(&self) {
        self.coordinator.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_cluster_round_trips() {
        let cluster = TestCluster::new(3, 2);
        cluster
            .coordinator
            .set("k", Bytes::from_static(b"v"), None, None, None)
            .await
            .unwrap();
        assert_eq!(
            cluster.coordinator.get("k", None).await.unwrap(),
            Some(Bytes::from_static(b"v"))
        );
        cluster.close().await;
    }
}
