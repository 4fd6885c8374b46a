//! Node registry: static descriptors plus live health state.
//!
//! The registry owns the backend handles; they are created at registration
//! and reused across calls. The node set only grows: nodes are never removed
//! at runtime, only marked unhealthy and drained by a rebalance.

use super::{Backend, MemcachedNode, RedisNode};
use crate::config::{NodeConfig, NodeKind};
use crate::error::{Error, Result};
use crate::types::NodeId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

struct NodeSlot {
    config: NodeConfig,
    backend: Arc<dyn Backend>,
    healthy: bool,
}

/// Registry of backend nodes with a live health flag per node.
pub struct NodeRegistry {
    slots: RwLock<HashMap<NodeId, NodeSlot>>,
    /// Node ids in registration order.
    order: RwLock<Vec<NodeId>>,
}

impl NodeRegistry {
    /// Build a registry from explicit backend handles.
    ///
    /// The embedding process supplies one handle per node config; this is the
    /// seam where wire connectors plug in.
    pub fn new(nodes: Vec<(NodeConfig, Arc<dyn Backend>)>) -> Self {
        let order = nodes.iter().map(|(c, _)| c.id.clone()).collect();
        let slots = nodes
            .into_iter()
            .map(|(config, backend)| {
                let id = config.id.clone();
                (
                    id,
                    NodeSlot {
                        config,
                        backend,
                        healthy: true,
                    },
                )
            })
            .collect();
        Self {
            slots: RwLock::new(slots),
            order: RwLock::new(order),
        }
    }

    /// Register one more node at runtime.
    ///
    /// The new node takes no traffic until the partitioner commits it via a
    /// rebalance.
    pub fn register(&self, config: NodeConfig, backend: Arc<dyn Backend>) -> Result<()> {
        let id = config.id.clone();
        let mut slots = self.slots.write();
        if slots.contains_key(&id) {
            return Err(Error::Config(format!("node {id} is already registered")));
        }
        slots.insert(
            id.clone(),
            NodeSlot {
                config,
                backend,
                healthy: true,
            },
        );
        self.order.write().push(id.clone());
        info!(node_id = %id, "node registered");
        Ok(())
    }

    /// Build a registry of embedded in-process nodes, one per config record,
    /// choosing the implementation by the configured kind.
    pub fn in_memory(configs: &[NodeConfig]) -> Self {
        let nodes = configs
            .iter()
            .map(|config| {
                let backend: Arc<dyn Backend> = match config.kind {
                    NodeKind::Redis => Arc::new(RedisNode::new(config.id.clone())),
                    NodeKind::Memcached => Arc::new(MemcachedNode::new(config.id.clone())),
                };
                (config.clone(), backend)
            })
            .collect();
        Self::new(nodes)
    }

    /// Node ids in registration order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.order.read().clone()
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.order.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.order.read().is_empty()
    }

    /// Backend handle for a node.
    pub fn backend(&self, id: &str) -> Result<Arc<dyn Backend>> {
        self.slots
            .read()
            .get(id)
            .map(|s| s.backend.clone())
            .ok_or_else(|| Error::NodeNotFound(id.to_string()))
    }

    /// Static configuration of a node.
    pub fn config(&self, id: &str) -> Result<NodeConfig> {
        self.slots
            .read()
            .get(id)
            .map(|s| s.config.clone())
            .ok_or_else(|| Error::NodeNotFound(id.to_string()))
    }

    /// Current health flag of a node. Unknown ids read as unhealthy.
    pub fn is_healthy(&self, id: &str) -> bool {
        self.slots.read().get(id).map(|s| s.healthy).unwrap_or(false)
    }

    /// Ids of nodes currently flagged healthy, in registration order.
    pub fn healthy_ids(&self) -> Vec<NodeId> {
        let slots = self.slots.read();
        self.order
            .read()
            .iter()
            .filter(|id| slots.get(*id).is_some_and(|s| s.healthy))
            .cloned()
            .collect()
    }

    /// Update the health flag for a node.
    pub fn set_healthy(&self, id: &str, healthy: bool) {
        let mut slots = self.slots.write();
        if let Some(slot) = slots.get_mut(id) {
            if slot.healthy != healthy {
                if healthy {
                    info!(node_id = %id, "node marked healthy");
                } else {
                    warn!(node_id = %id, "node marked unhealthy");
                }
                slot.healthy = healthy;
            }
        }
    }

    /// Probe a node and restore its health flag on success.
    ///
    /// Used by the recovery supervisor after a NODE_DOWN event.
    pub async fn reconnect(&self, id: &str) -> Result<()> {
        let backend = self.backend(id)?;
        match backend.ping().await {
            Ok(()) => {
                self.set_healthy(id, true);
                Ok(())
            }
            Err(e) => {
                self.set_healthy(id, false);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry() -> NodeRegistry {
        NodeRegistry::in_memory(&[
            NodeConfig::new("redis-1", NodeKind::Redis, "127.0.0.1", 6379),
            NodeConfig::new("memcached-1", NodeKind::Memcached, "127.0.0.1", 11211),
        ])
    }

    #[test]
    fn test_lookup_and_order() {
        let reg = registry();
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.node_ids(), vec!["redis-1", "memcached-1"]);
        assert!(reg.backend("redis-1").is_ok());
        assert!(matches!(
            reg.backend("unknown"),
            Err(Error::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let reg = registry();
        let config = NodeConfig::new("redis-2", NodeKind::Redis, "127.0.0.1", 6380);
        reg.register(config.clone(), Arc::new(RedisNode::new("redis-2")))
            .unwrap();
        assert_eq!(reg.len(), 3);
        assert!(reg
            .register(config, Arc::new(RedisNode::new("redis-2")))
            .is_err());
    }

    #[test]
    fn test_health_flag() {
        let reg = registry();
        assert!(reg.is_healthy("redis-1"));
        reg.set_healthy("redis-1", false);
        assert!(!reg.is_healthy("redis-1"));
        assert_eq!(reg.healthy_ids(), vec!["memcached-1".to_string()]);
    }

    #[tokio::test]
    async fn test_reconnect_restores_health() {
        let node = Arc::new(RedisNode::new("redis-1"));
        let config = NodeConfig::new("redis-1", NodeKind::Redis, "127.0.0.1", 6379)
            .with_timeout(Duration::from_secs(1));
        let reg = NodeRegistry::new(vec![(config, node.clone() as Arc<dyn Backend>)]);

        node.set_offline(true);
        reg.set_healthy("redis-1", false);
        assert!(reg.reconnect("redis-1").await.is_err());
        assert!(!reg.is_healthy("redis-1"));

        node.set_offline(false);
        reg.reconnect("redis-1").await.unwrap();
        assert!(reg.is_healthy("redis-1"));
    }
}
