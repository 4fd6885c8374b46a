//! Key-space partitioning.
//!
//! Two interchangeable strategies map a cache key to one primary node and an
//! ordered replica list: a consistent-hash ring and a fixed-range scheme.
//! Topology changes are snapshot-based: `add_node`/`remove_node` only edit
//! the node set, and `rebalance` commits a new assignment in one step while
//! reporting which data has to move.

pub mod range;
pub mod ring;

pub use range::RangePartitioner;
pub use ring::RingPartitioner;

use crate::config::PartitioningStrategy;
use crate::error::Result;
use crate::types::NodeId;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

/// The unit of key-space ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Stable identifier for logs and events.
    pub id: String,
    /// Owned hash range `[start, end]` on the 64-bit ring.
    pub hash_range: (u64, u64),
    /// Primary owner.
    pub primary: NodeId,
    /// Replica owners, primary excluded. Always
    /// `min(replication_factor - 1, node_count - 1)` entries.
    pub replicas: Vec<NodeId>,
}

impl Partition {
    /// Primary followed by replicas, the candidate order for reads/writes.
    pub fn candidates(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(1 + self.replicas.len());
        out.push(self.primary.clone());
        out.extend(self.replicas.iter().cloned());
        out
    }
}

/// Data movements required after a topology change: source node to the list
/// of nodes that took over some of its key space.
pub type MovementPlan = BTreeMap<NodeId, Vec<NodeId>>;

/// A key-to-node mapping strategy.
pub trait Partitioner: Send + Sync {
    /// Resolve the partition owning `key` under the committed topology.
    /// Deterministic and stable between `rebalance` calls.
    fn get_partition(&self, key: &str) -> Partition;

    /// Add a node to the pending topology. Takes effect on `rebalance`.
    fn add_node(&mut self, id: NodeId);

    /// Remove a node from the pending topology. Takes effect on `rebalance`.
    /// Fails when the removal would leave fewer pending nodes than the
    /// replication factor; every key must keep a full candidate set.
    fn remove_node(&mut self, id: &str) -> Result<()>;

    /// Recompute the assignment from the current node set, commit it, and
    /// report which sources must hand keys to which targets. Empty when the
    /// committed assignment was already up to date.
    fn rebalance(&mut self) -> MovementPlan;

    /// Nodes in the committed topology.
    fn node_count(&self) -> usize;

    /// Bumped every time `rebalance` commits a change.
    fn topology_version(&self) -> u64;
}

/// Hash a key onto the 64-bit ring. Shared by both strategies so a key's
/// position does not depend on the strategy chosen.
pub(crate) fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    key.hash(&mut hasher);
    hasher.finish()
}

/// Build the partitioner selected by the configuration.
pub fn create_partitioner(
    strategy: PartitioningStrategy,
    nodes: Vec<NodeId>,
    replication_factor: usize,
) -> Box<dyn Partitioner> {
    match strategy {
        PartitioningStrategy::ConsistentHash { virtual_nodes } => Box::new(
            RingPartitioner::new(nodes, replication_factor, virtual_nodes),
        ),
        PartitioningStrategy::Range { num_partitions } => Box::new(RangePartitioner::new(
            nodes,
            replication_factor,
            num_partitions,
        )),
    }
}
