//! Consistent-hash ring partitioner with virtual nodes.
//!
//! Each physical node is hashed into a configurable number of virtual points
//! on a shared 64-bit ring. A key's primary is the first virtual point at or
//! after the key's hash scanning clockwise; replicas are the next distinct
//! physical nodes encountered. Adding or removing a node only reassigns the
//! key ranges adjacent to its own virtual points.

use super::{hash_key, MovementPlan, Partition, Partitioner};
use crate::error::{Error, Result};
use crate::types::NodeId;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Consistent-hash ring strategy.
pub struct RingPartitioner {
    /// Committed assignment: virtual point position to owning node.
    ring: BTreeMap<u64, NodeId>,
    /// Pending node set; committed by `rebalance`.
    nodes: Vec<NodeId>,
    virtual_nodes: usize,
    replication_factor: usize,
    version: u64,
}

impl RingPartitioner {
    /// Build a ring over the given nodes and commit the initial assignment.
    pub fn new(nodes: Vec<NodeId>, replication_factor: usize, virtual_nodes: usize) -> Self {
        let mut p = Self {
            ring: BTreeMap::new(),
            nodes,
            virtual_nodes: virtual_nodes.max(1),
            replication_factor: replication_factor.max(1),
            version: 0,
        };
        p.ring = p.build_ring();
        info!(
            nodes = p.nodes.len(),
            points = p.ring.len(),
            "consistent hash ring built"
        );
        p
    }

    fn build_ring(&self) -> BTreeMap<u64, NodeId> {
        let mut ring = BTreeMap::new();
        for node in &self.nodes {
            for i in 0..self.virtual_nodes {
                let point = hash_key(format!("{node}:{i}").as_bytes());
                ring.insert(point, node.clone());
            }
        }
        ring
    }

    /// Distinct physical nodes encountered scanning clockwise from `point`,
    /// inclusive. The first entry is the primary at that position.
    fn owners_from(ring: &BTreeMap<u64, NodeId>, point: u64, count: usize) -> Vec<NodeId> {
        let mut owners: Vec<NodeId> = Vec::with_capacity(count);
        for (_, node) in ring.range(point..).chain(ring.iter()) {
            if !owners.contains(node) {
                owners.push(node.clone());
                if owners.len() >= count {
                    break;
                }
            }
        }
        owners
    }

    /// Clockwise owner at `point`, wrapping at the top of the ring.
    fn owner_at(ring: &BTreeMap<u64, NodeId>, point: u64) -> Option<NodeId> {
        ring.range(point..)
            .next()
            .or_else(|| ring.iter().next())
            .map(|(_, n)| n.clone())
    }
}

impl Partitioner for RingPartitioner {
    fn get_partition(&self, key: &str) -> Partition {
        let hash = hash_key(key.as_bytes());

        // First virtual point at or after the key, wrapping at the top.
        let (&point, _) = self
            .ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .expect("ring is never empty after construction");

        let start = self
            .ring
            .range(..point)
            .next_back()
            .map(|(&p, _)| p.wrapping_add(1))
            .unwrap_or_else(|| {
                self.ring
                    .keys()
                    .next_back()
                    .map(|&p| p.wrapping_add(1))
                    .unwrap_or(0)
            });

        let distinct = self
            .replication_factor
            .min(self.node_count());
        let mut owners = Self::owners_from(&self.ring, point, distinct);
        let primary = owners.remove(0);

        Partition {
            id: format!("ring-{point:016x}"),
            hash_range: (start, point),
            primary,
            replicas: owners,
        }
    }

    fn add_node(&mut self, id: NodeId) {
        if !self.nodes.contains(&id) {
            self.nodes.push(id);
        }
    }

    fn remove_node(&mut self, id: &str) -> Result<()> {
        if !self.nodes.iter().any(|n| n == id) {
            return Ok(());
        }
        if self.nodes.len() - 1 < self.replication_factor {
            return Err(Error::Config(format!(
                "removing node {id} would leave {} nodes, below replication factor {}",
                self.nodes.len() - 1,
                self.replication_factor
            )));
        }
        self.nodes.retain(|n| n != id);
        Ok(())
    }

    fn rebalance(&mut self) -> MovementPlan {
        let new_ring = self.build_ring();
        let mut movements: MovementPlan = MovementPlan::new();

        // Walk the union of old and new virtual points: a removed node's
        // points show where its keys go, an added node's points show where
        // its keys come from. At every other point the owner is unchanged.
        let points: BTreeSet<u64> = self.ring.keys().chain(new_ring.keys()).copied().collect();
        for point in points {
            let old_owner = Self::owner_at(&self.ring, point);
            let new_owner = Self::owner_at(&new_ring, point);
            if let (Some(old_owner), Some(new_owner)) = (old_owner, new_owner) {
                if old_owner != new_owner {
                    let targets = movements.entry(old_owner).or_default();
                    if !targets.contains(&new_owner) {
                        targets.push(new_owner);
                    }
                }
            }
        }

        if self.ring != new_ring {
            self.ring = new_ring;
            self.version += 1;
            debug!(
                version = self.version,
                sources = movements.len(),
                "ring topology committed"
            );
        }

        movements
    }

    fn node_count(&self) -> usize {
        let mut committed: Vec<&NodeId> = self.ring.values().collect();
        committed.sort();
        committed.dedup();
        committed.len()
    }

    fn topology_version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_node_ring() -> RingPartitioner {
        RingPartitioner::new(
            vec!["a".into(), "b".into(), "c".into()],
            2,
            256,
        )
    }

    #[test]
    fn test_partition_is_deterministic() {
        let ring = three_node_ring();
        for key in ["k1", "user:42", "a-much-longer-key-name"] {
            let first = ring.get_partition(key);
            for _ in 0..10 {
                assert_eq!(ring.get_partition(key), first);
            }
        }
    }

    #[test]
    fn test_replica_invariants() {
        let ring = three_node_ring();
        for i in 0..200 {
            let p = ring.get_partition(&format!("key-{i}"));
            assert_eq!(p.replicas.len(), 1); // min(rf-1, n-1) = 1
            assert!(!p.replicas.contains(&p.primary));
        }
    }

    #[test]
    fn test_single_node_has_no_replicas() {
        let ring = RingPartitioner::new(vec!["only".into()], 2, 64);
        let p = ring.get_partition("k");
        assert_eq!(p.primary, "only");
        assert!(p.replicas.is_empty());
    }

    #[test]
    fn test_rebalance_noop_when_unchanged() {
        let mut ring = three_node_ring();
        assert!(ring.rebalance().is_empty());
        assert_eq!(ring.topology_version(), 0);
    }

    #[test]
    fn test_remove_node_moves_only_its_keys() {
        let mut ring = three_node_ring();

        let keys: Vec<String> = (0..500).map(|i| format!("key-{i}")).collect();
        let before: Vec<(String, NodeId)> = keys
            .iter()
            .map(|k| (k.clone(), ring.get_partition(k).primary))
            .collect();

        ring.remove_node("c").unwrap();
        let movements = ring.rebalance();

        // Only the removed node hands keys away.
        assert_eq!(movements.keys().collect::<Vec<_>>(), vec!["c"]);

        for (key, old_primary) in before {
            let new_primary = ring.get_partition(&key).primary;
            if old_primary != "c" {
                assert_eq!(new_primary, old_primary, "key {key} moved needlessly");
            } else {
                assert_ne!(new_primary, "c");
            }
        }
        assert_eq!(ring.topology_version(), 1);
    }

    #[test]
    fn test_remove_below_replication_factor_rejected() {
        let mut ring = three_node_ring(); // rf = 2
        ring.remove_node("c").unwrap();
        let err = ring.remove_node("b").unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        // The last node can never be removed: lookups stay answerable.
        let mut solo = RingPartitioner::new(vec!["only".into()], 1, 64);
        assert!(solo.remove_node("only").is_err());
        solo.rebalance();
        assert_eq!(solo.get_partition("k").primary, "only");
    }

    #[test]
    fn test_add_node_takes_effect_on_rebalance() {
        let mut ring = three_node_ring();
        ring.add_node("d".into());

        // Pending only: lookups still resolve to the committed set.
        for i in 0..100 {
            assert_ne!(ring.get_partition(&format!("key-{i}")).primary, "d");
        }

        let movements = ring.rebalance();
        assert!(!movements.is_empty());
        assert!(movements.values().flatten().any(|n| n == "d"));
        assert_eq!(ring.node_count(), 4);
    }

    #[test]
    fn test_distribution_roughly_even() {
        let ring = three_node_ring();
        let mut counts = std::collections::HashMap::new();
        for i in 0..9000 {
            let p = ring.get_partition(&format!("sample-{i}"));
            *counts.entry(p.primary).or_insert(0usize) += 1;
        }
        for (node, count) in counts {
            assert!(
                (1800..=4200).contains(&count),
                "node {node} owns {count} of 9000 keys"
            );
        }
    }
}
