//! Fixed-range partitioner.
//!
//! The 64-bit key space is split into a fixed number of equal ranges. Range
//! `i` is owned by `node[i mod node_count]` with the following nodes as
//! replicas. Simpler than the ring but a topology change reassigns many
//! ranges, so it suits stable node sets.

use super::{hash_key, MovementPlan, Partition, Partitioner};
use crate::error::{Error, Result};
use crate::types::NodeId;
use tracing::{debug, info};

/// Fixed-range strategy.
pub struct RangePartitioner {
    /// Committed primary assignment per range index.
    assignment: Vec<NodeId>,
    /// Pending node set; committed by `rebalance`.
    nodes: Vec<NodeId>,
    num_partitions: usize,
    replication_factor: usize,
    version: u64,
}

impl RangePartitioner {
    /// Build the ranges over the given nodes and commit the assignment.
    pub fn new(nodes: Vec<NodeId>, replication_factor: usize, num_partitions: usize) -> Self {
        let mut p = Self {
            assignment: Vec::new(),
            nodes,
            num_partitions: num_partitions.max(1),
            replication_factor: replication_factor.max(1),
            version: 0,
        };
        p.assignment = p.compute_assignment();
        info!(
            nodes = p.nodes.len(),
            partitions = p.num_partitions,
            "range partitions created"
        );
        p
    }

    fn compute_assignment(&self) -> Vec<NodeId> {
        (0..self.num_partitions)
            .map(|i| self.nodes[i % self.nodes.len()].clone())
            .collect()
    }

    /// Bounds of range `i` as `[start, end]` inclusive.
    fn range_bounds(&self, i: usize) -> (u64, u64) {
        let n = self.num_partitions as u128;
        let start = (i as u128 * (u64::MAX as u128 + 1) / n) as u64;
        let end = (((i as u128 + 1) * (u64::MAX as u128 + 1)) / n - 1) as u64;
        (start, end)
    }

    fn range_index(&self, hash: u64) -> usize {
        ((hash as u128 * self.num_partitions as u128) >> 64) as usize
    }

    /// Replicas for the node committed at `assignment[i]`: the next distinct
    /// nodes in the committed rotation.
    fn replicas_for(&self, i: usize) -> Vec<NodeId> {
        let mut committed: Vec<&NodeId> = self.assignment.iter().collect();
        committed.sort();
        committed.dedup();
        let node_count = committed.len();

        let want = (self.replication_factor - 1).min(node_count.saturating_sub(1));
        let primary = &self.assignment[i];
        let mut replicas = Vec::with_capacity(want);
        for offset in 1..=self.num_partitions {
            let candidate = &self.assignment[(i + offset) % self.num_partitions];
            if candidate != primary && !replicas.contains(candidate) {
                replicas.push(candidate.clone());
                if replicas.len() >= want {
                    break;
                }
            }
        }
        replicas
    }
}

impl Partitioner for RangePartitioner {
    fn get_partition(&self, key: &str) -> Partition {
        let hash = hash_key(key.as_bytes());
        let i = self.range_index(hash);
        let (start, end) = self.range_bounds(i);

        Partition {
            id: format!("range-{i}"),
            hash_range: (start, end),
            primary: self.assignment[i].clone(),
            replicas: self.replicas_for(i),
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
        let new_assignment = self.compute_assignment();
        let mut movements = MovementPlan::new();

        for (old, new) in self.assignment.iter().zip(&new_assignment) {
            if old != new {
                let targets = movements.entry(old.clone()).or_default();
                if !targets.contains(new) {
                    targets.push(new.clone());
                }
            }
        }

        if self.assignment != new_assignment {
            self.assignment = new_assignment;
            self.version += 1;
            debug!(
                version = self.version,
                sources = movements.len(),
                "range assignment committed"
            );
        }

        movements
    }

    fn node_count(&self) -> usize {
        let mut committed: Vec<&NodeId> = self.assignment.iter().collect();
        committed.sort();
        committed.dedup();
        committed.len()
    }

    fn topology_version(&self) -> u64 {
        self.version
    }
}
