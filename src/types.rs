//! Core types used throughout the coordination layer.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Node identifier. Backends are addressed by a stable, human-chosen id such
/// as `"redis-1"`.
pub type NodeId = String;

/// How many replica acknowledgements a read or write needs to succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    /// A single ack is enough.
    One,
    /// Majority of the replica set: `floor(rf / 2) + 1`.
    Quorum,
    /// Every replica must ack.
    All,
}

impl ConsistencyLevel {
    /// Number of acks required under this level for the given replication
    /// factor. Reads and writes use the same requirement.
    pub fn required_acks(&self, replication_factor: usize) -> usize {
        match self {
            ConsistencyLevel::One => 1,
            ConsistencyLevel::Quorum => replication_factor / 2 + 1,
            ConsistencyLevel::All => replication_factor,
        }
    }
}

impl std::fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsistencyLevel::One => write!(f, "one"),
            ConsistencyLevel::Quorum => write!(f, "quorum"),
            ConsistencyLevel::All => write!(f, "all"),
        }
    }
}

/// Priority tier shared by events and tracked keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// On-node value envelope.
///
/// Values are stored on backends as the bincode encoding of this struct so
/// that a reader can tell whether the payload was compressed or encrypted
/// before applying the inverse transforms. The write timestamp drives
/// read-repair: the most recent envelope wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredValue {
    /// The (possibly transformed) payload bytes.
    pub payload: Vec<u8>,
    /// Payload was run through the compressor.
    pub compressed: bool,
    /// Payload was run through the cipher.
    pub encrypted: bool,
    /// Milliseconds since the Unix epoch at write time.
    pub written_at_ms: u64,
}

impl StoredValue {
    /// Wrap raw payload bytes with the given transform markers, stamped now.
    pub fn new(payload: Vec<u8>, compressed: bool, encrypted: bool) -> Self {
        Self {
            payload,
            compressed,
            encrypted,
            written_at_ms: now_ms(),
        }
    }

    /// Encode the envelope for storage on a node.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Decode an envelope read back from a node.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Health of a single node as observed by `check_health`.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeHealth {
    /// Ping succeeded within the round-trip shown.
    Healthy { latency: Duration },
    /// Ping failed.
    Unreachable { reason: String },
}

impl NodeHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, NodeHealth::Healthy { .. })
    }
}

/// Cluster-wide health report.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Total configured nodes.
    pub total_nodes: usize,
    /// Nodes that answered the ping.
    pub healthy_nodes: usize,
    /// Per-node status.
    pub nodes: HashMap<NodeId, NodeHealth>,
}

impl HealthReport {
    /// Whether every configured node answered.
    pub fn all_healthy(&self) -> bool {
        self.healthy_nodes == self.total_nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_acks() {
        assert_eq!(ConsistencyLevel::One.required_acks(3), 1);
        assert_eq!(ConsistencyLevel::Quorum.required_acks(1), 1);
        assert_eq!(ConsistencyLevel::Quorum.required_acks(2), 2);
        assert_eq!(ConsistencyLevel::Quorum.required_acks(3), 2);
        assert_eq!(ConsistencyLevel::Quorum.required_acks(5), 3);
        assert_eq!(ConsistencyLevel::All.required_acks(3), 3);
    }

    #[test]
    fn test_stored_value_roundtrip() {
        let v = StoredValue::new(b"payload".to_vec(), true, false);
        let bytes = v.to_bytes().unwrap();
        let decoded = StoredValue::from_bytes(&bytes).unwrap();
        assert_eq!(v, decoded);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }
}
