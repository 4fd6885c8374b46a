//! Error types for the cache coordination layer.

use crate::types::NodeId;
use thiserror::Error;

/// Result type alias for coordinator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type surfaced to embedding callers.
///
/// Backend-specific failures never escape directly; they are mapped into this
/// taxonomy at the node boundary.
#[derive(Error, Debug)]
pub enum Error {
    /// A node is unreachable.
    #[error("connection error on node {node}: {reason}")]
    Connection { node: NodeId, reason: String },

    /// Fewer than the required reads/writes succeeded.
    #[error("consistency error: {achieved}/{required} {operation} acks")]
    Consistency {
        operation: &'static str,
        required: usize,
        achieved: usize,
    },

    /// A permission check failed.
    #[error("unauthorized: missing {permission} permission")]
    Unauthorized { permission: &'static str },

    /// A per-node call exceeded its bound.
    #[error("operation timed out after {timeout_ms}ms on node {node}")]
    Timeout { node: NodeId, timeout_ms: u64 },

    /// Compression, encryption or envelope decoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A rebalance task could not complete.
    #[error("migration error: {0}")]
    Migration(String),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Node id not present in the registry.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// The requested capability is not supported by this backend kind.
    #[error("unsupported on {kind} backend: {operation}")]
    Unsupported {
        kind: &'static str,
        operation: &'static str,
    },

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error is local to a single node and should be absorbed by
    /// that node's circuit breaker rather than propagated.
    pub fn is_node_local(&self) -> bool {
        matches!(self, Error::Connection { .. } | Error::Timeout { .. })
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
