//! Backend node abstraction.
//!
//! Every operation the coordinator issues to a node goes through the
//! [`Backend`] capability trait. There is one implementation per backend
//! kind rather than type-string branching at call sites; the coordinator
//! never sees a concrete client type.

pub mod memory;
pub mod registry;

pub use memory::{MemcachedNode, RedisNode};
pub use registry::NodeRegistry;

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Per-key metadata used by eviction candidate selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyInfo {
    /// Stored size in bytes (envelope included).
    pub size_bytes: u64,
    /// Last read or write, milliseconds since the Unix epoch.
    pub last_access_ms: u64,
    /// Reads since the key was written.
    pub access_count: u64,
    /// Absolute expiry in epoch milliseconds, if a TTL was set.
    pub expires_at_ms: Option<u64>,
}

/// Aggregate usage of one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    /// Stored bytes across all live entries.
    pub size_bytes: u64,
    /// Live entry count.
    pub items: u64,
}

/// Capability interface for a single backend node.
///
/// Implementations map their own failures into the crate error taxonomy;
/// client-library errors must not escape. Capabilities a kind cannot provide
/// (memcached key enumeration) surface as `Error::Unsupported`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Human-readable kind tag, used in logs and errors.
    fn kind(&self) -> &'static str;

    /// Read the raw bytes stored under `key`, if present and not expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store raw bytes under `key`, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Remove `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Drop every entry on this node.
    async fn clear(&self) -> Result<()>;

    /// Liveness probe.
    async fn ping(&self) -> Result<()>;

    /// Enumerate every live key on this node.
    async fn scan_keys(&self) -> Result<Vec<String>>;

    /// Remaining TTL for `key`, `None` when the key has no expiry.
    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Access metadata for `key`, `None` when absent.
    async fn key_info(&self, key: &str) -> Result<Option<KeyInfo>>;

    /// Aggregate usage of this node.
    async fn stats(&self) -> Result<BackendStats>;
}
