//! Collaborator hooks consumed by the coordinator.
//!
//! Authorization, encryption and metrics are supplied by the embedding
//! process. The coordinator calls these seams at fixed points and ships
//! permissive/no-op defaults so that none of them is mandatory.

use crate::error::Result;

/// Permission names the coordinator checks.
pub mod permissions {
    pub const READ: &str = "read";
    pub const WRITE: &str = "write";
    pub const DELETE: &str = "delete";
}

/// Authorization check applied when an operation carries a token.
///
/// A denied check surfaces as `Error::Unauthorized`, never as a consistency
/// error.
pub trait AccessPolicy: Send + Sync {
    fn has_permission(&self, token: &str, permission: &str) -> bool;
}

/// Policy that grants everything. Used when no auth store is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn has_permission(&self, _token: &str, _permission: &str) -> bool {
        true
    }
}

/// Whether a key name suggests its value should be encrypted at rest.
///
/// The default [`Cipher::should_encrypt`] uses this; a cipher can override it
/// with its own policy.
pub fn key_looks_sensitive(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    ["password", "secret", "token", "credential", "apikey", "api_key"]
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Value encryption applied transparently inside `set` and inverted in `get`.
///
/// `encrypt` and `decrypt` must be exact inverses for arbitrary byte
/// payloads; the envelope records whether a value was encrypted so reads
/// never guess.
pub trait Cipher: Send + Sync {
    /// Whether this value should be encrypted before storage.
    fn should_encrypt(&self, key: &str, _value: &[u8]) -> bool {
        key_looks_sensitive(key)
    }

    fn encrypt(&self, value: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, value: &[u8]) -> Result<Vec<u8>>;
}

/// Cipher that never encrypts. Used when no encryption key is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCipher;

impl Cipher for NoCipher {
    fn should_encrypt(&self, _key: &str, _value: &[u8]) -> bool {
        false
    }

    fn encrypt(&self, value: &[u8]) -> Result<Vec<u8>> {
        Ok(value.to_vec())
    }

    fn decrypt(&self, value: &[u8]) -> Result<Vec<u8>> {
        Ok(value.to_vec())
    }
}

/// Operation labels passed to [`MetricsSink::record_duration`].
pub mod ops {
    pub const GET: &str = "get";
    pub const SET: &str = "set";
    pub const DELETE: &str = "delete";
    pub const CLEAR: &str = "clear";
    pub const HEALTH: &str = "check_health";
    pub const REBALANCE: &str = "rebalance";
}

/// Observability sink the coordinator reports into.
///
/// Storage and export format are the sink's concern; the crate ships an
/// atomic-counter implementation in [`crate::metrics`].
pub trait MetricsSink: Send + Sync {
    fn record_hit(&self) {}
    fn record_miss(&self) {}
    fn record_duration(&self, _op: &str, _duration: std::time::Duration) {}
    fn record_migration(&self, _success: bool) {}
    fn record_rebalance(&self, _success: bool) {}
    fn record_eviction(&self, _keys: u64) {}
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMetrics;

impl MetricsSink for NoMetrics {}
