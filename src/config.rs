//! Configuration types for the coordinator and its subsystems.

use crate::error::{Error, Result};
use crate::types::{ConsistencyLevel, NodeId};
use std::time::Duration;

/// Backend kind of a configured node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Redis,
    Memcached,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Redis => write!(f, "redis"),
            NodeKind::Memcached => write!(f, "memcached"),
        }
    }
}

/// Static description of one backend node.
///
/// How these records are loaded (YAML, JSON, env) is the embedder's concern;
/// the coordinator only consumes the resolved list.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Stable node identifier, e.g. `"redis-1"`.
    pub id: NodeId,
    /// Backend kind.
    pub kind: NodeKind,
    /// Host name or address.
    pub host: String,
    /// Port.
    pub port: u16,
    /// Database index (redis only).
    pub db: u32,
    /// Optional password.
    pub password: Option<String>,
    /// Per-connection timeout.
    pub timeout: Duration,
}

impl NodeConfig {
    /// Create a node config with defaults for the optional fields.
    pub fn new(id: impl Into<NodeId>, kind: NodeKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            kind,
            host: host.into(),
            port,
            db: 0,
            password: None,
            timeout: Duration::from_secs(5),
        }
    }

    /// Set the database index.
    pub fn with_db(mut self, db: u32) -> Self {
        self.db = db;
        self
    }

    /// Set the password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the connection timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Key-to-node mapping strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitioningStrategy {
    /// Consistent-hash ring with the given number of virtual points per node.
    ConsistentHash { virtual_nodes: usize },
    /// Fixed ranges assigned round-robin across nodes.
    Range { num_partitions: usize },
}

impl Default for PartitioningStrategy {
    fn default() -> Self {
        PartitioningStrategy::ConsistentHash { virtual_nodes: 256 }
    }
}

/// Candidate ordering used by the eviction cleaner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionStrategy {
    /// Least recently used first.
    Lru,
    /// Least frequently used first.
    Lfu,
    /// Soonest to expire first.
    Ttl,
    /// Lowest externally assigned priority first; falls back to LRU when no
    /// priority tracker is attached.
    Priority,
}

/// Circuit breaker tuning, shared by all per-node breakers.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Time an open breaker waits before probing again.
    pub reset_timeout: Duration,
    /// Maximum time to sit half-open without a success.
    pub half_open_timeout: Duration,
    /// Bound on every call routed through the breaker.
    pub operation_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_timeout: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(1),
        }
    }
}

/// Event bus sizing.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Capacity of each priority lane.
    pub queue_capacity: usize,
    /// Worker tasks per priority lane.
    pub workers_per_lane: usize,
    /// Replays of a retry-lane event before it is converted to an error.
    pub max_retries: u32,
    /// Delay before a retry-lane event is replayed.
    pub retry_delay: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            workers_per_lane: 2,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Eviction cleaner tuning.
#[derive(Debug, Clone)]
pub struct CleanerConfig {
    /// How often the cleaner wakes up.
    pub interval: Duration,
    /// Candidate ordering.
    pub strategy: EvictionStrategy,
    /// Size budget in bytes across all nodes.
    pub max_size_bytes: u64,
    /// Item count budget across all nodes.
    pub max_items: u64,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            strategy: EvictionStrategy::Lru,
            max_size_bytes: 1024 * 1024 * 1024,
            max_items: 1_000_000,
        }
    }
}

/// Priority tracker bounds.
#[derive(Debug, Clone)]
pub struct PriorityConfig {
    /// Maximum keys held at the high tier before demotion.
    pub max_high: usize,
    /// Maximum keys held at the medium tier before demotion.
    pub max_medium: usize,
    /// Sweep interval for expired entries.
    pub sweep_interval: Duration,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            max_high: 1_000,
            max_medium: 5_000,
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// Migration manager tuning.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Concurrent migration tasks.
    pub max_workers: usize,
    /// Keys copied per batch.
    pub batch_size: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            batch_size: 100,
        }
    }
}

/// Main configuration for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Backend nodes.
    pub nodes: Vec<NodeConfig>,
    /// Copies of each key, primary included.
    pub replication_factor: usize,
    /// Read/write ack requirement.
    pub consistency: ConsistencyLevel,
    /// Write attempts before giving up.
    pub retry_attempts: u32,
    /// Base delay between write attempts (jittered).
    pub retry_delay: Duration,
    /// Key-to-node mapping strategy.
    pub partitioning: PartitioningStrategy,
    /// Payloads at or above this size are compressed.
    pub compression_threshold: usize,
    /// Per-node circuit breaker tuning.
    pub breaker: BreakerConfig,
    /// Event bus sizing.
    pub event_bus: EventBusConfig,
    /// Eviction cleaner tuning.
    pub cleaner: CleanerConfig,
    /// Priority tracker bounds.
    pub priority: PriorityConfig,
    /// Migration manager tuning.
    pub migration: MigrationConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            replication_factor: 2,
            consistency: ConsistencyLevel::Quorum,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            partitioning: PartitioningStrategy::default(),
            compression_threshold: 1024,
            breaker: BreakerConfig::default(),
            event_bus: EventBusConfig::default(),
            cleaner: CleanerConfig::default(),
            priority: PriorityConfig::default(),
            migration: MigrationConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Create a configuration for the given nodes with defaults elsewhere.
    pub fn new(nodes: Vec<NodeConfig>) -> Self {
        Self {
            nodes,
            ..Default::default()
        }
    }

    /// Set the replication factor.
    pub fn with_replication_factor(mut self, rf: usize) -> Self {
        self.replication_factor = rf;
        self
    }

    /// Set the consistency level.
    pub fn with_consistency(mut self, level: ConsistencyLevel) -> Self {
        self.consistency = level;
        self
    }

    /// Set retry attempts and base delay for writes.
    pub fn with_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay = delay;
        self
    }

    /// Set the partitioning strategy.
    pub fn with_partitioning(mut self, strategy: PartitioningStrategy) -> Self {
        self.partitioning = strategy;
        self
    }

    /// Set the compression threshold in bytes.
    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    /// Set circuit breaker tuning.
    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Set the per-node operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.breaker.operation_timeout = timeout;
        self
    }

    /// Set event bus sizing.
    pub fn with_event_bus(mut self, event_bus: EventBusConfig) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Set eviction cleaner tuning.
    pub fn with_cleaner(mut self, cleaner: CleanerConfig) -> Self {
        self.cleaner = cleaner;
        self
    }

    /// Set the eviction strategy.
    pub fn with_eviction_strategy(mut self, strategy: EvictionStrategy) -> Self {
        self.cleaner.strategy = strategy;
        self
    }

    /// Set size/item budgets enforced by the cleaner.
    pub fn with_budgets(mut self, max_size_bytes: u64, max_items: u64) -> Self {
        self.cleaner.max_size_bytes = max_size_bytes;
        self.cleaner.max_items = max_items;
        self
    }

    /// Set migration tuning.
    pub fn with_migration(mut self, migration: MigrationConfig) -> Self {
        self.migration = migration;
        self
    }

    /// Set priority tracker bounds.
    pub fn with_priority(mut self, priority: PriorityConfig) -> Self {
        self.priority = priority;
        self
    }

    /// Check the cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::Config("at least one node is required".into()));
        }
        if self.replication_factor == 0 {
            return Err(Error::Config("replication_factor must be at least 1".into()));
        }
        if self.replication_factor > self.nodes.len() {
            return Err(Error::Config(format!(
                "replication_factor {} exceeds node count {}",
                self.replication_factor,
                self.nodes.len()
            )));
        }
        let mut ids: Vec<&NodeId> = self.nodes.iter().map(|n| &n.id).collect();
        ids.sort();
        ids.dedup();
        if ids.len() != self.nodes.len() {
            return Err(Error::Config("duplicate node ids".into()));
        }
        match self.partitioning {
            PartitioningStrategy::ConsistentHash { virtual_nodes } if virtual_nodes == 0 => {
                return Err(Error::Config("virtual_nodes must be at least 1".into()));
            }
            PartitioningStrategy::Range { num_partitions } if num_partitions == 0 => {
                return Err(Error::Config("num_partitions must be at least 1".into()));
            }
            _ => {}
        }
        Ok(())
    }
}
