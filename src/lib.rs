//! Shoal turns a set of independent key-value backends into one logical
//! cache with replication, quorum consistency and online rebalancing.
//!
//! The [`CacheCoordinator`] is the public surface: it maps keys to nodes
//! through a pluggable [`partition::Partitioner`] (consistent-hash ring or
//! fixed ranges), fans reads and writes out to a primary and its replicas,
//! and combines the per-node results under the configured
//! [`ConsistencyLevel`]. Every node call runs through that node's
//! [`breaker::CircuitBreaker`], every mutation is announced on the priority
//! [`events::EventBus`], and background tasks handle eviction, priority
//! expiry, key migration and node recovery.
//!
//! The crate is embedded as a library; it speaks no wire protocol of its
//! own. Backends plug in through the [`node::Backend`] trait, and embedded
//! in-memory implementations are provided for tests and single-process use.
//!
//! ```no_run
//! use shoal::{CacheCoordinator, CoordinatorConfig, NodeConfig, NodeKind};
//! use bytes::Bytes;
//!
//! # async fn demo() -> shoal::Result<()> {
//! let nodes = vec![
//!     NodeConfig::new("redis-1", NodeKind::Redis, "10.0.0.1", 6379),
//!     NodeConfig::new("redis-2", NodeKind::Redis, "10.0.0.2", 6379),
//!     NodeConfig::new("redis-3", NodeKind::Redis, "10.0.0.3", 6379),
//! ];
//! let cache = CacheCoordinator::new(CoordinatorConfig::new(nodes))?;
//!
//! cache.set("user:42", Bytes::from_static(b"profile"), None, None, None).await?;
//! let value = cache.get("user:42", None).await?;
//! # let _ = value;
//! cache.close().await;
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod breaker;
pub mod cleaner;
pub mod compress;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod hooks;
pub mod metrics;
pub mod migration;
pub mod node;
pub mod partition;
pub mod priority;
pub mod recovery;
pub mod testing;
pub mod types;

pub use backup::{BackupManager, BackupSnapshot};
pub use breaker::{BreakerState, CircuitBreaker};
pub use cleaner::{CleanerStats, EvictionCleaner};
pub use config::{
    BreakerConfig, CleanerConfig, CoordinatorConfig, EventBusConfig, EvictionStrategy,
    MigrationConfig, NodeConfig, NodeKind, PartitioningStrategy, PriorityConfig,
};
pub use coordinator::{CacheCoordinator, CoordinatorBuilder};
pub use error::{Error, Result};
pub use events::{BusStats, CacheEvent, EventBus, EventType, PatternSpec};
pub use hooks::{AccessPolicy, Cipher, MetricsSink};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use migration::{MigrationManager, MigrationStatus, MigrationTask};
pub use node::{Backend, NodeRegistry};
pub use partition::{MovementPlan, Partition, Partitioner};
pub use priority::PriorityTracker;
pub use recovery::{RecoveryConfig, RecoverySupervisor};
pub use types::{ConsistencyLevel, HealthReport, NodeHealth, NodeId, Priority, StoredValue};
