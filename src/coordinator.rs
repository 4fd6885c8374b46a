//! The cache coordinator façade.
//!
//! Ties the registry, partitioner, breakers, event bus, priority tracker,
//! cleaner and migration manager together behind the public `get`/`set`/
//! `delete`/`clear`/`check_health`/`rebalance` surface. Values are stored as
//! [`StoredValue`] envelopes so reads know which transforms to invert, and
//! every per-node call runs through that node's circuit breaker.
//!
//! A write fans out to the primary and its replicas and succeeds once the
//! configured consistency level is satisfied; anything less is a consistency
//! error, never a silent downgrade. There is no fallback placement onto
//! nodes outside the key's partition: a value the partitioner cannot locate
//! again is worse than a failed write.

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::cleaner::EvictionCleaner;
use crate::compress::{decompress, maybe_compress};
use crate::config::{CoordinatorConfig, NodeConfig, NodeKind};
use crate::error::{Error, Result};
use crate::events::{CacheEvent, EventBus, EventType};
use crate::hooks::{ops, permissions, AccessPolicy, AllowAll, Cipher, MetricsSink, NoCipher, NoMetrics};
use crate::migration::MigrationManager;
use crate::node::{Backend, MemcachedNode, NodeRegistry, RedisNode};
use crate::partition::{create_partitioner, MovementPlan, Partition, Partitioner};
use crate::priority::PriorityTracker;
use crate::types::{HealthReport, NodeHealth, NodeId, Priority, StoredValue};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

/// Builder for [`CacheCoordinator`].
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    backends: Option<Vec<(NodeConfig, Arc<dyn Backend>)>>,
    policy: Arc<dyn AccessPolicy>,
    cipher: Arc<dyn Cipher>,
    metrics: Arc<dyn MetricsSink>,
}

impl CoordinatorBuilder {
    /// Supply explicit backend handles instead of embedded in-memory nodes.
    /// One handle per config record, ids matching.
    pub fn backends(mut self, backends: Vec<(NodeConfig, Arc<dyn Backend>)>) -> Self {
        self.backends = Some(backends);
        self
    }

    /// Attach an authorization policy. Defaults to allow-all.
    pub fn policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Attach a value cipher. Defaults to no encryption.
    pub fn cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.cipher = cipher;
        self
    }

    /// Attach a metrics sink. Defaults to a no-op sink.
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Validate the configuration and start the coordinator.
    ///
    /// Spawns the event bus workers and the cleaner/tracker background tasks,
    /// so this must run inside a tokio runtime.
    pub fn build(self) -> Result<CacheCoordinator> {
        self.config.validate()?;

        let registry = Arc::new(match self.backends {
            Some(backends) => NodeRegistry::new(backends),
            None => NodeRegistry::in_memory(&self.config.nodes),
        });
        let partitioner = create_partitioner(
            self.config.partitioning,
            registry.node_ids(),
            self.config.replication_factor,
        );
        let bus = Arc::new(EventBus::new(self.config.event_bus.clone()));
        let tracker = Arc::new(PriorityTracker::new(self.config.priority.clone()));
        let cleaner = Arc::new(EvictionCleaner::new(
            self.config.cleaner.clone(),
            registry.clone(),
            tracker.clone(),
            bus.clone(),
            self.metrics.clone(),
        ));
        let migration = Arc::new(MigrationManager::new(
            self.config.migration.clone(),
            registry.clone(),
            bus.clone(),
            self.metrics.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let background = vec![
            tracker.clone().spawn_sweeper(shutdown_rx.clone()),
            cleaner.clone().spawn(shutdown_rx),
        ];

        info!(
            nodes = registry.len(),
            replication_factor = self.config.replication_factor,
            consistency = %self.config.consistency,
            "coordinator started"
        );

        Ok(CacheCoordinator {
            config: self.config,
            registry,
            partitioner: RwLock::new(partitioner),
            breakers: DashMap::new(),
            bus,
            tracker,
            cleaner,
            migration,
            policy: self.policy,
            cipher: self.cipher,
            metrics: self.metrics,
            shutdown_tx,
            background: AsyncMutex::new(background),
        })
    }
}

/// Distributed cache façade.
pub struct CacheCoordinator {
    config: CoordinatorConfig,
    registry: Arc<NodeRegistry>,
    partitioner: RwLock<Box<dyn Partitioner>>,
    breakers: DashMap<NodeId, Arc<CircuitBreaker>>,
    bus: Arc<EventBus>,
    tracker: Arc<PriorityTracker>,
    cleaner: Arc<EvictionCleaner>,
    migration: Arc<MigrationManager>,
    policy: Arc<dyn AccessPolicy>,
    cipher: Arc<dyn Cipher>,
    metrics: Arc<dyn MetricsSink>,
    shutdown_tx: watch::Sender<bool>,
    background: AsyncMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl CacheCoordinator {
    /// Coordinator over embedded in-memory nodes with default collaborators.
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: CoordinatorConfig) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            backends: None,
            policy: Arc::new(AllowAll),
            cipher: Arc::new(NoCipher),
            metrics: Arc::new(NoMetrics),
        }
    }

    /// Event bus handle for subscribers (backup, recovery, alerting).
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<PriorityTracker> {
        &self.tracker
    }

    pub fn cleaner(&self) -> &Arc<EvictionCleaner> {
        &self.cleaner
    }

    pub fn migration(&self) -> &Arc<MigrationManager> {
        &self.migration
    }

    /// Committed topology version, bumped by `rebalance`.
    pub fn topology_version(&self) -> u64 {
        self.partitioner.read().topology_version()
    }

    /// Partition owning `key` under the committed topology.
    pub fn partition_for(&self, key: &str) -> Partition {
        self.partitioner.read().get_partition(key)
    }

    /// Read `key`, returning `None` on a plain miss.
    ///
    /// Candidates are tried primary first; the call succeeds once the
    /// required number of nodes answered, and the newest envelope among the
    /// answers wins. Too few answering nodes is a consistency error.
    pub async fn get(&self, key: &str, token: Option<&str>) -> Result<Option<Bytes>> {
        let start = Instant::now();
        self.authorize(token, permissions::READ)
            .map_err(|e| self.raise(e, Some(key)))?;

        let partition = self.partition_for(key);
        let required = self.required_acks();
        let mut successes = 0usize;
        let mut newest: Option<StoredValue> = None;

        for node in partition.candidates() {
            match self.read_envelope(&node, key).await {
                Ok(found) => {
                    successes += 1;
                    if let Some(envelope) = found {
                        let is_newer = newest
                            .as_ref()
                            .map_or(true, |n| envelope.written_at_ms > n.written_at_ms);
                        if is_newer {
                            newest = Some(envelope);
                        }
                    }
                    if successes >= required {
                        break;
                    }
                }
                Err(e) => {
                    debug!(node_id = %node, key = %key, error = %e, "read failed on node");
                    self.note_node_failure(&node);
                }
            }
        }

        if successes < required {
            let e = Error::Consistency {
                operation: "get",
                required,
                achieved: successes,
            };
            self.metrics.record_duration(ops::GET, start.elapsed());
            return Err(self.raise(e, Some(key)));
        }

        let result = match newest {
            Some(envelope) => {
                let value = self
                    .decode(envelope)
                    .map_err(|e| self.raise(e, Some(key)))?;
                self.metrics.record_hit();
                Some(value)
            }
            None => {
                self.metrics.record_miss();
                None
            }
        };
        self.bus
            .publish(CacheEvent::new(EventType::Get).with_key(key).with_node(partition.primary));
        self.metrics.record_duration(ops::GET, start.elapsed());
        Ok(result)
    }

    /// Read `key`, substituting `default` on a miss.
    pub async fn get_or(&self, key: &str, default: Bytes, token: Option<&str>) -> Result<Bytes> {
        Ok(self.get(key, token).await?.unwrap_or(default))
    }

    /// Write `key` to its partition.
    ///
    /// The value is compressed past the configured threshold and encrypted
    /// when the cipher asks for it, then fanned out to the primary and every
    /// replica. Succeeds once the required number of nodes acked; retried
    /// with jittered backoff, and failed with a consistency error after the
    /// last attempt.
    pub async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
        priority: Option<Priority>,
        token: Option<&str>,
    ) -> Result<()> {
        let start = Instant::now();
        self.authorize(token, permissions::WRITE)
            .map_err(|e| self.raise(e, Some(key)))?;

        let envelope = self
            .encode(key, &value)
            .map_err(|e| self.raise(e, Some(key)))?;
        let stored = envelope
            .to_bytes()
            .map_err(|e| self.raise(e.into(), Some(key)))?;
        let partition = self.partition_for(key);
        let candidates = partition.candidates();
        let required = self.required_acks();
        let attempts = self.config.retry_attempts.max(1);
        let mut achieved = 0usize;

        for attempt in 1..=attempts {
            achieved = 0;
            for node in &candidates {
                let bytes = stored.clone();
                let outcome = self
                    .with_breaker(node, |backend| async move {
                        backend.set(key, bytes, ttl).await
                    })
                    .await;
                match outcome {
                    Ok(()) => achieved += 1,
                    Err(e) => {
                        debug!(node_id = %node, key = %key, error = %e, "write failed on node");
                        self.note_node_failure(node);
                    }
                }
            }
            if achieved >= required {
                if let Some(priority) = priority {
                    self.tracker.set(key, priority, ttl);
                }
                self.bus.publish(
                    CacheEvent::new(EventType::Set)
                        .with_key(key)
                        .with_node(partition.primary.clone()),
                );
                self.metrics.record_duration(ops::SET, start.elapsed());
                return Ok(());
            }
            if attempt < attempts {
                let delay = self.backoff(attempt);
                debug!(key = %key, attempt, delay_ms = delay.as_millis() as u64, "set retrying");
                tokio::time::sleep(delay).await;
            }
        }

        let e = Error::Consistency {
            operation: "set",
            required,
            achieved,
        };
        self.metrics.record_duration(ops::SET, start.elapsed());
        Err(self.raise(e, Some(key)))
    }

    /// Delete `key` from its partition.
    ///
    /// Requires the same number of acks as a write and clears the key's
    /// priority assignment. Returns whether any node actually held the key.
    pub async fn delete(&self, key: &str, token: Option<&str>) -> Result<bool> {
        let start = Instant::now();
        self.authorize(token, permissions::DELETE)
            .map_err(|e| self.raise(e, Some(key)))?;

        let partition = self.partition_for(key);
        let candidates = partition.candidates();
        let required = self.required_acks();
        let attempts = self.config.retry_attempts.max(1);
        let mut achieved = 0usize;
        let mut existed = false;

        for attempt in 1..=attempts {
            achieved = 0;
            for node in &candidates {
                let outcome = self
                    .with_breaker(node, |backend| async move { backend.delete(key).await })
                    .await;
                match outcome {
                    Ok(was_present) => {
                        achieved += 1;
                        existed |= was_present;
                    }
                    Err(e) => {
                        debug!(node_id = %node, key = %key, error = %e, "delete failed on node");
                        self.note_node_failure(node);
                    }
                }
            }
            if achieved >= required {
                self.tracker.remove(key);
                self.bus.publish(
                    CacheEvent::new(EventType::Delete)
                        .with_key(key)
                        .with_node(partition.primary.clone()),
                );
                self.metrics.record_duration(ops::DELETE, start.elapsed());
                return Ok(existed);
            }
            if attempt < attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        let e = Error::Consistency {
            operation: "delete",
            required,
            achieved,
        };
        self.metrics.record_duration(ops::DELETE, start.elapsed());
        Err(self.raise(e, Some(key)))
    }

    /// Drop every entry on every node, best effort.
    ///
    /// Nodes that fail are logged and skipped; this never raises for an
    /// unreachable node.
    pub async fn clear(&self) {
        let start = Instant::now();
        for node in self.registry.node_ids() {
            let outcome = self
                .with_breaker(&node, |backend| async move { backend.clear().await })
                .await;
            if let Err(e) = outcome {
                warn!(node_id = %node, error = %e, "clear failed on node, continuing");
            }
        }
        self.tracker.clear();
        self.bus
            .publish(CacheEvent::new(EventType::Info).with_metadata("operation", "clear"));
        self.metrics.record_duration(ops::CLEAR, start.elapsed());
    }

    /// Ping every node, measure round-trip latency and update health flags.
    ///
    /// A node that stops answering gets a `NodeDown` event; recovery from
    /// there is the recovery supervisor's job.
    pub async fn check_health(&self) -> HealthReport {
        let start = Instant::now();
        let ids = self.registry.node_ids();
        let mut nodes = HashMap::with_capacity(ids.len());
        let mut healthy = 0usize;

        for id in &ids {
            let status = match self.ping_node(id).await {
                Ok(latency) => {
                    self.registry.set_healthy(id, true);
                    healthy += 1;
                    NodeHealth::Healthy { latency }
                }
                Err(e) => {
                    let was_healthy = self.registry.is_healthy(id);
                    self.registry.set_healthy(id, false);
                    if was_healthy {
                        self.bus
                            .publish(CacheEvent::new(EventType::NodeDown).with_node(id.clone()));
                    }
                    NodeHealth::Unreachable {
                        reason: e.to_string(),
                    }
                }
            };
            nodes.insert(id.clone(), status);
        }

        self.metrics.record_duration(ops::HEALTH, start.elapsed());
        HealthReport {
            total_nodes: ids.len(),
            healthy_nodes: healthy,
            nodes,
        }
    }

    /// Commit pending topology changes and migrate the affected keys.
    ///
    /// Returns the movement plan that was executed; an empty plan means the
    /// topology was already balanced and no tasks ran.
    pub async fn rebalance(&self) -> Result<MovementPlan> {
        let start = Instant::now();
        self.bus.publish(CacheEvent::new(EventType::RebalanceStart));

        let plan = self.partitioner.write().rebalance();
        if plan.is_empty() {
            self.bus.publish(
                CacheEvent::new(EventType::RebalanceComplete).with_metadata("sources", "0"),
            );
            self.metrics.record_rebalance(true);
            self.metrics.record_duration(ops::REBALANCE, start.elapsed());
            return Ok(plan);
        }

        info!(sources = plan.len(), version = self.topology_version(), "rebalance committed");
        match self.migration.execute(&plan).await {
            Ok(()) => {
                self.bus.publish(
                    CacheEvent::new(EventType::RebalanceComplete)
                        .with_metadata("sources", plan.len().to_string()),
                );
                self.metrics.record_rebalance(true);
                self.metrics.record_duration(ops::REBALANCE, start.elapsed());
                Ok(plan)
            }
            Err(e) => {
                self.bus.publish(
                    CacheEvent::new(EventType::RebalanceFailed)
                        .with_metadata("reason", e.to_string()),
                );
                self.metrics.record_rebalance(false);
                self.metrics.record_duration(ops::REBALANCE, start.elapsed());
                Err(self.raise(e, None))
            }
        }
    }

    /// Register a new node and add it to the pending topology.
    ///
    /// Pass `None` to embed an in-memory node of the configured kind. The
    /// node takes no traffic until the next `rebalance`.
    pub fn add_node(&self, config: NodeConfig, backend: Option<Arc<dyn Backend>>) -> Result<()> {
        let id = config.id.clone();
        let backend = backend.unwrap_or_else(|| match config.kind {
            NodeKind::Redis => Arc::new(RedisNode::new(id.clone())),
            NodeKind::Memcached => Arc::new(MemcachedNode::new(id.clone())),
        });
        self.registry.register(config, backend)?;
        self.partitioner.write().add_node(id);
        Ok(())
    }

    /// Remove a node from the pending topology.
    ///
    /// The node stays registered so the next `rebalance` can still read its
    /// keys while migrating them away. Fails when the removal would leave
    /// fewer nodes than the replication factor.
    pub fn remove_node(&self, id: &str) -> Result<()> {
        // Fails for ids that were never registered.
        self.registry.backend(id)?;
        self.partitioner.write().remove_node(id)
    }

    /// Probe a node and restore its health flag on success.
    pub async fn reconnect(&self, id: &str) -> Result<()> {
        self.registry.reconnect(id).await
    }

    /// Every live key across the healthy nodes, deduplicated. Nodes that
    /// cannot enumerate keys are skipped. Backup snapshots start here.
    pub async fn get_keys(&self) -> Vec<String> {
        let mut keys = BTreeSet::new();
        for id in self.registry.healthy_ids() {
            let Ok(backend) = self.registry.backend(&id) else {
                continue;
            };
            match backend.scan_keys().await {
                Ok(node_keys) => keys.extend(node_keys),
                Err(Error::Unsupported { .. }) => {
                    debug!(node_id = %id, "node cannot enumerate keys, skipped")
                }
                Err(e) => warn!(node_id = %id, error = %e, "key scan failed"),
            }
        }
        keys.into_iter().collect()
    }

    /// Re-converge the replicas of `key` on its newest envelope.
    ///
    /// Reads every candidate, picks the most recently written copy and
    /// rewrites it to candidates that were missing it or held an older one.
    /// Returns whether anything was repaired.
    pub async fn repair_key(&self, key: &str) -> Result<bool> {
        let partition = self.partition_for(key);
        let mut observed: Vec<(NodeId, Option<StoredValue>)> = Vec::new();
        for node in partition.candidates() {
            match self.read_envelope(&node, key).await {
                Ok(found) => observed.push((node, found)),
                Err(e) => {
                    debug!(node_id = %node, key = %key, error = %e, "repair read failed");
                }
            }
        }

        let Some(newest) = observed
            .iter()
            .filter_map(|(_, v)| v.as_ref())
            .max_by_key(|v| v.written_at_ms)
            .cloned()
        else {
            return Ok(false);
        };

        // Keep the newest holder's remaining TTL when re-writing laggards.
        let holder = observed
            .iter()
            .find(|(_, v)| {
                v.as_ref()
                    .is_some_and(|v| v.written_at_ms == newest.written_at_ms)
            })
            .map(|(node, _)| node.clone());
        let ttl = match &holder {
            Some(node) => match self.registry.backend(node) {
                Ok(backend) => backend.remaining_ttl(key).await.ok().flatten(),
                Err(_) => None,
            },
            None => None,
        };

        let stored = newest.to_bytes()?;
        let mut repaired = false;
        for (node, value) in &observed {
            let stale = value
                .as_ref()
                .map_or(true, |v| v.written_at_ms < newest.written_at_ms);
            if !stale {
                continue;
            }
            let bytes = stored.clone();
            let outcome = self
                .with_breaker(node, |backend| async move {
                    backend.set(key, bytes, ttl).await
                })
                .await;
            match outcome {
                Ok(()) => {
                    repaired = true;
                    info!(node_id = %node, key = %key, "replica repaired");
                }
                Err(e) => warn!(node_id = %node, key = %key, error = %e, "repair write failed"),
            }
        }
        Ok(repaired)
    }

    /// Stop background tasks and the event bus workers.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut background = self.background.lock().await;
        for handle in background.drain(..) {
            let _ = handle.await;
        }
        self.bus.close().await;
        info!("coordinator stopped");
    }

    fn required_acks(&self) -> usize {
        self.config
            .consistency
            .required_acks(self.config.replication_factor)
    }

    fn authorize(&self, token: Option<&str>, permission: &'static str) -> Result<()> {
        if let Some(token) = token {
            if !self.policy.has_permission(token, permission) {
                return Err(Error::Unauthorized { permission });
            }
        }
        Ok(())
    }

    fn breaker(&self, node: &NodeId) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(node.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(node.clone(), self.config.breaker.clone()))
            })
            .clone()
    }

    async fn with_breaker<T, F, Fut>(&self, node: &NodeId, op: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn Backend>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let backend = self.registry.backend(node)?;
        self.breaker(node).call(|| op(backend)).await
    }

    /// Mark a node down once its breaker has opened.
    fn note_node_failure(&self, node: &NodeId) {
        if self.breaker(node).state() == BreakerState::Open && self.registry.is_healthy(node) {
            self.registry.set_healthy(node, false);
            self.bus
                .publish(CacheEvent::new(EventType::NodeDown).with_node(node.clone()));
        }
    }

    async fn read_envelope(&self, node: &NodeId, key: &str) -> Result<Option<StoredValue>> {
        let raw = self
            .with_breaker(node, |backend| async move { backend.get(key).await })
            .await?;
        match raw {
            Some(bytes) => Ok(Some(StoredValue::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn encode(&self, key: &str, value: &[u8]) -> Result<StoredValue> {
        let (payload, compressed) = maybe_compress(value, self.config.compression_threshold);
        let encrypted = self.cipher.should_encrypt(key, value);
        let payload = if encrypted {
            self.cipher.encrypt(&payload)?
        } else {
            payload
        };
        Ok(StoredValue::new(payload, compressed, encrypted))
    }

    fn decode(&self, envelope: StoredValue) -> Result<Bytes> {
        let payload = if envelope.encrypted {
            self.cipher.decrypt(&envelope.payload)?
        } else {
            envelope.payload
        };
        let payload = if envelope.compressed {
            decompress(&payload)?
        } else {
            payload
        };
        Ok(Bytes::from(payload))
    }

    async fn ping_node(&self, id: &NodeId) -> Result<Duration> {
        let backend = self.registry.backend(id)?;
        let start = Instant::now();
        let timeout = self.config.breaker.operation_timeout;
        match tokio::time::timeout(timeout, backend.ping()).await {
            Ok(Ok(())) => Ok(start.elapsed()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout {
                node: id.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Attempt-scaled delay with uniform jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_delay.as_millis() as u64;
        let scaled = base.saturating_mul(attempt as u64);
        let jitter = if base > 0 {
            rand::thread_rng().gen_range(0..=base / 2)
        } else {
            0
        };
        Duration::from_millis(scaled + jitter)
    }

    /// Publish the error event for `e` and hand it back for propagation.
    fn raise(&self, e: Error, key: Option<&str>) -> Error {
        let mut event = CacheEvent::new(EventType::Error).with_metadata("error", e.to_string());
        if let Some(key) = key {
            event = event.with_key(key);
        }
        self.bus.publish(event);
        e
    }
}
