//! Key migration between nodes.
//!
//! A rebalance produces a movement plan (`source -> [targets]`). The manager
//! turns the plan into one task per source/target pair, enumerating the
//! source's keys up front, and copies them in fixed-size batches under a
//! bounded worker pool. Remaining TTLs travel with the values. A key that
//! fails to copy is logged and skipped; the task then finishes `Failed` while
//! the other batches still run to completion. Tasks from the previous plan
//! are kept for inspection until the next plan supersedes them.

use crate::config::MigrationConfig;
use crate::error::{Error, Result};
use crate::events::{CacheEvent, EventBus, EventType};
use crate::hooks::MetricsSink;
use crate::node::NodeRegistry;
use crate::partition::MovementPlan;
use crate::types::NodeId;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationStatus::Pending => write!(f, "pending"),
            MigrationStatus::InProgress => write!(f, "in_progress"),
            MigrationStatus::Completed => write!(f, "completed"),
            MigrationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One source/target copy job.
#[derive(Debug, Clone)]
pub struct MigrationTask {
    pub id: String,
    pub source: NodeId,
    pub target: NodeId,
    pub keys: Vec<String>,
    pub status: MigrationStatus,
    /// `migrated / total`, updated after each batch.
    pub progress: f64,
    pub error: Option<String>,
}

impl MigrationTask {
    fn new(source: NodeId, target: NodeId, keys: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source,
            target,
            keys,
            status: MigrationStatus::Pending,
            progress: 0.0,
            error: None,
        }
    }
}

/// Executes movement plans.
pub struct MigrationManager {
    config: MigrationConfig,
    registry: Arc<NodeRegistry>,
    bus: Arc<EventBus>,
    metrics: Arc<dyn MetricsSink>,
    tasks: RwLock<Vec<Arc<Mutex<MigrationTask>>>>,
}

impl MigrationManager {
    pub fn new(
        config: MigrationConfig,
        registry: Arc<NodeRegistry>,
        bus: Arc<EventBus>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            config,
            registry,
            bus,
            metrics,
            tasks: RwLock::new(Vec::new()),
        }
    }

    /// Snapshot of the current plan's tasks.
    pub fn tasks(&self) -> Vec<MigrationTask> {
        self.tasks.read().iter().map(|t| t.lock().clone()).collect()
    }

    /// Execute `plan`, superseding any previous task set.
    ///
    /// Returns an error if any task finished `Failed`. An empty plan is a
    /// no-op and leaves no tasks behind.
    pub async fn execute(&self, plan: &MovementPlan) -> Result<()> {
        let tasks = self.build_tasks(plan).await;
        *self.tasks.write() = tasks.clone();
        if tasks.is_empty() {
            return Ok(());
        }

        let total_keys: usize = tasks.iter().map(|t| t.lock().keys.len()).sum();
        info!(tasks = tasks.len(), total_keys, "migration started");
        self.bus.publish(
            CacheEvent::new(EventType::MigrationStart)
                .with_metadata("tasks", tasks.len().to_string())
                .with_metadata("keys", total_keys.to_string()),
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut handles = Vec::with_capacity(tasks.len());
        for task in &tasks {
            let task = task.clone();
            let registry = self.registry.clone();
            let semaphore = semaphore.clone();
            let batch_size = self.config.batch_size.max(1);
            handles.push(tokio::spawn(async move {
                // Semaphore is never closed while tasks run.
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                run_task(&task, &registry, batch_size).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        let failed: Vec<String> = tasks
            .iter()
            .filter_map(|t| {
                let t = t.lock();
                (t.status == MigrationStatus::Failed)
                    .then(|| format!("{} -> {}: {}", t.source, t.target, t.error.as_deref().unwrap_or("unknown")))
            })
            .collect();

        if failed.is_empty() {
            self.metrics.record_migration(true);
            self.bus.publish(
                CacheEvent::new(EventType::MigrationComplete)
                    .with_metadata("tasks", tasks.len().to_string()),
            );
            info!(tasks = tasks.len(), "migration completed");
            Ok(())
        } else {
            self.metrics.record_migration(false);
            let reason = failed.join("; ");
            self.bus.publish(
                CacheEvent::new(EventType::MigrationFailed).with_metadata("reason", reason.clone()),
            );
            Err(Error::Migration(reason))
        }
    }

    /// One task per source/target pair over the source's current keys.
    ///
    /// Sources that cannot enumerate keys are skipped: their entries cannot
    /// be copied and will simply refill on the new owners as cache misses.
    async fn build_tasks(&self, plan: &MovementPlan) -> Vec<Arc<Mutex<MigrationTask>>> {
        let mut tasks = Vec::new();
        for (source, targets) in plan {
            let keys = match self.registry.backend(source) {
                Ok(backend) => match backend.scan_keys().await {
                    Ok(keys) => keys,
                    Err(Error::Unsupported { kind, .. }) => {
                        warn!(
                            node_id = %source,
                            kind = %kind,
                            "source cannot enumerate keys, its entries will refill on miss"
                        );
                        continue;
                    }
                    Err(e) => {
                        warn!(node_id = %source, error = %e, "source key scan failed");
                        continue;
                    }
                },
                Err(e) => {
                    warn!(node_id = %source, error = %e, "unknown migration source");
                    continue;
                }
            };
            if keys.is_empty() {
                continue;
            }
            for target in targets {
                tasks.push(Arc::new(Mutex::new(MigrationTask::new(
                    source.clone(),
                    target.clone(),
                    keys.clone(),
                ))));
            }
        }
        tasks
    }
}

async fn run_task(task: &Arc<Mutex<MigrationTask>>, registry: &NodeRegistry, batch_size: usize) {
    let (id, source, target, keys) = {
        let mut t = task.lock();
        t.status = MigrationStatus::InProgress;
        (t.id.clone(), t.source.clone(), t.target.clone(), t.keys.clone())
    };
    debug!(task_id = %id, source = %source, target = %target, keys = keys.len(), "task started");

    let (source_backend, target_backend) = match (registry.backend(&source), registry.backend(&target)) {
        (Ok(s), Ok(t)) => (s, t),
        _ => {
            let mut t = task.lock();
            t.status = MigrationStatus::Failed;
            t.error = Some("source or target not registered".into());
            return;
        }
    };

    let total = keys.len();
    let mut migrated = 0usize;
    let mut failures = 0usize;

    for batch in keys.chunks(batch_size) {
        for key in batch {
            let value = match source_backend.get(key).await {
                Ok(Some(value)) => value,
                Ok(None) => {
                    // Expired or deleted since the scan; nothing to move.
                    migrated += 1;
                    continue;
                }
                Err(e) => {
                    warn!(task_id = %id, key = %key, error = %e, "source read failed");
                    failures += 1;
                    continue;
                }
            };
            let ttl = source_backend.remaining_ttl(key).await.ok().flatten();
            match target_backend.set(key, value, ttl).await {
                Ok(()) => migrated += 1,
                Err(e) => {
                    warn!(task_id = %id, key = %key, error = %e, "target write failed");
                    failures += 1;
                }
            }
        }
        let mut t = task.lock();
        t.progress = (migrated + failures) as f64 / total as f64;
    }

    let mut t = task.lock();
    t.progress = 1.0;
    if failures == 0 {
        t.status = MigrationStatus::Completed;
        debug!(task_id = %id, migrated, "task completed");
    } else {
        t.status = MigrationStatus::Failed;
        t.error = Some(format!("{failures} of {total} keys failed to copy"));
        warn!(task_id = %id, failures, total, "task failed");
    }
}
