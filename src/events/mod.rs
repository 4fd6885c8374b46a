//! Priority event bus.
//!
//! Every cache mutation and lifecycle event is published here and consumed by
//! logging, alerting, backup and recovery subscribers. The bus keeps one
//! bounded lane per priority, each drained by a fixed pool of worker tasks.
//! A full lane overflows to the next-lower lane and ultimately to the retry
//! lane, whose entries are replayed after a delay and converted into an
//! `Error` event once their retry budget is spent.

pub mod pattern;

pub use pattern::{PatternCallback, PatternRegistry, PatternSpec};

use crate::config::EventBusConfig;
use crate::types::{now_ms, NodeId, Priority};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, error, warn};

/// Everything the coordinator and its subsystems can announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    // Critical.
    Error,
    NodeDown,
    RecoveryFailed,
    MigrationFailed,
    RebalanceFailed,
    // Operational.
    Warning,
    MigrationStart,
    MigrationComplete,
    RebalanceStart,
    RebalanceComplete,
    RecoveryStart,
    RecoveryComplete,
    Backup,
    Restore,
    ThresholdExceeded,
    Cleanup,
    // Informational.
    Info,
    Get,
    Set,
    Delete,
}

impl EventType {
    /// Priority used when the publisher does not set one explicitly.
    pub fn default_priority(&self) -> Priority {
        match self {
            EventType::Error
            | EventType::NodeDown
            | EventType::RecoveryFailed
            | EventType::MigrationFailed
            | EventType::RebalanceFailed => Priority::High,
            EventType::Warning
            | EventType::MigrationStart
            | EventType::MigrationComplete
            | EventType::RebalanceStart
            | EventType::RebalanceComplete
            | EventType::RecoveryStart
            | EventType::RecoveryComplete
            | EventType::Backup
            | EventType::Restore
            | EventType::ThresholdExceeded
            | EventType::Cleanup => Priority::Medium,
            EventType::Info | EventType::Get | EventType::Set | EventType::Delete => Priority::Low,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventType::Error => "error",
            EventType::NodeDown => "node_down",
            EventType::RecoveryFailed => "recovery_failed",
            EventType::MigrationFailed => "migration_failed",
            EventType::RebalanceFailed => "rebalance_failed",
            EventType::Warning => "warning",
            EventType::MigrationStart => "migration_start",
            EventType::MigrationComplete => "migration_complete",
            EventType::RebalanceStart => "rebalance_start",
            EventType::RebalanceComplete => "rebalance_complete",
            EventType::RecoveryStart => "recovery_start",
            EventType::RecoveryComplete => "recovery_complete",
            EventType::Backup => "backup",
            EventType::Restore => "restore",
            EventType::ThresholdExceeded => "threshold_exceeded",
            EventType::Cleanup => "cleanup",
            EventType::Info => "info",
            EventType::Get => "get",
            EventType::Set => "set",
            EventType::Delete => "delete",
        };
        write!(f, "{name}")
    }
}

/// An immutable published event.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    pub event_type: EventType,
    pub key: Option<String>,
    pub value: Option<Bytes>,
    pub node_id: Option<NodeId>,
    /// Milliseconds since the Unix epoch at publish time.
    pub timestamp_ms: u64,
    pub metadata: HashMap<String, String>,
    pub priority: Priority,
}

impl CacheEvent {
    /// New event with the type's default priority, stamped now.
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            key: None,
            value: None,
            node_id: None,
            timestamp_ms: now_ms(),
            metadata: HashMap::new(),
            priority: event_type.default_priority(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_value(mut self, value: Bytes) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_node(mut self, node_id: impl Into<NodeId>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Subscriber callback. A returned error is recorded in the bus stats and
/// does not stop delivery to other subscribers.
pub type Subscriber = Arc<dyn Fn(&CacheEvent) -> std::result::Result<(), String> + Send + Sync>;

#[derive(Default)]
struct BusCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    failed_callbacks: AtomicU64,
    overflowed: AtomicU64,
    retried: AtomicU64,
    converted_to_error: AtomicU64,
    pattern_matches: AtomicU64,
    by_priority: [AtomicU64; 3],
}

/// Point-in-time view of the bus counters and queue usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub failed_callbacks: u64,
    pub overflowed: u64,
    pub retried: u64,
    pub converted_to_error: u64,
    pub pattern_matches: u64,
    /// Published counts per priority, indexed low/medium/high.
    pub by_priority: [u64; 3],
    /// Queued events per lane, indexed low/medium/high.
    pub queued: [usize; 3],
}

struct BusShared {
    subscribers: RwLock<HashMap<EventType, Vec<Subscriber>>>,
    patterns: PatternRegistry,
    counters: BusCounters,
}

impl BusShared {
    fn dispatch(&self, event: &CacheEvent) {
        let subscribers = self
            .subscribers
            .read()
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();

        for subscriber in &subscribers {
            if let Err(reason) = subscriber(event) {
                self.counters.failed_callbacks.fetch_add(1, Ordering::Relaxed);
                error!(
                    event_type = %event.event_type,
                    reason = %reason,
                    "event subscriber failed"
                );
            }
        }
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);

        let matches = self.patterns.observe(event) as u64;
        if matches > 0 {
            self.counters
                .pattern_matches
                .fetch_add(matches, Ordering::Relaxed);
        }
    }
}

struct RetryEnvelope {
    event: CacheEvent,
    attempts: u32,
}

/// Priority publish/subscribe bus.
pub struct EventBus {
    shared: Arc<BusShared>,
    /// Lane senders indexed low/medium/high.
    lanes: [mpsc::Sender<CacheEvent>; 3],
    retry_tx: mpsc::UnboundedSender<RetryEnvelope>,
    shutdown_tx: watch::Sender<bool>,
    handles: AsyncMutex<Vec<tokio::task::JoinHandle<()>>>,
    queue_capacity: usize,
}

fn lane_index(priority: Priority) -> usize {
    match priority {
        Priority::Low => 0,
        Priority::Medium => 1,
        Priority::High => 2,
    }
}

impl EventBus {
    /// Create the bus and start its worker pools. Must be called from within
    /// a tokio runtime.
    pub fn new(config: EventBusConfig) -> Self {
        let shared = Arc::new(BusShared {
            subscribers: RwLock::new(HashMap::new()),
            patterns: PatternRegistry::new(),
            counters: BusCounters::default(),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();
        let mut lanes: Vec<mpsc::Sender<CacheEvent>> = Vec::with_capacity(3);

        for _lane in 0..3 {
            let (tx, rx) = mpsc::channel::<CacheEvent>(config.queue_capacity);
            let rx = Arc::new(AsyncMutex::new(rx));
            for _ in 0..config.workers_per_lane.max(1) {
                let rx = rx.clone();
                let shared = shared.clone();
                let mut shutdown = shutdown_rx.clone();
                handles.push(tokio::spawn(async move {
                    loop {
                        let event = tokio::select! {
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    break;
                                }
                                continue;
                            }
                            event = async { rx.lock().await.recv().await } => match event {
                                Some(e) => e,
                                None => break,
                            },
                        };
                        shared.dispatch(&event);
                    }
                }));
            }
            lanes.push(tx);
        }

        let (retry_tx, mut retry_rx) = mpsc::unbounded_channel::<RetryEnvelope>();
        {
            let shared = shared.clone();
            let requeue = retry_tx.clone();
            let lanes: [mpsc::Sender<CacheEvent>; 3] = [
                lanes[0].clone(),
                lanes[1].clone(),
                lanes[2].clone(),
            ];
            let mut shutdown = shutdown_rx.clone();
            let max_retries = config.max_retries;
            let retry_delay = config.retry_delay;
            handles.push(tokio::spawn(async move {
                loop {
                    let envelope = tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                            continue;
                        }
                        envelope = retry_rx.recv() => match envelope {
                            Some(e) => e,
                            None => break,
                        },
                    };

                    if envelope.attempts >= max_retries {
                        // Budget spent: surface as a high-priority error.
                        shared
                            .counters
                            .converted_to_error
                            .fetch_add(1, Ordering::Relaxed);
                        warn!(
                            event_type = %envelope.event.event_type,
                            attempts = envelope.attempts,
                            "event retry budget spent, converting to error"
                        );
                        let error_event = CacheEvent::new(EventType::Error)
                            .with_metadata("original_type", envelope.event.event_type.to_string())
                            .with_metadata("reason", "event retry budget exceeded");
                        shared.dispatch(&error_event);
                        continue;
                    }

                    tokio::time::sleep(retry_delay).await;
                    shared.counters.retried.fetch_add(1, Ordering::Relaxed);

                    let lane = &lanes[lane_index(envelope.event.priority)];
                    if let Err(
                        mpsc::error::TrySendError::Full(event)
                        | mpsc::error::TrySendError::Closed(event),
                    ) = lane.try_send(envelope.event)
                    {
                        // Still congested; goes around again with one fewer
                        // attempt left.
                        let _ = requeue.send(RetryEnvelope {
                            event,
                            attempts: envelope.attempts + 1,
                        });
                    }
                }
            }));
        }

        Self {
            shared,
            lanes: [lanes[0].clone(), lanes[1].clone(), lanes[2].clone()],
            retry_tx,
            shutdown_tx,
            handles: AsyncMutex::new(handles),
            queue_capacity: config.queue_capacity,
        }
    }

    /// Register a callback for one event type.
    pub fn subscribe<F>(&self, event_type: EventType, callback: F)
    where
        F: Fn(&CacheEvent) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.shared
            .subscribers
            .write()
            .entry(event_type)
            .or_default()
            .push(Arc::new(callback));
    }

    /// Number of subscribers, optionally for one type.
    pub fn subscriber_count(&self, event_type: Option<EventType>) -> usize {
        let subscribers = self.shared.subscribers.read();
        match event_type {
            Some(t) => subscribers.get(&t).map(|v| v.len()).unwrap_or(0),
            None => subscribers.values().map(|v| v.len()).sum(),
        }
    }

    /// Register a composite pattern.
    pub fn add_pattern(&self, name: impl Into<String>, spec: PatternSpec, callback: PatternCallback) {
        self.shared.patterns.add(name, spec, callback);
    }

    /// Remove a composite pattern.
    pub fn remove_pattern(&self, name: &str) {
        self.shared.patterns.remove(name);
    }

    /// Publish an event.
    ///
    /// Never blocks: a full lane cascades to the next-lower lane, and the
    /// retry lane absorbs whatever the bounded lanes cannot.
    pub fn publish(&self, event: CacheEvent) {
        let counters = &self.shared.counters;
        counters.published.fetch_add(1, Ordering::Relaxed);
        counters.by_priority[lane_index(event.priority)].fetch_add(1, Ordering::Relaxed);
        debug!(event_type = %event.event_type, priority = %event.priority, "event published");

        let start = lane_index(event.priority);
        let mut event = event;
        // Cascade downwards through the lanes at or below the event's own.
        for lane in (0..=start).rev() {
            match self.lanes[lane].try_send(event) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(e))
                | Err(mpsc::error::TrySendError::Closed(e)) => {
                    event = e;
                }
            }
        }

        counters.overflowed.fetch_add(1, Ordering::Relaxed);
        let _ = self.retry_tx.send(RetryEnvelope { event, attempts: 0 });
    }

    /// Counter and queue snapshot.
    pub fn stats(&self) -> BusStats {
        let c = &self.shared.counters;
        BusStats {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            failed_callbacks: c.failed_callbacks.load(Ordering::Relaxed),
            overflowed: c.overflowed.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            converted_to_error: c.converted_to_error.load(Ordering::Relaxed),
            pattern_matches: c.pattern_matches.load(Ordering::Relaxed),
            by_priority: [
                c.by_priority[0].load(Ordering::Relaxed),
                c.by_priority[1].load(Ordering::Relaxed),
                c.by_priority[2].load(Ordering::Relaxed),
            ],
            queued: [
                self.queue_capacity - self.lanes[0].capacity(),
                self.queue_capacity - self.lanes[1].capacity(),
                self.queue_capacity - self.lanes[2].capacity(),
            ],
        }
    }

    /// Stop the worker pools and wait for them to exit. Queued events that
    /// were not yet dispatched are dropped.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn small_bus() -> EventBus {
        EventBus::new(EventBusConfig {
            queue_capacity: 16,
            workers_per_lane: 1,
            max_retries: 2,
            retry_delay: Duration::from_millis(10),
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = small_bus();
        let seen = Arc::new(AtomicUsize::new(0));
        let inner = seen.clone();
        bus.subscribe(EventType::Set, move |event| {
            assert_eq!(event.key.as_deref(), Some("k1"));
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.publish(CacheEvent::new(EventType::Set).with_key("k1"));
        settle().await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        let stats = bus.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.delivered, 1);
        bus.close().await;
    }

    #[tokio::test]
    async fn test_failing_subscriber_does_not_block_others() {
        let bus = small_bus();
        let seen = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventType::Error, |_| Err("boom".into()));
        let inner = seen.clone();
        bus.subscribe(EventType::Error, move |_| {
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.publish(CacheEvent::new(EventType::Error));
        settle().await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().failed_callbacks, 1);
        bus.close().await;
    }

    #[tokio::test]
    async fn test_priority_inference() {
        let event = CacheEvent::new(EventType::NodeDown);
        assert_eq!(event.priority, Priority::High);
        let event = CacheEvent::new(EventType::Cleanup);
        assert_eq!(event.priority, Priority::Medium);
        let event = CacheEvent::new(EventType::Get);
        assert_eq!(event.priority, Priority::Low);
        let event = CacheEvent::new(EventType::Get).with_priority(Priority::High);
        assert_eq!(event.priority, Priority::High);
    }

    #[tokio::test]
    async fn test_subscriber_count() {
        let bus = small_bus();
        bus.subscribe(EventType::Set, |_| Ok(()));
        bus.subscribe(EventType::Set, |_| Ok(()));
        bus.subscribe(EventType::Delete, |_| Ok(()));

        assert_eq!(bus.subscriber_count(Some(EventType::Set)), 2);
        assert_eq!(bus.subscriber_count(None), 3);
        bus.close().await;
    }

    #[tokio::test]
    async fn test_pattern_fires_through_bus() {
        let bus = small_bus();
        let matched = Arc::new(AtomicUsize::new(0));
        let inner = matched.clone();
        bus.add_pattern(
            "set-then-delete",
            PatternSpec {
                types: vec![EventType::Set, EventType::Delete],
                window: Duration::from_secs(5),
                ordered: true,
                metadata_match: None,
            },
            Arc::new(move |events| {
                assert_eq!(events.len(), 2);
                inner.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.publish(CacheEvent::new(EventType::Set).with_key("k"));
        settle().await;
        bus.publish(CacheEvent::new(EventType::Delete).with_key("k"));
        settle().await;

        assert_eq!(matched.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().pattern_matches, 1);
        bus.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_full_lanes_cascade_downward_and_replay() {
        let bus = EventBus::new(EventBusConfig {
            queue_capacity: 1,
            workers_per_lane: 1,
            max_retries: 50,
            retry_delay: Duration::from_millis(5),
        });
        let seen = Arc::new(AtomicUsize::new(0));
        let inner = seen.clone();
        bus.subscribe(EventType::NodeDown, move |_| {
            // Hold the worker long enough for every lane to back up.
            std::thread::sleep(Duration::from_millis(20));
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        // Eight high-priority events against three one-slot lanes: some land
        // in lower lanes, the rest overflow to the retry lane and replay.
        for _ in 0..8 {
            bus.publish(CacheEvent::new(EventType::NodeDown));
        }
        tokio::time::sleep(Duration::from_millis(800)).await;

        let stats = bus.stats();
        assert_eq!(seen.load(Ordering::SeqCst), 8);
        assert_eq!(stats.delivered, 8);
        assert!(stats.overflowed >= 1);
        assert!(stats.retried >= 1);
        assert_eq!(stats.converted_to_error, 0);
        bus.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_retry_budget_exhaustion_becomes_error_event() {
        let bus = EventBus::new(EventBusConfig {
            queue_capacity: 1,
            workers_per_lane: 1,
            max_retries: 1,
            retry_delay: Duration::from_millis(5),
        });
        let errors = Arc::new(AtomicUsize::new(0));
        let inner = errors.clone();
        bus.subscribe(EventType::Error, move |event| {
            assert_eq!(
                event.metadata.get("original_type").map(String::as_str),
                Some("get")
            );
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.subscribe(EventType::Get, |_| {
            // Pin the only low-lane worker so replays keep finding the lane full.
            std::thread::sleep(Duration::from_millis(150));
            Ok(())
        });

        // Low-priority events have no lower lane to cascade into; with the
        // lane pinned, the overflowed ones burn their retry budget.
        for _ in 0..4 {
            bus.publish(CacheEvent::new(EventType::Get));
        }
        tokio::time::sleep(Duration::from_millis(700)).await;

        let stats = bus.stats();
        assert!(stats.overflowed >= 2);
        assert!(stats.retried >= 1);
        assert!(stats.converted_to_error >= 1);
        assert!(errors.load(Ordering::SeqCst) >= 1);
        bus.close().await;
    }

    #[tokio::test]
    async fn test_stats_track_priorities() {
        let bus = small_bus();
        bus.publish(CacheEvent::new(EventType::Get));
        bus.publish(CacheEvent::new(EventType::Cleanup));
        bus.publish(CacheEvent::new(EventType::Error));
        settle().await;

        let stats = bus.stats();
        assert_eq!(stats.by_priority, [1, 1, 1]);
        assert_eq!(stats.delivered, 3);
        bus.close().await;
    }
}
