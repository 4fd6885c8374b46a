//! Per-node circuit breaker.
//!
//! Every operation sent to a node passes through that node's breaker. The
//! breaker counts consecutive failures, opens after a threshold, probes again
//! after a cool-down, and bounds every call with the configured operation
//! timeout. While open, calls fail fast without touching the node; the
//! coordinator treats that as a failed replica and moves on.

use crate::config::BreakerConfig;
use crate::error::{Error, Result};
use crate::types::NodeId;
use parking_lot::Mutex;
use std::future::Future;
use std::time::Instant;
use tracing::{info, warn};

/// Breaker state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation.
    Closed,
    /// Failing; calls are rejected without reaching the node.
    Open,
    /// Probing recovery; the next call decides.
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: u32,
    last_failure: Option<Instant>,
    half_open_since: Option<Instant>,
}

/// Failure-isolation state machine for one node.
pub struct CircuitBreaker {
    node: NodeId,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker for the given node.
    pub fn new(node: NodeId, config: BreakerConfig) -> Self {
        Self {
            node,
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                last_failure: None,
                half_open_since: None,
            }),
        }
    }

    /// Current state. Timed transitions advance on the next call, not here.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Consecutive failure count.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failures
    }

    /// Run `op` under the breaker.
    ///
    /// Rejected immediately with a connection error while open; otherwise the
    /// call is bounded by the operation timeout, and the outcome feeds the
    /// state machine. A timed-out call counts as a failure.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.admit() {
            return Err(Error::Connection {
                node: self.node.clone(),
                reason: "circuit open".into(),
            });
        }

        let timeout = self.config.operation_timeout;
        let outcome = match tokio::time::timeout(timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                node: self.node.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        match outcome {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    /// Decide whether a call may proceed, advancing timed transitions.
    fn admit(&self) -> bool {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| now.duration_since(t))
                    .unwrap_or(self.config.reset_timeout);
                if elapsed >= self.config.reset_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_since = Some(now);
                    info!(node_id = %self.node, "circuit breaker half-open");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                let expired = inner
                    .half_open_since
                    .map(|t| now.duration_since(t) >= self.config.half_open_timeout)
                    .unwrap_or(false);
                if expired {
                    inner.state = BreakerState::Open;
                    inner.last_failure = Some(now);
                    inner.half_open_since = None;
                    warn!(node_id = %self.node, "circuit breaker re-opened, probe window expired");
                    false
                } else {
                    true
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            info!(node_id = %self.node, "circuit breaker closed");
        }
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.last_failure = None;
        inner.half_open_since = None;
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failures += 1;
        inner.last_failure = Some(Instant::now());

        let trip = inner.failures >= self.config.failure_threshold
            || inner.state == BreakerState::HalfOpen;
        if trip && inner.state != BreakerState::Open {
            inner.state = BreakerState::Open;
            inner.half_open_since = None;
            warn!(
                node_id = %self.node,
                failures = inner.failures,
                "circuit breaker opened"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(50),
            half_open_timeout: Duration::from_millis(50),
            operation_timeout: Duration::from_millis(100),
        }
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("redis-1".into(), fast_config())
    }

    async fn fail(b: &CircuitBreaker) {
        let _ = b
            .call(|| async {
                Err::<(), _>(Error::Connection {
                    node: "redis-1".into(),
                    reason: "refused".into(),
                })
            })
            .await;
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let b = breaker();
        assert_eq!(b.state(), BreakerState::Closed);

        fail(&b).await;
        fail(&b).await;
        assert_eq!(b.state(), BreakerState::Closed);
        fail(&b).await;
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_open_rejects_without_calling() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await;
        }

        let calls = AtomicU32::new(0);
        let result = b
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_half_open_then_closed_on_success() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await;
        }
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        b.call(|| async { Ok(()) }).await.unwrap();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        fail(&b).await;
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_half_open_window_expiry_reopens() {
        let b = Arc::new(CircuitBreaker::new(
            "redis-1".into(),
            BreakerConfig {
                failure_threshold: 3,
                reset_timeout: Duration::from_millis(50),
                half_open_timeout: Duration::from_millis(50),
                operation_timeout: Duration::from_secs(1),
            },
        ));
        for _ in 0..3 {
            fail(&b).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        // The first call after the cool-down flips the breaker half-open and
        // stays in flight longer than the window allows.
        let slow = b.clone();
        let in_flight = tokio::spawn(async move {
            let _ = slow
                .call(|| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Err::<(), _>(Error::Connection {
                        node: "redis-1".into(),
                        reason: "refused".into(),
                    })
                })
                .await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);

        // Window spent without a success: the next call is rejected and the
        // breaker is open again.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let result = b.call(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(Error::Connection { .. })));
        assert_eq!(b.state(), BreakerState::Open);
        in_flight.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let b = breaker();
        let result = b
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(b.failure_count(), 1);
    }
}
