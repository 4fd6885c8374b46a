//! Composite event patterns.
//!
//! A pattern names a sequence of event types that must all occur within a
//! time window, optionally in order and optionally with matching metadata.
//! Each pattern is a small state machine keyed by a monotonic clock: events
//! accumulate in the current window until the sequence is satisfied or the
//! window expires, and a fresh window opens either way.

use super::CacheEvent;
use crate::events::EventType;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Callback invoked with the events that completed a pattern window.
pub type PatternCallback = std::sync::Arc<dyn Fn(&[CacheEvent]) + Send + Sync>;

/// Specification of a composite pattern.
#[derive(Debug, Clone)]
pub struct PatternSpec {
    /// Event types that must all occur.
    pub types: Vec<EventType>,
    /// Window within which the whole sequence must complete.
    pub window: Duration,
    /// Whether the types must arrive in the listed order.
    pub ordered: bool,
    /// Metadata entries every matched event must carry.
    pub metadata_match: Option<HashMap<String, String>>,
}

struct PatternState {
    spec: PatternSpec,
    callback: PatternCallback,
    matched: Vec<CacheEvent>,
    window_start: Instant,
}

impl PatternState {
    fn reset(&mut self, now: Instant) {
        self.matched.clear();
        self.window_start = now;
    }

    /// Whether `event` advances this pattern's current window.
    fn accepts(&self, event: &CacheEvent) -> bool {
        if !self.spec.types.contains(&event.event_type) {
            return false;
        }
        if self.spec.ordered {
            match self.spec.types.get(self.matched.len()) {
                Some(expected) if *expected == event.event_type => {}
                _ => return false,
            }
        } else if self
            .matched
            .iter()
            .any(|m| m.event_type == event.event_type)
        {
            // Unordered patterns need each type once.
            return false;
        }
        if let Some(required) = &self.spec.metadata_match {
            for (k, v) in required {
                if event.metadata.get(k) != Some(v) {
                    return false;
                }
            }
        }
        true
    }

    fn is_complete(&self) -> bool {
        self.matched.len() == self.spec.types.len()
    }
}

/// Registry of active patterns, driven by the event bus workers.
#[derive(Default)]
pub struct PatternRegistry {
    patterns: Mutex<HashMap<String, PatternState>>,
}

impl PatternRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pattern under `name`, replacing any previous registration.
    pub fn add(&self, name: impl Into<String>, spec: PatternSpec, callback: PatternCallback) {
        let name = name.into();
        debug!(pattern = %name, types = spec.types.len(), "pattern registered");
        self.patterns.lock().insert(
            name,
            PatternState {
                spec,
                callback,
                matched: Vec::new(),
                window_start: Instant::now(),
            },
        );
    }

    /// Remove a pattern.
    pub fn remove(&self, name: &str) {
        self.patterns.lock().remove(name);
    }

    /// Number of registered patterns.
    pub fn len(&self) -> usize {
        self.patterns.lock().len()
    }

    /// Whether no patterns are registered.
    pub fn is_empty(&self) -> bool {
        self.patterns.lock().is_empty()
    }

    /// Feed one delivered event through every pattern state machine and fire
    /// callbacks for completed windows. Returns the number of matches.
    pub fn observe(&self, event: &CacheEvent) -> usize {
        let now = Instant::now();
        let mut completed: Vec<(Vec<CacheEvent>, PatternCallback)> = Vec::new();

        {
            let mut patterns = self.patterns.lock();
            for (name, state) in patterns.iter_mut() {
                if now.duration_since(state.window_start) > state.spec.window {
                    state.reset(now);
                }
                if state.accepts(event) {
                    state.matched.push(event.clone());
                    if state.is_complete() {
                        debug!(pattern = %name, "pattern matched");
                        completed.push((
                            std::mem::take(&mut state.matched),
                            state.callback.clone(),
                        ));
                        state.reset(now);
                    }
                }
            }
        }

        // Callbacks run outside the registry lock.
        let matches = completed.len();
        for (events, callback) in completed {
            let guard = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(&events);
            }));
            if guard.is_err() {
                error!("pattern callback panicked");
            }
        }
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn event(event_type: EventType) -> CacheEvent {
        CacheEvent::new(event_type)
    }

    fn counting_callback() -> (PatternCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        (
            Arc::new(move |_events: &[CacheEvent]| {
                inner.fetch_add(1, Ordering::SeqCst);
            }),
            count,
        )
    }

    #[test]
    fn test_ordered_pattern_matches_in_order() {
        let registry = PatternRegistry::new();
        let (cb, count) = counting_callback();
        registry.add(
            "down-then-recovered",
            PatternSpec {
                types: vec![EventType::NodeDown, EventType::RecoveryComplete],
                window: Duration::from_secs(10),
                ordered: true,
                metadata_match: None,
            },
            cb,
        );

        registry.observe(&event(EventType::NodeDown));
        registry.observe(&event(EventType::RecoveryComplete));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ordered_pattern_rejects_wrong_order() {
        let registry = PatternRegistry::new();
        let (cb, count) = counting_callback();
        registry.add(
            "p",
            PatternSpec {
                types: vec![EventType::NodeDown, EventType::RecoveryComplete],
                window: Duration::from_secs(10),
                ordered: true,
                metadata_match: None,
            },
            cb,
        );

        registry.observe(&event(EventType::RecoveryComplete));
        registry.observe(&event(EventType::NodeDown));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unordered_pattern_any_order() {
        let registry = PatternRegistry::new();
        let (cb, count) = counting_callback();
        registry.add(
            "p",
            PatternSpec {
                types: vec![EventType::Set, EventType::Delete],
                window: Duration::from_secs(10),
                ordered: false,
                metadata_match: None,
            },
            cb,
        );

        registry.observe(&event(EventType::Delete));
        registry.observe(&event(EventType::Set));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_metadata_match_filters() {
        let registry = PatternRegistry::new();
        let (cb, count) = counting_callback();
        let mut required = HashMap::new();
        required.insert("node".to_string(), "redis-1".to_string());
        registry.add(
            "p",
            PatternSpec {
                types: vec![EventType::Error],
                window: Duration::from_secs(10),
                ordered: true,
                metadata_match: Some(required),
            },
            cb,
        );

        registry.observe(&event(EventType::Error));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        let matching = event(EventType::Error).with_metadata("node", "redis-1");
        registry.observe(&matching);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // A new window opened after the match.
        let _ = event(EventType::Error);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_expired_window_resets() {
        let registry = PatternRegistry::new();
        let (cb, count) = counting_callback();
        registry.add(
            "p",
            PatternSpec {
                types: vec![EventType::NodeDown, EventType::RecoveryComplete],
                window: Duration::from_millis(10),
                ordered: true,
                metadata_match: None,
            },
            cb,
        );

        registry.observe(&event(EventType::NodeDown));
        std::thread::sleep(Duration::from_millis(30));
        // Window expired; the second half alone must not complete it.
        registry.observe(&event(EventType::RecoveryComplete));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
