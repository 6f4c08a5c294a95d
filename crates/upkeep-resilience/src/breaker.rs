//! ---
//! upkeep_section: "07-resilience-fault-tolerance"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Retry engine with error classification and circuit breaking."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default)]
struct BreakerState {
    failure_count: u32,
    opened_at: Option<Instant>,
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerSnapshot {
    /// Operation name the breaker guards.
    pub operation: String,
    /// Terminal failures counted since the last success or reset.
    pub failure_count: u32,
    /// Whether calls are currently suppressed.
    pub open: bool,
    /// Seconds until the breaker closes on its own, when open.
    pub remaining_cooldown_secs: Option<f64>,
}

/// Per-operation circuit breakers.
///
/// State is process-local. A breaker opens once its failure count reaches the
/// threshold and closes again on the first check after `timeout` has elapsed.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    threshold: u32,
    timeout: Duration,
    states: Mutex<HashMap<String, BreakerState>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry with a shared threshold and cool-down.
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            timeout,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Whether calls for `operation` must be suppressed right now.
    pub fn is_open(&self, operation: &str) -> bool {
        let mut states = self.states.lock();
        let Some(state) = states.get(operation) else {
            return false;
        };
        match state.opened_at {
            Some(opened_at) if opened_at.elapsed() >= self.timeout => {
                states.remove(operation);
                info!(operation, "circuit breaker cool-down elapsed; closing");
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Count one terminal failure. Returns whether the breaker is now open.
    pub fn record_failure(&self, operation: &str) -> bool {
        let mut states = self.states.lock();
        let state = states.entry(operation.to_owned()).or_default();
        state.failure_count = state.failure_count.saturating_add(1);
        if state.failure_count >= self.threshold && state.opened_at.is_none() {
            state.opened_at = Some(Instant::now());
            warn!(
                operation,
                failures = state.failure_count,
                cooldown_secs = self.timeout.as_secs_f64(),
                "circuit breaker opened"
            );
        }
        state.opened_at.is_some()
    }

    /// Clear the failure count after a success.
    pub fn record_success(&self, operation: &str) {
        self.states.lock().remove(operation);
    }

    /// Force the breaker closed. Returns whether any state existed.
    pub fn reset(&self, operation: &str) -> bool {
        self.states.lock().remove(operation).is_some()
    }

    /// Snapshot of every tracked breaker, sorted by operation name.
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let states = self.states.lock();
        let mut snapshots: Vec<_> = states
            .iter()
            .map(|(operation, state)| {
                let remaining = state.opened_at.map(|opened_at| {
                    self.timeout
                        .saturating_sub(opened_at.elapsed())
                        .as_secs_f64()
                });
                CircuitBreakerSnapshot {
                    operation: operation.clone(),
                    failure_count: state.failure_count,
                    open: state.opened_at.is_some(),
                    remaining_cooldown_secs: remaining,
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.operation.cmp(&b.operation));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn opens_at_threshold_and_closes_after_timeout() {
        let registry = CircuitBreakerRegistry::new(2, Duration::from_secs(60));
        assert!(!registry.record_failure("sync"));
        assert!(!registry.is_open("sync"));
        assert!(registry.record_failure("sync"));
        assert!(registry.is_open("sync"));
        assert!(!registry.is_open("other"));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(registry.is_open("sync"));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!registry.is_open("sync"));
        assert!(registry.snapshots().is_empty());
    }

    #[test]
    fn success_and_reset_clear_state() {
        let registry = CircuitBreakerRegistry::new(3, Duration::from_secs(60));
        registry.record_failure("a");
        registry.record_success("a");
        assert!(registry.snapshots().is_empty());

        registry.record_failure("b");
        assert!(registry.reset("b"));
        assert!(!registry.reset("b"));
    }
}
