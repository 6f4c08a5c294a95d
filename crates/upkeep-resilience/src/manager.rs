//! ---
//! upkeep_section: "07-resilience-fault-tolerance"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Retry engine with error classification and circuit breaking."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_with::{serde_as, DurationSecondsWithFrac};
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};
use upkeep_common::{RecoveryConfig, ShutdownFlag};
use upkeep_metrics::RecoveryMetrics;

use crate::backoff::BackoffPolicy;
use crate::breaker::{CircuitBreakerRegistry, CircuitBreakerSnapshot};
use crate::classify::{ErrorClassifier, ErrorSeverity, RecoveryStrategy};

const TARGET: &str = "upkeep::resilience::recovery";

/// Record of one invocation inside a recovery loop.
#[serde_as]
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryAttempt {
    /// 1-indexed attempt number.
    pub attempt: u32,
    /// Strategy chosen for the failure, `None` on success.
    pub strategy: Option<RecoveryStrategy>,
    /// Severity assigned to the failure, `None` on success.
    pub severity: Option<ErrorSeverity>,
    /// Delay slept after this attempt.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub delay: Duration,
    /// Whether the invocation succeeded.
    pub success: bool,
    /// Rendered error chain on failure.
    pub error: Option<String>,
    /// Wall-clock time the attempt finished.
    pub finished_at: DateTime<Utc>,
}

/// Aggregate outcome of [`ErrorRecoveryManager::execute_with_recovery`].
#[derive(Debug, Clone)]
pub struct RecoveryResult<T> {
    /// Operation name used for the breaker and history.
    pub operation: String,
    /// Whether some attempt succeeded.
    pub success: bool,
    /// Value returned by the successful attempt.
    pub value: Option<T>,
    /// Every attempt in order.
    pub attempts: Vec<RecoveryAttempt>,
    /// Error that ended the loop, when unsuccessful.
    pub final_error: Option<String>,
    /// The loop never ran because the breaker was open.
    pub circuit_open: bool,
    /// An abort strategy ended the loop early.
    pub aborted: bool,
    /// A skip strategy ended the loop early.
    pub skipped: bool,
    /// A shutdown request interrupted a backoff sleep.
    pub cancelled: bool,
    /// Elapsed time across all attempts and delays.
    pub total_duration: Duration,
}

impl<T> RecoveryResult<T> {
    fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_owned(),
            success: false,
            value: None,
            attempts: Vec::new(),
            final_error: None,
            circuit_open: false,
            aborted: false,
            skipped: false,
            cancelled: false,
            total_duration: Duration::ZERO,
        }
    }

    /// Serialisable view without the returned value.
    pub fn summary(&self) -> RecoverySummary {
        RecoverySummary {
            operation: self.operation.clone(),
            success: self.success,
            attempts: self.attempts.clone(),
            final_error: self.final_error.clone(),
            circuit_open: self.circuit_open,
            aborted: self.aborted,
            skipped: self.skipped,
            cancelled: self.cancelled,
            total_duration: self.total_duration,
        }
    }
}

/// [`RecoveryResult`] without the value, for reports.
#[serde_as]
#[derive(Debug, Clone, Serialize)]
pub struct RecoverySummary {
    /// Operation name.
    pub operation: String,
    /// Whether some attempt succeeded.
    pub success: bool,
    /// Every attempt in order.
    pub attempts: Vec<RecoveryAttempt>,
    /// Error that ended the loop.
    pub final_error: Option<String>,
    /// Breaker was open.
    pub circuit_open: bool,
    /// Abort strategy ended the loop.
    pub aborted: bool,
    /// Skip strategy ended the loop.
    pub skipped: bool,
    /// Interrupted by shutdown.
    pub cancelled: bool,
    /// Elapsed time.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub total_duration: Duration,
}

/// One entry of the rolling error history.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// When the failure was observed.
    pub at: DateTime<Utc>,
    /// Operation name.
    pub operation: String,
    /// Attempt number that failed.
    pub attempt: u32,
    /// Rendered error chain.
    pub message: String,
    /// Matched classification rule.
    pub pattern: String,
    /// Assigned severity.
    pub severity: ErrorSeverity,
    /// Assigned strategy.
    pub strategy: RecoveryStrategy,
}

/// Summary of the error history over a time window.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorStatistics {
    /// Window the figures cover, in seconds.
    pub window_secs: u64,
    /// Failures inside the window.
    pub total_errors: usize,
    /// Counts keyed by severity label.
    pub by_severity: BTreeMap<String, usize>,
    /// Counts keyed by classification rule.
    pub by_pattern: BTreeMap<String, usize>,
    /// Counts keyed by operation name.
    pub by_operation: BTreeMap<String, usize>,
    /// Breakers currently open.
    pub open_circuit_breakers: Vec<String>,
    /// Operator hints derived from the figures above.
    pub recommendations: Vec<String>,
}

/// Retry engine wrapping fallible async operations.
///
/// The breaker registry and error history are shared by every operation run
/// through one manager and are guarded by in-process mutexes.
#[derive(Debug)]
pub struct ErrorRecoveryManager {
    max_attempts: u32,
    history_limit: usize,
    classifier: ErrorClassifier,
    backoff: BackoffPolicy,
    breakers: CircuitBreakerRegistry,
    history: Mutex<VecDeque<ErrorRecord>>,
    metrics: Option<RecoveryMetrics>,
    shutdown: Option<ShutdownFlag>,
}

impl ErrorRecoveryManager {
    /// Build a manager from the recovery configuration.
    pub fn new(config: &RecoveryConfig, metrics: Option<RecoveryMetrics>) -> Self {
        Self {
            max_attempts: config.max_retry_attempts.max(1),
            history_limit: config.error_history_limit.max(1),
            classifier: ErrorClassifier::default(),
            backoff: BackoffPolicy::from_config(config),
            breakers: CircuitBreakerRegistry::new(
                config.circuit_breaker_threshold,
                config.circuit_breaker_timeout(),
            ),
            history: Mutex::new(VecDeque::new()),
            metrics,
            shutdown: None,
        }
    }

    /// Replace the classification table.
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Interrupt backoff sleeps when `flag` is raised.
    pub fn with_shutdown(mut self, flag: ShutdownFlag) -> Self {
        self.shutdown = Some(flag);
        self
    }

    /// Run `operation` until it succeeds, the budget is spent, a terminal
    /// strategy applies, or the breaker for `operation_name` is open.
    ///
    /// The closure receives the 1-indexed attempt number.
    pub async fn execute_with_recovery<F, Fut, T>(
        &self,
        operation_name: &str,
        mut operation: F,
    ) -> RecoveryResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let started = Instant::now();
        let mut result = RecoveryResult::new(operation_name);

        for attempt in 1..=self.max_attempts {
            if self.breakers.is_open(operation_name) {
                warn!(
                    target: TARGET,
                    operation = operation_name,
                    attempt,
                    "circuit breaker open; not invoking operation"
                );
                result.circuit_open = true;
                result.final_error =
                    Some(format!("circuit breaker open for '{operation_name}'"));
                break;
            }

            info!(target: TARGET, operation = operation_name, attempt, "executing attempt");
            match operation(attempt).await {
                Ok(value) => {
                    self.breakers.record_success(operation_name);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_attempt(operation_name, "none", true);
                        metrics.set_breaker_open(operation_name, false);
                    }
                    result.attempts.push(RecoveryAttempt {
                        attempt,
                        strategy: None,
                        severity: None,
                        delay: Duration::ZERO,
                        success: true,
                        error: None,
                        finished_at: Utc::now(),
                    });
                    result.success = true;
                    result.value = Some(value);
                    info!(target: TARGET, operation = operation_name, attempt, "attempt succeeded");
                    break;
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    let classification = self.classifier.classify(&message);
                    let strategy = classification.strategy;
                    self.push_history(ErrorRecord {
                        at: Utc::now(),
                        operation: operation_name.to_owned(),
                        attempt,
                        message: message.clone(),
                        pattern: classification.pattern.clone(),
                        severity: classification.severity,
                        strategy,
                    });
                    if let Some(metrics) = &self.metrics {
                        metrics.record_attempt(operation_name, strategy.as_str(), false);
                    }

                    let terminal = matches!(
                        strategy,
                        RecoveryStrategy::AbortOperation | RecoveryStrategy::SkipAndContinue
                    ) || attempt == self.max_attempts;
                    let delay = if terminal {
                        Duration::ZERO
                    } else {
                        self.backoff.delay_for(strategy, attempt)
                    };
                    warn!(
                        target: TARGET,
                        operation = operation_name,
                        attempt,
                        pattern = %classification.pattern,
                        severity = classification.severity.as_str(),
                        strategy = strategy.as_str(),
                        delay_secs = delay.as_secs_f64(),
                        error = %message,
                        "attempt failed"
                    );
                    result.attempts.push(RecoveryAttempt {
                        attempt,
                        strategy: Some(strategy),
                        severity: Some(classification.severity),
                        delay,
                        success: false,
                        error: Some(message.clone()),
                        finished_at: Utc::now(),
                    });

                    if terminal {
                        result.final_error = Some(message);
                        match strategy {
                            RecoveryStrategy::SkipAndContinue => result.skipped = true,
                            RecoveryStrategy::AbortOperation => result.aborted = true,
                            _ => {}
                        }
                        // Only a failure on the last allowed attempt counts toward the breaker.
                        if attempt == self.max_attempts
                            && strategy != RecoveryStrategy::SkipAndContinue
                        {
                            self.trip(operation_name);
                        }
                        break;
                    }

                    if !self.backoff_sleep(delay).await {
                        warn!(target: TARGET, operation = operation_name, "retry loop cancelled");
                        result.cancelled = true;
                        result.final_error = Some(format!("{message} (cancelled during backoff)"));
                        break;
                    }
                }
            }
        }

        result.total_duration = started.elapsed();
        let outcome = if result.success {
            "success"
        } else if result.circuit_open {
            "circuit_open"
        } else if result.aborted {
            "aborted"
        } else if result.skipped {
            "skipped"
        } else if result.cancelled {
            "cancelled"
        } else {
            "exhausted"
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_operation(operation_name, outcome);
        }
        if result.success {
            info!(
                target: TARGET,
                operation = operation_name,
                attempts = result.attempts.len(),
                "operation completed"
            );
        } else {
            error!(
                target: TARGET,
                operation = operation_name,
                attempts = result.attempts.len(),
                outcome,
                error = result.final_error.as_deref().unwrap_or_default(),
                "operation failed after recovery"
            );
        }
        result
    }

    /// Sleep for `delay`; returns `false` when interrupted by shutdown.
    async fn backoff_sleep(&self, delay: Duration) -> bool {
        match &self.shutdown {
            Some(flag) => {
                if flag.is_requested() {
                    return false;
                }
                tokio::select! {
                    _ = sleep(delay) => true,
                    _ = flag.wait() => false,
                }
            }
            None => {
                sleep(delay).await;
                true
            }
        }
    }

    fn trip(&self, operation: &str) {
        let open = self.breakers.record_failure(operation);
        if let Some(metrics) = &self.metrics {
            metrics.set_breaker_open(operation, open);
        }
    }

    fn push_history(&self, record: ErrorRecord) {
        let mut history = self.history.lock();
        history.push_back(record);
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }

    /// Most recent `limit` error records, oldest first.
    pub fn error_history(&self, limit: usize) -> Vec<ErrorRecord> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Force the breaker for `operation` closed. Returns whether it had state.
    pub fn reset_circuit_breaker(&self, operation: &str) -> bool {
        let existed = self.breakers.reset(operation);
        if let Some(metrics) = &self.metrics {
            metrics.set_breaker_open(operation, false);
        }
        info!(target: TARGET, operation, existed, "circuit breaker reset");
        existed
    }

    /// Whether `operation` is currently suppressed.
    pub fn is_circuit_open(&self, operation: &str) -> bool {
        self.breakers.is_open(operation)
    }

    /// Snapshot of every tracked breaker.
    pub fn circuit_breakers(&self) -> Vec<CircuitBreakerSnapshot> {
        self.breakers.snapshots()
    }

    /// Summarise failures recorded within `window` of now.
    pub fn error_statistics(&self, window: Duration) -> ErrorStatistics {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut by_severity = BTreeMap::new();
        let mut by_pattern = BTreeMap::new();
        let mut by_operation = BTreeMap::new();
        let mut total_errors = 0;
        {
            let history = self.history.lock();
            for record in history.iter().filter(|record| record.at >= cutoff) {
                total_errors += 1;
                *by_severity
                    .entry(record.severity.as_str().to_owned())
                    .or_insert(0) += 1;
                *by_pattern.entry(record.pattern.clone()).or_insert(0) += 1;
                *by_operation.entry(record.operation.clone()).or_insert(0) += 1;
            }
        }
        let open_circuit_breakers: Vec<String> = self
            .breakers
            .snapshots()
            .into_iter()
            .filter(|snapshot| snapshot.open)
            .map(|snapshot| snapshot.operation)
            .collect();
        let recommendations =
            recommendations(total_errors, &by_severity, &by_pattern, &open_circuit_breakers);
        ErrorStatistics {
            window_secs: window.as_secs(),
            total_errors,
            by_severity,
            by_pattern,
            by_operation,
            open_circuit_breakers,
            recommendations,
        }
    }
}

fn recommendations(
    total_errors: usize,
    by_severity: &BTreeMap<String, usize>,
    by_pattern: &BTreeMap<String, usize>,
    open_breakers: &[String],
) -> Vec<String> {
    let count = |pattern: &str| by_pattern.get(pattern).copied().unwrap_or(0);
    let mut hints = Vec::new();
    if count("disk_full") > 0 {
        hints.push("Free disk space on the data volumes before the next run".to_owned());
    }
    if count("permission_denied") > 0 {
        hints.push("Check file and directory permissions for the service account".to_owned());
    }
    if count("out_of_memory") > 0 {
        hints.push("Reduce max_concurrent_instances or instance batch sizes".to_owned());
    }
    if count("connection_error") >= 3 {
        hints.push("Investigate network connectivity to upstream sources".to_owned());
    }
    if count("rate_limited") > 0 {
        hints.push("Lower request rates against upstream APIs".to_owned());
    }
    if count("already_running") > 0 {
        hints.push("Another orchestration held the lock; review the schedule for overlaps".to_owned());
    }
    if by_severity.get("critical").copied().unwrap_or(0) > 0 {
        hints.push("Critical errors recorded; resolve them before re-running".to_owned());
    }
    for operation in open_breakers {
        hints.push(format!(
            "Circuit breaker open for '{operation}'; investigate before resetting"
        ));
    }
    if total_errors > 50 {
        hints.push("High error volume; review recent logs for a common cause".to_owned());
    }
    hints
}
