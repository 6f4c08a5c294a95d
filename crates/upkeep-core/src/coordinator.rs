//! ---
//! upkeep_section: "08-scheduling"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Service context and phase sequencing for scheduled updates."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_with::{serde_as, DurationSecondsWithFrac};
use tokio::time::{timeout, Instant};
use tracing::{error, info, warn};
use upkeep_common::{InstanceConfig, ReportStore, SchedulingConfig};
use upkeep_conflict::{ConflictInfo, ResolutionResult};
use upkeep_health::{is_system_ready_for_update, SystemHealthStatus};
use upkeep_orchestrator::OrchestrationResult;
use upkeep_resilience::RecoverySummary;
use uuid::Uuid;

use crate::context::ServiceContext;

const TARGET: &str = "upkeep::scheduler";

/// File name prefix of persisted scheduling reports.
pub const SCHEDULING_REPORT_PREFIX: &str = "scheduled-execution";

/// Step of the scheduled-execution state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPhase {
    Init,
    HealthCheck,
    ConflictResolution,
    Execution,
    Finalized,
    Aborted,
}

impl SchedulingPhase {
    /// Label used in logs, metrics and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulingPhase::Init => "init",
            SchedulingPhase::HealthCheck => "health_check",
            SchedulingPhase::ConflictResolution => "conflict_resolution",
            SchedulingPhase::Execution => "execution",
            SchedulingPhase::Finalized => "finalized",
            SchedulingPhase::Aborted => "aborted",
        }
    }

    /// Finalized or aborted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SchedulingPhase::Finalized | SchedulingPhase::Aborted)
    }
}

/// How the phase sequence ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reasons", rename_all = "snake_case")]
pub enum PhaseOutcome {
    /// Both gates passed (or were forced) and execution ran.
    Passed,
    HealthFailed(Vec<String>),
    ConflictUnresolved(Vec<String>),
    /// Unexpected error, panic, timeout or exhausted execution retries.
    Aborted(String),
}

/// Arguments of one scheduled execution.
#[derive(Debug, Clone, Default)]
pub struct SchedulingRequest {
    /// Instance names; empty selects every configured instance.
    pub instances: Vec<String>,
    pub force_update: bool,
    /// Continue past a failed health or conflict gate.
    pub force_execution: bool,
}

/// Record of one top-level invocation. Always produced, never an `Err`.
#[serde_as]
#[derive(Debug, Clone, Serialize)]
pub struct SchedulingResult {
    pub id: Uuid,
    pub operation: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub duration: Duration,
    pub instances: Vec<String>,
    pub force_update: bool,
    pub force_execution: bool,
    pub final_phase: SchedulingPhase,
    pub outcome: PhaseOutcome,
    pub success: bool,
    pub health_check_passed: bool,
    pub health_status: Option<SystemHealthStatus>,
    pub conflicts_resolved: bool,
    pub conflicts_detected: Vec<ConflictInfo>,
    pub conflict_resolution: Option<ResolutionResult>,
    pub orchestration_result: Option<OrchestrationResult>,
    pub recovery: Option<RecoverySummary>,
    pub actions: Vec<String>,
    pub error: Option<String>,
    pub message: String,
}

impl SchedulingResult {
    fn new(operation: &str, request: &SchedulingRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation: operation.to_owned(),
            started_at: Utc::now(),
            finished_at: None,
            duration: Duration::ZERO,
            instances: request.instances.clone(),
            force_update: request.force_update,
            force_execution: request.force_execution,
            final_phase: SchedulingPhase::Init,
            outcome: PhaseOutcome::Aborted("not started".to_owned()),
            success: false,
            health_check_passed: false,
            health_status: None,
            conflicts_resolved: false,
            conflicts_detected: Vec::new(),
            conflict_resolution: None,
            orchestration_result: None,
            recovery: None,
            actions: Vec::new(),
            error: None,
            message: String::new(),
        }
    }

    fn action(&mut self, action: impl Into<String>) {
        let action = action.into();
        info!(target: TARGET, run_id = %self.id, "{action}");
        self.actions.push(action);
    }

    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            id: self.id,
            success: self.success,
            final_phase: self.final_phase,
            started_at: self.started_at,
            finished_at: self.finished_at,
            message: self.message.clone(),
        }
    }
}

/// Compact history entry.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub id: Uuid,
    pub success: bool,
    pub final_phase: SchedulingPhase,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub message: String,
}

/// Live view of the coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulingStatus {
    pub phase: SchedulingPhase,
    pub in_progress: bool,
    pub last: Option<ExecutionSummary>,
    pub executions: usize,
    pub success_rate: f64,
}

#[derive(Debug)]
struct CoordinatorState {
    phase: SchedulingPhase,
    in_progress: bool,
    history: VecDeque<ExecutionSummary>,
}

/// Phase, in-progress flag and bounded execution history.
///
/// One instance lives in the [`ServiceContext`] and is shared by every
/// coordinator built over it, so history and the single-run guard survive
/// across entry-point calls.
#[derive(Debug)]
pub struct SchedulingState {
    inner: Mutex<CoordinatorState>,
}

impl SchedulingState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CoordinatorState {
                phase: SchedulingPhase::Init,
                in_progress: false,
                history: VecDeque::new(),
            }),
        }
    }

    pub fn status(&self) -> SchedulingStatus {
        let state = self.inner.lock();
        let executions = state.history.len();
        let successes = state.history.iter().filter(|entry| entry.success).count();
        SchedulingStatus {
            phase: state.phase,
            in_progress: state.in_progress,
            last: state.history.back().cloned(),
            executions,
            success_rate: if executions == 0 {
                0.0
            } else {
                successes as f64 / executions as f64
            },
        }
    }

    /// Newest first.
    pub fn history(&self, limit: usize) -> Vec<ExecutionSummary> {
        self.inner
            .lock()
            .history
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    fn record(&self, summary: ExecutionSummary, limit: usize) {
        let mut state = self.inner.lock();
        state.history.push_back(summary);
        while state.history.len() > limit.max(1) {
            state.history.pop_front();
        }
    }
}

impl Default for SchedulingState {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds the in-progress flag for one execution and clears it on drop,
/// including when the execution future is cancelled mid-phase.
struct RunGuard<'a> {
    coordinator: &'a SchedulingCoordinator,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.coordinator.state.inner.lock();
        state.in_progress = false;
        if !state.phase.is_terminal() {
            warn!(target: TARGET, phase = state.phase.as_str(), "scheduled execution dropped before finishing");
            state.phase = SchedulingPhase::Aborted;
        }
        self.coordinator.context.metrics().scheduler.set_active(false);
    }
}

/// Drives INIT → HEALTH_CHECK → CONFLICT_RESOLUTION → EXECUTION → FINALIZED.
///
/// Each gate can be disabled, in which case it passes automatically. Gates
/// that fail without `force_execution` end the run in ABORTED. The
/// finalisation step runs on every path, panics included.
#[derive(Debug)]
pub struct SchedulingCoordinator {
    context: Arc<ServiceContext>,
    config: SchedulingConfig,
    state: Arc<SchedulingState>,
}

impl SchedulingCoordinator {
    /// Coordinator using the context's scheduling configuration.
    pub fn new(context: Arc<ServiceContext>) -> Self {
        let config = context.config().scheduling.clone();
        Self::with_config(context, config)
    }

    /// Coordinator with its own gate toggles and timeouts. State and history
    /// are still the context's shared ones.
    pub fn with_config(context: Arc<ServiceContext>, config: SchedulingConfig) -> Self {
        let state = context.scheduling_state();
        Self {
            context,
            config,
            state,
        }
    }

    /// Toggles and timeouts in effect for this coordinator.
    pub fn config(&self) -> &SchedulingConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.context
    }

    /// Walk one execution through every phase and return its record.
    ///
    /// Never fails: errors, panics and timeouts end in ABORTED with the cause in
    /// the result. A concurrent call on the same context is refused immediately.
    pub async fn execute_scheduled_update(&self, request: SchedulingRequest) -> SchedulingResult {
        let operation = self.config.operation_name.clone();
        let mut result = SchedulingResult::new(&operation, &request);
        let started = Instant::now();

        let Some(_running) = self.begin() else {
            result.error = Some("a scheduled execution is already in progress".to_owned());
            result.outcome = PhaseOutcome::Aborted("already in progress".to_owned());
            result.final_phase = SchedulingPhase::Aborted;
            return self.finish(result, started, false);
        };
        info!(
            target: TARGET,
            run_id = %result.id,
            operation = %operation,
            instances = ?request.instances,
            force_update = request.force_update,
            force_execution = request.force_execution,
            "scheduled execution started"
        );
        self.context.metrics().scheduler.set_active(true);

        let phases = AssertUnwindSafe(self.run_phases(&request, &mut result))
            .catch_unwind()
            .await;
        match phases {
            Ok(Ok(outcome)) => result.outcome = outcome,
            Ok(Err(err)) => {
                let message = format!("{err:#}");
                error!(target: TARGET, run_id = %result.id, phase = self.phase().as_str(), error = %message, "scheduled execution failed");
                result.error = Some(message.clone());
                result.outcome = PhaseOutcome::Aborted(message);
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(target: TARGET, run_id = %result.id, phase = self.phase().as_str(), panic = %message, "scheduled execution panicked");
                result.error = Some(format!("panic: {message}"));
                result.outcome = PhaseOutcome::Aborted(format!("panic: {message}"));
            }
        }
        result.final_phase = match result.outcome {
            PhaseOutcome::Passed => SchedulingPhase::Finalized,
            _ => SchedulingPhase::Aborted,
        };
        self.finish(result, started, true)
    }

    async fn run_phases(
        &self,
        request: &SchedulingRequest,
        result: &mut SchedulingResult,
    ) -> Result<PhaseOutcome> {
        let instances = self.context.config().select_instances(&request.instances)?;
        result.instances = instances.keys().cloned().collect();

        self.enter(SchedulingPhase::HealthCheck);
        let phase_started = Instant::now();
        let gate = self.health_phase(&instances, request, result).await;
        self.observe(SchedulingPhase::HealthCheck, phase_started);
        if let Some(outcome) = gate {
            return Ok(outcome);
        }

        self.enter(SchedulingPhase::ConflictResolution);
        let phase_started = Instant::now();
        let gate = self.conflict_phase(request, result).await;
        self.observe(SchedulingPhase::ConflictResolution, phase_started);
        if let Some(outcome) = gate {
            return Ok(outcome);
        }

        self.enter(SchedulingPhase::Execution);
        let phase_started = Instant::now();
        let executed = self.execution_phase(instances, request, result).await;
        self.observe(SchedulingPhase::Execution, phase_started);
        executed.map(|()| PhaseOutcome::Passed)
    }

    /// `Some` ends the run at this gate.
    async fn health_phase(
        &self,
        instances: &IndexMap<String, InstanceConfig>,
        request: &SchedulingRequest,
        result: &mut SchedulingResult,
    ) -> Option<PhaseOutcome> {
        if !self.config.enable_health_checks {
            result.health_check_passed = true;
            result.action("health checks disabled; gate passed");
            return None;
        }
        let checker = self.context.health();
        let reasons = match timeout(
            self.config.health_check_timeout,
            checker.run_comprehensive_health_check(Some(instances)),
        )
        .await
        {
            Ok(status) => {
                let (ready, reasons) = is_system_ready_for_update(&status);
                result.health_status = Some(status);
                result.health_check_passed = ready;
                reasons
            }
            Err(_) => {
                result.health_check_passed = false;
                vec![format!(
                    "health check timed out after {:.0}s",
                    self.config.health_check_timeout.as_secs_f64()
                )]
            }
        };
        if result.health_check_passed {
            result.action("health gate passed");
            return None;
        }
        for reason in &reasons {
            warn!(target: TARGET, run_id = %result.id, reason = %reason, "health gate blocking");
        }
        if request.force_execution {
            result.action(format!(
                "health gate failed ({}); continuing because execution is forced",
                reasons.join("; ")
            ));
            return None;
        }
        result.action(format!("health gate failed: {}", reasons.join("; ")));
        Some(PhaseOutcome::HealthFailed(reasons))
    }

    async fn conflict_phase(
        &self,
        request: &SchedulingRequest,
        result: &mut SchedulingResult,
    ) -> Option<PhaseOutcome> {
        if !self.config.enable_conflict_resolution {
            result.conflicts_resolved = true;
            result.action("conflict resolution disabled; gate passed");
            return None;
        }
        let resolver = self.context.conflicts();
        let operation = self.config.operation_name.as_str();
        let scope = result.instances.clone();
        let outcome = timeout(self.config.conflict_resolution_timeout, async {
            let conflicts = resolver.detect_conflicts(operation, Some(scope.as_slice())).await;
            let resolution = resolver.resolve_conflicts(&conflicts, operation).await;
            (conflicts, resolution)
        })
        .await;

        let reasons = match outcome {
            Ok((conflicts, resolution)) => {
                result.conflicts_resolved = resolution.success;
                let reasons = resolution
                    .remaining_conflicts
                    .iter()
                    .filter(|conflict| conflict.severity.is_blocking())
                    .map(|conflict| {
                        format!(
                            "{} ({}): {}",
                            conflict.conflict_type.as_str(),
                            conflict.severity.as_str(),
                            conflict.description
                        )
                    })
                    .collect::<Vec<_>>();
                result.actions.extend(resolution.actions_taken.iter().cloned());
                result.conflicts_detected = conflicts;
                result.conflict_resolution = Some(resolution);
                reasons
            }
            Err(_) => {
                result.conflicts_resolved = false;
                vec![format!(
                    "conflict resolution timed out after {:.0}s",
                    self.config.conflict_resolution_timeout.as_secs_f64()
                )]
            }
        };
        if result.conflicts_resolved {
            result.action(format!(
                "conflict gate passed ({} detected)",
                result.conflicts_detected.len()
            ));
            return None;
        }
        if request.force_execution {
            result.action(format!(
                "conflicts unresolved ({}); continuing because execution is forced",
                reasons.join("; ")
            ));
            return None;
        }
        result.action(format!("conflict gate failed: {}", reasons.join("; ")));
        Some(PhaseOutcome::ConflictUnresolved(reasons))
    }

    async fn execution_phase(
        &self,
        instances: IndexMap<String, InstanceConfig>,
        request: &SchedulingRequest,
        result: &mut SchedulingResult,
    ) -> Result<()> {
        self.journal(result);
        let orchestrator = self.context.orchestrator();
        let force_update = request.force_update;
        let budget = self.config.execution_timeout();

        let run = if self.config.enable_error_recovery {
            let recovery = self.context.recovery();
            let run_once = |attempt: u32| {
                let orchestrator = orchestrator.clone();
                let instances = instances.clone();
                async move {
                    if attempt > 1 {
                        info!(target: TARGET, attempt, "re-running orchestration");
                    }
                    orchestrator
                        .run_monthly_updates(&instances, force_update)
                        .await
                        .map_err(anyhow::Error::from)
                }
            };
            let recovered = timeout(
                budget,
                recovery.execute_with_recovery(&self.config.operation_name, run_once),
            )
            .await
            .map_err(|_| anyhow!("execution timed out after {:.0}s", budget.as_secs_f64()))?;
            result.recovery = Some(recovered.summary());
            match recovered.value {
                Some(value) => Ok(value),
                None => Err(anyhow!(recovered
                    .final_error
                    .unwrap_or_else(|| "orchestration did not complete".to_owned()))),
            }
        } else {
            timeout(budget, orchestrator.run_monthly_updates(&instances, force_update))
                .await
                .map_err(|_| anyhow!("execution timed out after {:.0}s", budget.as_secs_f64()))?
                .map_err(anyhow::Error::from)
        };

        let orchestration = run.context("orchestration failed")?;
        result.action(format!(
            "orchestration {} finished {}: {} succeeded, {} failed, {} skipped",
            orchestration.id,
            orchestration.status.as_str(),
            orchestration.instance_results.len(),
            orchestration.failed_instances.len(),
            orchestration.skipped_instances.len()
        ));
        result.orchestration_result = Some(orchestration);
        Ok(())
    }

    /// Append a line to the per-operation execution journal.
    fn journal(&self, result: &SchedulingResult) {
        let path = self
            .context
            .config()
            .paths
            .log_directory
            .join(format!("{}.log", self.config.operation_name));
        let line = serde_json::json!({
            "at": Utc::now(),
            "run_id": result.id,
            "operation": result.operation,
            "instances": result.instances,
            "event": "execution_started",
        });
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(err) = written {
            warn!(target: TARGET, path = %path.display(), error = %err, "unable to append execution journal");
        }
    }

    fn finish(&self, mut result: SchedulingResult, started: Instant, owned: bool) -> SchedulingResult {
        result.finished_at = Some(Utc::now());
        result.duration = started.elapsed();
        result.success = matches!(result.outcome, PhaseOutcome::Passed)
            && result
                .orchestration_result
                .as_ref()
                .map(|orchestration| orchestration.failed_instances.is_empty())
                .unwrap_or(false);
        result.message = describe(&result);

        match ReportStore::new(&self.context.config().paths.report_directory).and_then(|store| {
            store.write(
                SCHEDULING_REPORT_PREFIX,
                &result.id.to_string(),
                result.started_at,
                &result,
            )
        }) {
            Ok(path) => info!(target: TARGET, run_id = %result.id, path = %path.display(), "scheduling report persisted"),
            Err(err) => error!(target: TARGET, run_id = %result.id, error = %format!("{err:#}"), "failed to persist scheduling report"),
        }

        self.context.metrics().scheduler.record_execution(
            result.success,
            result.final_phase.as_str(),
            result.duration,
        );
        self.state.record(result.summary(), self.config.history_limit);
        if owned {
            self.state.inner.lock().phase = result.final_phase;
        }

        info!(
            target: TARGET,
            run_id = %result.id,
            success = result.success,
            final_phase = result.final_phase.as_str(),
            elapsed_secs = result.duration.as_secs_f64(),
            message = %result.message,
            "scheduled execution finished"
        );
        result
    }

    /// Current phase, in-progress flag and success rate over the shared history.
    pub fn status(&self) -> SchedulingStatus {
        self.state.status()
    }

    /// Newest first.
    pub fn history(&self, limit: usize) -> Vec<ExecutionSummary> {
        self.state.history(limit)
    }

    fn begin(&self) -> Option<RunGuard<'_>> {
        let mut state = self.state.inner.lock();
        if state.in_progress {
            return None;
        }
        state.in_progress = true;
        state.phase = SchedulingPhase::Init;
        Some(RunGuard { coordinator: self })
    }

    fn enter(&self, phase: SchedulingPhase) {
        self.state.inner.lock().phase = phase;
        info!(target: TARGET, phase = phase.as_str(), "entering phase");
    }

    fn phase(&self) -> SchedulingPhase {
        self.state.inner.lock().phase
    }

    fn observe(&self, phase: SchedulingPhase, started: Instant) {
        self.context
            .metrics()
            .scheduler
            .observe_phase(phase.as_str(), started.elapsed());
    }
}

fn describe(result: &SchedulingResult) -> String {
    match &result.outcome {
        PhaseOutcome::Passed => match &result.orchestration_result {
            Some(orchestration) if orchestration.failed_instances.is_empty() => format!(
                "completed: {} instance(s) updated, {} item(s) processed",
                orchestration.instance_results.len(),
                orchestration.total_items_processed
            ),
            Some(orchestration) => format!(
                "finished with failures: {} failed ({})",
                orchestration.failed_instances.len(),
                orchestration
                    .failed_instances
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            None => "finished without an orchestration result".to_owned(),
        },
        PhaseOutcome::HealthFailed(reasons) => {
            format!("aborted at health check: {}", reasons.join("; "))
        }
        PhaseOutcome::ConflictUnresolved(reasons) => {
            format!("aborted at conflict resolution: {}", reasons.join("; "))
        }
        PhaseOutcome::Aborted(reason) => format!("aborted: {reason}"),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
