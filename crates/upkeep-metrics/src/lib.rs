//! ---
//! upkeep_section: "03-persistence-logging"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Metrics collection and export utilities."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tracing::debug;

/// Shared registry type used across components.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Render the registry in the Prometheus text exposition format.
pub fn encode_text(registry: &Registry) -> Result<String> {
    let families = registry.gather();
    TextEncoder::new()
        .encode_to_string(&families)
        .context("failed to encode metrics")
}

/// Write the registry to `path` for the node-exporter textfile collector.
///
/// The body is written to a sibling temp file first so scrapers never see a
/// partial file.
pub fn write_textfile(registry: &Registry, path: &Path) -> Result<()> {
    let body = encode_text(registry)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("unable to create metrics directory {}", parent.display()))?;
    }
    let tmp = path.with_extension("prom.tmp");
    fs::write(&tmp, body).with_context(|| format!("unable to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("unable to move metrics into {}", path.display()))?;
    debug!(path = %path.display(), "metrics textfile written");
    Ok(())
}

fn duration_buckets() -> Result<Vec<f64>> {
    prometheus::exponential_buckets(0.05, 4.0, 12).context("failed to construct histogram buckets")
}

/// Retry engine counters.
#[derive(Clone, Debug)]
pub struct RecoveryMetrics {
    attempts: IntCounterVec,
    operations: IntCounterVec,
    breaker_open: IntGaugeVec,
}

impl RecoveryMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let attempts = IntCounterVec::new(
            Opts::new(
                "upkeep_recovery_attempts_total",
                "Attempts executed by the recovery engine by operation, strategy and outcome",
            ),
            &["operation", "strategy", "outcome"],
        )?;
        registry.register(Box::new(attempts.clone()))?;

        let operations = IntCounterVec::new(
            Opts::new(
                "upkeep_recovery_operations_total",
                "Recovery-wrapped operations by final result",
            ),
            &["operation", "result"],
        )?;
        registry.register(Box::new(operations.clone()))?;

        let breaker_open = IntGaugeVec::new(
            Opts::new(
                "upkeep_circuit_breaker_open",
                "Indicator (0/1) whether the operation's circuit breaker is open",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(breaker_open.clone()))?;

        Ok(Self {
            attempts,
            operations,
            breaker_open,
        })
    }

    pub fn record_attempt(&self, operation: &str, strategy: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.attempts
            .with_label_values(&[operation, strategy, outcome])
            .inc();
    }

    pub fn record_operation(&self, operation: &str, result: &str) {
        self.operations
            .with_label_values(&[operation, result])
            .inc();
    }

    pub fn set_breaker_open(&self, operation: &str, open: bool) {
        self.breaker_open
            .with_label_values(&[operation])
            .set(i64::from(open));
    }
}

/// Health probe gauges.
#[derive(Clone, Debug)]
pub struct HealthMetrics {
    probe_status: IntGaugeVec,
    assessments: IntCounterVec,
}

impl HealthMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let probe_status = IntGaugeVec::new(
            Opts::new(
                "upkeep_health_probe_status",
                "Latest probe status (0 healthy, 1 warning, 2 critical, 3 unknown)",
            ),
            &["probe"],
        )?;
        registry.register(Box::new(probe_status.clone()))?;

        let assessments = IntCounterVec::new(
            Opts::new(
                "upkeep_health_assessments_total",
                "Completed health assessments by overall status",
            ),
            &["overall"],
        )?;
        registry.register(Box::new(assessments.clone()))?;

        Ok(Self {
            probe_status,
            assessments,
        })
    }

    pub fn set_probe_status(&self, probe: &str, code: i64) {
        self.probe_status.with_label_values(&[probe]).set(code);
    }

    pub fn record_assessment(&self, overall: &str) {
        self.assessments.with_label_values(&[overall]).inc();
    }
}

/// Conflict detection and resolution counters.
#[derive(Clone, Debug)]
pub struct ConflictMetrics {
    detected: IntCounterVec,
    resolutions: IntCounterVec,
}

impl ConflictMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let detected = IntCounterVec::new(
            Opts::new(
                "upkeep_conflicts_detected_total",
                "Conflicts detected by type and severity",
            ),
            &["conflict_type", "severity"],
        )?;
        registry.register(Box::new(detected.clone()))?;

        let resolutions = IntCounterVec::new(
            Opts::new(
                "upkeep_conflict_resolutions_total",
                "Conflict resolution passes by strategy and outcome",
            ),
            &["strategy", "outcome"],
        )?;
        registry.register(Box::new(resolutions.clone()))?;

        Ok(Self {
            detected,
            resolutions,
        })
    }

    pub fn record_detected(&self, conflict_type: &str, severity: &str) {
        self.detected
            .with_label_values(&[conflict_type, severity])
            .inc();
    }

    pub fn record_resolution(&self, strategy: &str, success: bool) {
        let outcome = if success { "resolved" } else { "unresolved" };
        self.resolutions
            .with_label_values(&[strategy, outcome])
            .inc();
    }
}

/// Orchestrator run and instance counters.
#[derive(Clone, Debug)]
pub struct OrchestrationMetrics {
    runs: IntCounterVec,
    instances: IntCounterVec,
    items_processed: IntCounter,
    run_seconds: Histogram,
}

impl OrchestrationMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let runs = IntCounterVec::new(
            Opts::new(
                "upkeep_orchestration_runs_total",
                "Orchestration runs by final status",
            ),
            &["status"],
        )?;
        registry.register(Box::new(runs.clone()))?;

        let instances = IntCounterVec::new(
            Opts::new(
                "upkeep_instance_updates_total",
                "Instance update outcomes by instance",
            ),
            &["instance", "outcome"],
        )?;
        registry.register(Box::new(instances.clone()))?;

        let items_processed = IntCounter::with_opts(Opts::new(
            "upkeep_items_processed_total",
            "Items processed across all instance updates",
        ))?;
        registry.register(Box::new(items_processed.clone()))?;

        let run_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "upkeep_orchestration_run_seconds",
                "Wall-clock duration of orchestration runs",
            )
            .buckets(duration_buckets()?),
        )?;
        registry.register(Box::new(run_seconds.clone()))?;

        Ok(Self {
            runs,
            instances,
            items_processed,
            run_seconds,
        })
    }

    pub fn record_run(&self, status: &str, duration: Duration) {
        self.runs.with_label_values(&[status]).inc();
        self.run_seconds.observe(duration.as_secs_f64());
    }

    pub fn record_instance(&self, instance: &str, outcome: &str) {
        self.instances
            .with_label_values(&[instance, outcome])
            .inc();
    }

    pub fn add_items(&self, items: u64) {
        self.items_processed.inc_by(items);
    }
}

/// Scheduling coordinator counters.
#[derive(Clone, Debug)]
pub struct SchedulerMetrics {
    executions: IntCounterVec,
    active: IntGauge,
    execution_seconds: Histogram,
    phase_seconds: HistogramVec,
}

impl SchedulerMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let executions = IntCounterVec::new(
            Opts::new(
                "upkeep_scheduled_executions_total",
                "Scheduled executions by outcome and final phase",
            ),
            &["outcome", "phase"],
        )?;
        registry.register(Box::new(executions.clone()))?;

        let active = IntGauge::with_opts(Opts::new(
            "upkeep_scheduled_execution_active",
            "Indicator (0/1) whether a scheduled execution is in flight",
        ))?;
        registry.register(Box::new(active.clone()))?;

        let execution_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "upkeep_scheduled_execution_seconds",
                "Wall-clock duration of scheduled executions",
            )
            .buckets(duration_buckets()?),
        )?;
        registry.register(Box::new(execution_seconds.clone()))?;

        let phase_seconds = HistogramVec::new(
            HistogramOpts::new(
                "upkeep_scheduling_phase_seconds",
                "Time spent in each coordinator phase",
            )
            .buckets(duration_buckets()?),
            &["phase"],
        )?;
        registry.register(Box::new(phase_seconds.clone()))?;

        Ok(Self {
            executions,
            active,
            execution_seconds,
            phase_seconds,
        })
    }

    pub fn set_active(&self, active: bool) {
        self.active.set(i64::from(active));
    }

    pub fn record_execution(&self, success: bool, phase: &str, duration: Duration) {
        let outcome = if success { "success" } else { "failure" };
        self.executions
            .with_label_values(&[outcome, phase])
            .inc();
        self.execution_seconds.observe(duration.as_secs_f64());
    }

    pub fn observe_phase(&self, phase: &str, duration: Duration) {
        self.phase_seconds
            .with_label_values(&[phase])
            .observe(duration.as_secs_f64());
    }
}

/// Every metric family used by the runtime, registered against one registry.
#[derive(Clone)]
pub struct UpkeepMetrics {
    registry: SharedRegistry,
    pub recovery: RecoveryMetrics,
    pub health: HealthMetrics,
    pub conflict: ConflictMetrics,
    pub orchestration: OrchestrationMetrics,
    pub scheduler: SchedulerMetrics,
}

impl UpkeepMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        Ok(Self {
            recovery: RecoveryMetrics::new(&registry)?,
            health: HealthMetrics::new(&registry)?,
            conflict: ConflictMetrics::new(&registry)?,
            orchestration: OrchestrationMetrics::new(&registry)?,
            scheduler: SchedulerMetrics::new(&registry)?,
            registry,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }
}

impl std::fmt::Debug for UpkeepMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpkeepMetrics").finish_non_exhaustive()
    }
}

pub use prometheus;
