//! ---
//! upkeep_section: "08-scheduling"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Service context and phase sequencing for scheduled updates."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use upkeep_common::reports::write_json_atomic;
use upkeep_common::{ActiveProcessorLookup, AppConfig, ShutdownFlag};
use upkeep_conflict::{ConflictResolver, ConflictStatistics};
use upkeep_health::HealthChecker;
use upkeep_host::{ProcessTable, ResourceSampler, SystemProcessTable, SystemResourceSampler};
use upkeep_metrics::{new_registry, write_textfile, SharedRegistry, UpkeepMetrics};
use upkeep_orchestrator::{HostProcessorLookup, InstanceUpdaterFactory, Orchestrator};
use upkeep_resilience::{CircuitBreakerSnapshot, ErrorRecoveryManager, ErrorStatistics};

use crate::coordinator::{SchedulingState, SchedulingStatus};

const TARGET: &str = "upkeep::context";

/// Window covered by the exported error statistics.
const STATISTICS_WINDOW: Duration = Duration::from_secs(24 * 3600);

pub const STATISTICS_FILE: &str = "upkeep-statistics.json";
pub const METRICS_TEXTFILE: &str = "upkeep.prom";

/// OS-facing collaborators. Tests swap in the in-memory variants.
#[derive(Clone)]
pub struct HostSeams {
    pub processes: Arc<dyn ProcessTable>,
    pub sampler: Arc<dyn ResourceSampler>,
    pub processors: Arc<dyn ActiveProcessorLookup>,
}

impl HostSeams {
    /// Live host: sysinfo process table and sampler, processor counts from
    /// command lines matching `patterns`.
    pub fn system(patterns: Vec<String>) -> Self {
        let processes: Arc<dyn ProcessTable> = Arc::new(SystemProcessTable::new());
        Self {
            processors: Arc::new(HostProcessorLookup::new(processes.clone(), patterns)),
            sampler: Arc::new(SystemResourceSampler::new()),
            processes,
        }
    }
}

/// Durable view of the in-memory statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StatisticsExport {
    pub generated_at: DateTime<Utc>,
    pub scheduling: SchedulingStatus,
    pub errors: ErrorStatistics,
    pub conflicts: ConflictStatistics,
    pub circuit_breakers: Vec<CircuitBreakerSnapshot>,
}

/// Process-wide context constructed once and handed to the coordinator.
pub struct ServiceContext {
    config: Arc<AppConfig>,
    metrics: UpkeepMetrics,
    shutdown: ShutdownFlag,
    health: Arc<HealthChecker>,
    conflicts: Arc<ConflictResolver>,
    recovery: Arc<ErrorRecoveryManager>,
    orchestrator: Arc<Orchestrator>,
    scheduling: Arc<SchedulingState>,
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("operation", &self.config.scheduling.operation_name)
            .field("instances", &self.config.instances.len())
            .field("shutdown_requested", &self.shutdown.is_requested())
            .finish()
    }
}

impl ServiceContext {
    /// Context over the live host with a fresh metrics registry.
    pub fn init(config: AppConfig, factory: Arc<dyn InstanceUpdaterFactory>) -> Result<Self> {
        let host = HostSeams::system(config.conflict.process_patterns.clone());
        Self::new(config, host, factory, new_registry())
    }

    /// Validate `config`, create the working directories and wire every component.
    pub fn new(
        config: AppConfig,
        host: HostSeams,
        factory: Arc<dyn InstanceUpdaterFactory>,
        registry: SharedRegistry,
    ) -> Result<Self> {
        config.validate()?;
        for dir in [
            &config.paths.lock_directory,
            &config.paths.report_directory,
            &config.paths.log_directory,
            &config.paths.stats_directory,
        ] {
            fs::create_dir_all(dir)
                .with_context(|| format!("unable to create directory {}", dir.display()))?;
        }

        let metrics = UpkeepMetrics::new(registry)?;
        let shutdown = ShutdownFlag::new();

        let health = HealthChecker::new(
            &config.health,
            &config.conflict,
            host.sampler.clone(),
            host.processes.clone(),
            host.processors.clone(),
        )
        .with_metrics(metrics.health.clone());
        let conflicts = ConflictResolver::new(
            &config.conflict,
            &config.paths,
            host.processes.clone(),
            host.sampler.clone(),
        )
        .with_metrics(metrics.conflict.clone())
        .with_shutdown(shutdown.clone());
        let recovery = ErrorRecoveryManager::new(&config.recovery, Some(metrics.recovery.clone()))
            .with_shutdown(shutdown.clone());
        let orchestrator = Orchestrator::new(
            &config.orchestration,
            &config.paths,
            factory,
            host.processors.clone(),
        )
        .with_shutdown(shutdown.clone())
        .with_metrics(metrics.orchestration.clone());

        info!(
            target: TARGET,
            operation = %config.scheduling.operation_name,
            instances = config.instances.len(),
            lock_file = %config.paths.lock_file.display(),
            "service context initialised"
        );

        Ok(Self {
            config: Arc::new(config),
            metrics,
            shutdown,
            health: Arc::new(health),
            conflicts: Arc::new(conflicts),
            recovery: Arc::new(recovery),
            orchestrator: Arc::new(orchestrator),
            scheduling: Arc::new(SchedulingState::new()),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn metrics(&self) -> &UpkeepMetrics {
        &self.metrics
    }

    pub fn shutdown(&self) -> &ShutdownFlag {
        &self.shutdown
    }

    pub fn health(&self) -> Arc<HealthChecker> {
        self.health.clone()
    }

    pub fn conflicts(&self) -> Arc<ConflictResolver> {
        self.conflicts.clone()
    }

    pub fn recovery(&self) -> Arc<ErrorRecoveryManager> {
        self.recovery.clone()
    }

    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        self.orchestrator.clone()
    }

    /// Phase, history and single-run guard shared by every coordinator on this context.
    pub fn scheduling_state(&self) -> Arc<SchedulingState> {
        self.scheduling.clone()
    }

    /// Snapshot of scheduling, error, conflict and breaker statistics.
    pub fn statistics(&self) -> StatisticsExport {
        StatisticsExport {
            generated_at: Utc::now(),
            scheduling: self.scheduling.status(),
            errors: self.recovery.error_statistics(STATISTICS_WINDOW),
            conflicts: self.conflicts.conflict_statistics(),
            circuit_breakers: self.recovery.circuit_breakers(),
        }
    }

    /// Write the statistics JSON and the metrics textfile into the stats directory.
    pub fn export_statistics(&self) -> Result<PathBuf> {
        let dir: &Path = &self.config.paths.stats_directory;
        let path = dir.join(STATISTICS_FILE);
        write_json_atomic(&path, &self.statistics())?;
        write_textfile(&self.metrics.registry(), &dir.join(METRICS_TEXTFILE))?;
        info!(target: TARGET, path = %path.display(), "statistics exported");
        Ok(path)
    }

    /// Raise the stop flag and flush statistics one last time.
    pub fn teardown(&self) -> Result<()> {
        self.shutdown.request();
        self.export_statistics()?;
        info!(target: TARGET, "service context torn down");
        Ok(())
    }
}
