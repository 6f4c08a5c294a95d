//! ---
//! upkeep_section: "05-health-readiness"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Readiness probes and the pre-execution health gate."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use indexmap::IndexMap;
use serde_json::Value;
use tokio::time::{timeout, Instant};
use tracing::{info, warn};
use upkeep_common::{ActiveProcessorLookup, ConflictConfig, HealthConfig, InstanceConfig};
use upkeep_host::{ProcessTable, ResourceSampler};
use upkeep_metrics::HealthMetrics;

use crate::probes::{
    DataStoreProbe, DependencyProbe, DiskSpaceProbe, HealthProbe, InstanceProbe, NetworkProbe,
    PermissionsProbe, ProcessConflictProbe, ResourceProbe,
};
use crate::status::{HealthCheckResult, HealthStatus, SystemHealthStatus};

const TARGET: &str = "upkeep::health";

/// Runs the probe battery concurrently and rolls the verdicts up.
pub struct HealthChecker {
    probes: Vec<Arc<dyn HealthProbe>>,
    lookup: Arc<dyn ActiveProcessorLookup>,
    probe_timeout: Duration,
    metrics: Option<HealthMetrics>,
}

impl HealthChecker {
    /// Checker with the built-in probe battery.
    pub fn new(
        config: &HealthConfig,
        conflict: &ConflictConfig,
        sampler: Arc<dyn ResourceSampler>,
        processes: Arc<dyn ProcessTable>,
        lookup: Arc<dyn ActiveProcessorLookup>,
    ) -> Self {
        let probes: Vec<Arc<dyn HealthProbe>> = vec![
            Arc::new(ResourceProbe::new(sampler.clone(), config.clone())),
            Arc::new(DiskSpaceProbe::new(sampler, config)),
            Arc::new(NetworkProbe::new(
                config.network_endpoints.clone(),
                config.network_timeout,
            )),
            Arc::new(DependencyProbe::new(config.required_commands.clone())),
            Arc::new(DataStoreProbe::new(config)),
            Arc::new(PermissionsProbe::new(config.required_directories.clone())),
            Arc::new(ProcessConflictProbe::new(
                processes,
                conflict.process_patterns.clone(),
                conflict.hung_process_age(),
            )),
        ];
        Self::with_probes(probes, lookup, config.probe_timeout)
    }

    /// Checker with a caller-supplied battery.
    pub fn with_probes(
        probes: Vec<Arc<dyn HealthProbe>>,
        lookup: Arc<dyn ActiveProcessorLookup>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            probes,
            lookup,
            probe_timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: HealthMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn add_probe(&mut self, probe: Arc<dyn HealthProbe>) {
        self.probes.push(probe);
    }

    pub fn probe_names(&self) -> Vec<String> {
        self.probes.iter().map(|probe| probe.name()).collect()
    }

    /// Run every probe, plus one per instance when `instances` is given.
    pub async fn run_comprehensive_health_check(
        &self,
        instances: Option<&IndexMap<String, InstanceConfig>>,
    ) -> SystemHealthStatus {
        let started = Instant::now();
        let mut probes = self.probes.clone();
        if let Some(instances) = instances {
            for (name, config) in instances {
                probes.push(Arc::new(InstanceProbe::new(
                    name.clone(),
                    config.clone(),
                    self.lookup.clone(),
                )));
            }
        }

        let checks = join_all(probes.iter().map(|probe| self.run_probe(probe.clone()))).await;
        let status = SystemHealthStatus::from_checks(checks, started.elapsed());

        if let Some(metrics) = &self.metrics {
            for check in &status.checks {
                metrics.set_probe_status(&check.name, check.status.metric_code());
            }
            metrics.record_assessment(status.overall.as_str());
        }
        info!(
            target: TARGET,
            overall = status.overall.as_str(),
            probes = status.checks.len(),
            critical = status.count(HealthStatus::Critical),
            warning = status.count(HealthStatus::Warning),
            unknown = status.unknown_checks.len(),
            "health assessment complete"
        );
        status
    }

    /// Run one probe with timeout and panic isolation.
    async fn run_probe(&self, probe: Arc<dyn HealthProbe>) -> HealthCheckResult {
        let name = probe.name();
        let started = Instant::now();
        let outcome = timeout(
            self.probe_timeout,
            AssertUnwindSafe(probe.check()).catch_unwind(),
        )
        .await;

        let (status, message, details) = match outcome {
            Ok(Ok(Ok(report))) => (report.status, report.message, report.details),
            Ok(Ok(Err(err))) => {
                warn!(target: TARGET, probe = %name, error = %format!("{err:#}"), "probe failed");
                (HealthStatus::Unknown, format!("probe failed: {err:#}"), Value::Null)
            }
            Ok(Err(_panic)) => {
                warn!(target: TARGET, probe = %name, "probe panicked");
                (HealthStatus::Unknown, "probe panicked".to_owned(), Value::Null)
            }
            Err(_) => {
                warn!(target: TARGET, probe = %name, timeout_secs = self.probe_timeout.as_secs_f64(), "probe timed out");
                (
                    HealthStatus::Unknown,
                    format!("probe timed out after {:?}", self.probe_timeout),
                    Value::Null,
                )
            }
        };
        if status != HealthStatus::Healthy {
            info!(target: TARGET, probe = %name, status = status.as_str(), message = %message, "probe verdict");
        }
        HealthCheckResult {
            name,
            status,
            message,
            details,
            checked_at: Utc::now(),
            duration: started.elapsed(),
        }
    }
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("probes", &self.probe_names())
            .field("probe_timeout", &self.probe_timeout)
            .finish_non_exhaustive()
    }
}
