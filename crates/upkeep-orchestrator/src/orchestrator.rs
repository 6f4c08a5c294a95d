//! ---
//! upkeep_section: "07-orchestration"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Locked, bounded-concurrency instance orchestration."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use indexmap::IndexMap;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use upkeep_common::{
    ActiveProcessorLookup, InstanceConfig, OrchestrationConfig, PathsConfig, ReportStore,
    ShutdownFlag,
};
use upkeep_metrics::OrchestrationMetrics;

use crate::error::OrchestrationError;
use crate::lock::FileLock;
use crate::manager::{InstanceUpdateReport, InstanceUpdaterFactory, UpdateRequest};
use crate::result::OrchestrationResult;

const TARGET: &str = "upkeep::orchestrator";

/// File name prefix of persisted orchestration reports.
pub const ORCHESTRATION_REPORT_PREFIX: &str = "orchestration";

const SECONDS_PER_DAY: u64 = 86_400;

type AttemptOutcome = Result<InstanceUpdateReport, String>;

/// Runs instance updates under the global lock with bounded concurrency.
pub struct Orchestrator {
    config: OrchestrationConfig,
    lock: FileLock,
    report_directory: PathBuf,
    factory: Arc<dyn InstanceUpdaterFactory>,
    processors: Arc<dyn ActiveProcessorLookup>,
    stop: ShutdownFlag,
    metrics: Option<OrchestrationMetrics>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("lock", &self.lock.path())
            .field("report_directory", &self.report_directory)
            .field("max_concurrent_instances", &self.config.max_concurrent_instances)
            .finish()
    }
}

impl Orchestrator {
    /// Orchestrator locking `paths.lock_file` and persisting to `paths.report_directory`.
    pub fn new(
        config: &OrchestrationConfig,
        paths: &PathsConfig,
        factory: Arc<dyn InstanceUpdaterFactory>,
        processors: Arc<dyn ActiveProcessorLookup>,
    ) -> Self {
        Self {
            config: config.clone(),
            lock: FileLock::new(paths.lock_file.clone()),
            report_directory: paths.report_directory.clone(),
            factory,
            processors,
            stop: ShutdownFlag::new(),
            metrics: None,
        }
    }

    /// Share a process-wide stop flag instead of the private one.
    pub fn with_shutdown(mut self, stop: ShutdownFlag) -> Self {
        self.stop = stop;
        self
    }

    /// Attach metric families.
    pub fn with_metrics(mut self, metrics: OrchestrationMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Stop scheduling new instances. In-flight updates see the advisory flag.
    pub fn request_shutdown(&self) {
        info!(target: TARGET, "shutdown requested");
        self.stop.request();
    }

    /// Global lock used by every run.
    pub fn lock(&self) -> &FileLock {
        &self.lock
    }

    /// Effective configuration.
    pub fn config(&self) -> &OrchestrationConfig {
        &self.config
    }

    /// Update every instance in `instances` once, retrying failures in rounds.
    ///
    /// Returns [`OrchestrationError::AlreadyRunning`] without touching any
    /// instance when another run holds the lock. Once the lock is taken it is
    /// released on every exit path and a report is persisted, including when
    /// validation errors out.
    pub async fn run_monthly_updates(
        &self,
        instances: &IndexMap<String, InstanceConfig>,
        force_update: bool,
    ) -> Result<OrchestrationResult, OrchestrationError> {
        if self.stop.is_requested() {
            return Err(OrchestrationError::Cancelled);
        }
        let store =
            ReportStore::new(&self.report_directory).map_err(OrchestrationError::Persistence)?;

        let guard = match self.lock.acquire(self.config.lock_timeout).await {
            Ok(guard) => guard,
            Err(err) => {
                let err = OrchestrationError::from(err);
                warn!(target: TARGET, error = %err, "orchestration not started");
                return Err(err);
            }
        };

        let started = Instant::now();
        let mut result = OrchestrationResult::new(force_update);
        info!(
            target: TARGET,
            run_id = %result.id,
            instances = instances.len(),
            force_update,
            max_concurrent = self.config.max_concurrent_instances,
            "orchestration started"
        );

        let outcome = self
            .run_locked(instances, force_update, &mut result, started)
            .await;
        drop(guard);

        if let Err(err) = &outcome {
            result.fail(started.elapsed(), err.to_string());
        }
        self.persist(&store, &result);

        info!(
            target: TARGET,
            run_id = %result.id,
            status = result.status.as_str(),
            succeeded = result.instance_results.len(),
            failed = result.failed_instances.len(),
            skipped = result.skipped_instances.len(),
            items = result.total_items_processed,
            retry_rounds = result.retry_rounds,
            elapsed_secs = result.duration.as_secs_f64(),
            "orchestration finished"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_run(result.status.as_str(), result.duration);
        }

        outcome.map(|()| result)
    }

    async fn run_locked(
        &self,
        instances: &IndexMap<String, InstanceConfig>,
        force_update: bool,
        result: &mut OrchestrationResult,
        started: Instant,
    ) -> Result<(), OrchestrationError> {
        let mut runnable = Vec::new();
        for (name, config) in instances {
            match self
                .validate_instance(name, config)
                .map_err(OrchestrationError::Validation)?
            {
                None => runnable.push(name.clone()),
                Some(reason) => {
                    warn!(target: TARGET, instance = %name, reason = %reason, "instance skipped");
                    self.record_instance(name, "skipped");
                    result.record_skip(name, reason);
                }
            }
        }

        let mut unscheduled = self
            .execute_round(&runnable, instances, force_update, 1, result)
            .await;

        if self.config.retry_failed_instances {
            for round in 1..=self.config.max_retry_attempts {
                if result.failed_instances.is_empty() || self.stop.is_requested() {
                    break;
                }
                let delay = self.config.retry_round_delay(round);
                info!(
                    target: TARGET,
                    round,
                    delay_secs = delay.as_secs_f64(),
                    failed = result.failed_instances.len(),
                    "batch retry scheduled"
                );
                if !self.pause(delay).await {
                    break;
                }
                result.retry_rounds = round;
                let retry: Vec<String> = result.failed_instances.keys().cloned().collect();
                unscheduled |= self
                    .execute_round(&retry, instances, force_update, round + 1, result)
                    .await;
            }
        }

        let cancelled = self.stop.is_requested()
            && (unscheduled || !result.failed_instances.is_empty());
        result.finalize(started.elapsed(), cancelled);
        Ok(())
    }

    /// `Ok(Some(reason))` marks the instance skipped; `Err` aborts validation.
    fn validate_instance(
        &self,
        name: &str,
        config: &InstanceConfig,
    ) -> anyhow::Result<Option<String>> {
        for directory in &config.directories {
            if let Err(err) = fs::create_dir_all(directory) {
                return Ok(Some(format!(
                    "directory {} cannot be created: {err}",
                    directory.display()
                )));
            }
            let probe = directory.join(format!(".upkeep-write-probe-{}", std::process::id()));
            if let Err(err) = fs::write(&probe, b"").and_then(|()| fs::remove_file(&probe)) {
                return Ok(Some(format!(
                    "directory {} is not writable: {err}",
                    directory.display()
                )));
            }
        }
        let active = self
            .processors
            .active_processors(name)
            .with_context(|| format!("active processor lookup failed for {name}"))?;
        if active > 0 {
            return Ok(Some(format!("{active} processor(s) already active")));
        }
        debug!(target: TARGET, instance = name, "instance validated");
        Ok(None)
    }

    /// Run `names` through the admission limiter. Returns true when a stop
    /// request left some of them unscheduled.
    async fn execute_round(
        &self,
        names: &[String],
        instances: &IndexMap<String, InstanceConfig>,
        force_update: bool,
        attempt: u32,
        result: &mut OrchestrationResult,
    ) -> bool {
        let limiter = Arc::new(Semaphore::new(self.config.max_concurrent_instances.max(1)));
        let timeout = self.config.instance_timeout();
        let mut unscheduled = false;
        let mut tasks = Vec::with_capacity(names.len());

        for name in names {
            let Some(config) = instances.get(name) else {
                continue;
            };
            let permit = if self.stop.is_requested() {
                None
            } else {
                tokio::select! {
                    permit = limiter.clone().acquire_owned() => permit.ok(),
                    _ = self.stop.wait() => None,
                }
            };
            let Some(permit) = permit else {
                unscheduled = true;
                if attempt == 1 {
                    result.record_skip(name, "stop requested before start");
                }
                continue;
            };

            let updater = match self.factory.create(name, config) {
                Ok(updater) => updater,
                Err(err) => {
                    let error = format!("unable to create updater: {err:#}");
                    warn!(target: TARGET, instance = %name, attempt, error = %error, "instance failed");
                    self.record_instance(name, "failed");
                    result.record_failure(name, attempt, error);
                    continue;
                }
            };
            let request = UpdateRequest {
                instance: name.clone(),
                force_update,
                stop: self.stop.clone(),
            };
            debug!(target: TARGET, instance = %name, attempt, "instance update started");
            let handle = tokio::spawn(async move {
                let _permit = permit;
                let begun = Instant::now();
                let outcome: AttemptOutcome =
                    match tokio::time::timeout(timeout, updater.run_instance_update(&request)).await {
                        Ok(Ok(mut report)) => {
                            report.duration = begun.elapsed();
                            report.attempt = attempt;
                            Ok(report)
                        }
                        Ok(Err(err)) => Err(format!("{err:#}")),
                        Err(_) => Err(format!("timed out after {:.0}s", timeout.as_secs_f64())),
                    };
                outcome
            });
            tasks.push((name.clone(), handle));
        }

        for (name, handle) in tasks {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join) if join.is_panic() => Err("instance update panicked".to_owned()),
                Err(_) => Err("instance update task was cancelled".to_owned()),
            };
            match outcome {
                Ok(report) => {
                    info!(
                        target: TARGET,
                        instance = %name,
                        attempt,
                        items = report.items_processed,
                        errors = report.errors,
                        elapsed_secs = report.duration.as_secs_f64(),
                        "instance updated"
                    );
                    self.record_instance(&name, "success");
                    if let Some(metrics) = &self.metrics {
                        metrics.add_items(report.items_processed);
                    }
                    result.record_success(&name, report);
                }
                Err(error) => {
                    warn!(target: TARGET, instance = %name, attempt, error = %error, "instance failed");
                    self.record_instance(&name, "failed");
                    result.record_failure(&name, attempt, error);
                }
            }
        }
        unscheduled
    }

    fn persist(&self, store: &ReportStore, result: &OrchestrationResult) {
        match store.write(
            ORCHESTRATION_REPORT_PREFIX,
            &result.id.to_string(),
            result.started_at,
            result,
        ) {
            Ok(path) => {
                info!(target: TARGET, run_id = %result.id, path = %path.display(), "orchestration report persisted")
            }
            Err(err) => {
                error!(target: TARGET, run_id = %result.id, error = %format!("{err:#}"), "failed to persist orchestration report")
            }
        }
        let retention =
            Duration::from_secs(u64::from(self.config.report_retention_days) * SECONDS_PER_DAY);
        if let Err(err) = store.prune_older_than(ORCHESTRATION_REPORT_PREFIX, retention) {
            warn!(target: TARGET, error = %format!("{err:#}"), "report retention sweep failed");
        }
    }

    fn record_instance(&self, instance: &str, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_instance(instance, outcome);
        }
    }

    async fn pause(&self, delay: Duration) -> bool {
        if self.stop.is_requested() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.stop.wait() => {
                info!(target: TARGET, "batch retry wait interrupted by stop request");
                false
            }
        }
    }
}
