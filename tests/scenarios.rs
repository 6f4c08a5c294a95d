//! ---
//! upkeep_section: "15-testing-qa-runbook"
//! upkeep_subsection: "integration-tests"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Cross-crate scenarios for the upkeep stack."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use tempfile::TempDir;
use upkeep_common::{AppConfig, InMemoryProcessorRegistry, InstanceConfig, PathsConfig};
use upkeep_core::{run_full_update, HostSeams, PhaseOutcome, SchedulingPhase, SchedulingRequest, ServiceContext};
use upkeep_host::{InMemoryProcessTable, InMemoryResourceSampler};
use upkeep_metrics::new_registry;
use upkeep_orchestrator::{
    InstanceUpdateManager, InstanceUpdateReport, InstanceUpdaterFactory, OrchestrationError,
    UpdateRequest,
};

/// Instances named `bad*` always fail; every update takes five seconds.
struct SlowFactory;

struct SlowUpdater {
    fails: bool,
}

#[async_trait]
impl InstanceUpdateManager for SlowUpdater {
    async fn run_instance_update(&self, request: &UpdateRequest) -> Result<InstanceUpdateReport> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        if self.fails {
            bail!("{} rejected the batch", request.instance);
        }
        Ok(InstanceUpdateReport {
            items_processed: 10,
            ..InstanceUpdateReport::default()
        })
    }
}

impl InstanceUpdaterFactory for SlowFactory {
    fn create(&self, instance: &str, _config: &InstanceConfig) -> Result<Arc<dyn InstanceUpdateManager>> {
        Ok(Arc::new(SlowUpdater {
            fails: instance.starts_with("bad"),
        }))
    }
}

fn config_at(root: &Path, instances: &[&str]) -> AppConfig {
    let mut config = AppConfig::default();
    config.paths = PathsConfig::rooted_at(root);
    config.health.network_endpoints.clear();
    for name in instances {
        config.instances.insert(
            (*name).to_owned(),
            InstanceConfig {
                directories: vec![root.join("data").join(name)],
                ..InstanceConfig::default()
            },
        );
    }
    config
}

fn context(config: AppConfig) -> Arc<ServiceContext> {
    let sampler = Arc::new(InMemoryResourceSampler::new());
    sampler.set_disk_percent("/", 15.0);
    let host = HostSeams {
        processes: Arc::new(InMemoryProcessTable::new(1)),
        sampler,
        processors: Arc::new(InMemoryProcessorRegistry::new()),
    };
    Arc::new(ServiceContext::new(config, host, Arc::new(SlowFactory), new_registry()).unwrap())
}

fn instances(context: &ServiceContext) -> IndexMap<String, InstanceConfig> {
    context.config().instances.clone()
}

#[tokio::test(start_paused = true)]
async fn two_services_sharing_a_lock_run_one_at_a_time() {
    let root = TempDir::new().unwrap();
    let config = config_at(root.path(), &["alpha"]);
    let lock_file = config.paths.lock_file.clone();
    let first = context(config.clone());
    let second = context(config);
    let (a, b) = (instances(&first), instances(&second));
    let first_orchestrator = first.orchestrator();
    let second_orchestrator = second.orchestrator();

    let (left, right) = tokio::join!(
        first_orchestrator.run_monthly_updates(&a, false),
        second_orchestrator.run_monthly_updates(&b, false),
    );

    let outcomes = [left, right];
    assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|outcome| matches!(outcome, Err(OrchestrationError::AlreadyRunning { .. })))
            .count(),
        1
    );
    assert!(!lock_file.exists());
}

#[tokio::test(start_paused = true)]
async fn failing_instance_does_not_taint_the_others() {
    let root = TempDir::new().unwrap();
    let ctx = context(config_at(root.path(), &["alpha", "bad-one", "gamma"]));

    let result = run_full_update(ctx.clone(), SchedulingRequest::default()).await;

    assert_eq!(result.outcome, PhaseOutcome::Passed);
    assert_eq!(result.final_phase, SchedulingPhase::Finalized);
    assert!(!result.success);
    let orchestration = result.orchestration_result.as_ref().unwrap();
    assert!(orchestration.failed_instances.contains_key("bad-one"));
    assert_eq!(orchestration.instance_results.len(), 2);
    assert_eq!(orchestration.instance_results["alpha"].items_processed, 10);
    assert_eq!(orchestration.instance_results["gamma"].items_processed, 10);
    assert!(result.message.contains("bad-one"));
    assert!(!ctx.config().paths.lock_file.exists());
}

#[tokio::test(start_paused = true)]
async fn stop_before_start_is_reported_as_cancelled() {
    let root = TempDir::new().unwrap();
    let ctx = context(config_at(root.path(), &["alpha"]));
    ctx.shutdown().request();

    let result = run_full_update(ctx.clone(), SchedulingRequest::default()).await;

    assert!(!result.success);
    assert_eq!(result.final_phase, SchedulingPhase::Aborted);
    assert!(result.orchestration_result.is_none());
    assert!(result.error.as_deref().unwrap().contains("cancelled"));
    assert!(!ctx.config().paths.lock_file.exists());
}

#[tokio::test]
async fn cleanup_keeps_old_lock_while_orchestrator_holds_it() {
    let root = TempDir::new().unwrap();
    let ctx = context(config_at(root.path(), &["alpha"]));
    let lock_dir = ctx.config().paths.lock_directory.clone();
    let aged = SystemTime::now() - Duration::from_secs(7 * 3600);

    let guard = ctx.orchestrator().lock().try_acquire().unwrap().unwrap();
    File::options()
        .write(true)
        .open(guard.path())
        .unwrap()
        .set_modified(aged)
        .unwrap();
    let abandoned = lock_dir.join("abandoned_job.lock");
    fs::write(&abandoned, b"{}").unwrap();
    File::options()
        .write(true)
        .open(&abandoned)
        .unwrap()
        .set_modified(aged)
        .unwrap();

    let resolver = ctx.conflicts();
    assert_eq!(resolver.cleanup_stale_locks().unwrap(), 1);
    assert!(guard.path().exists());
    assert!(!abandoned.exists());
    assert_eq!(resolver.cleanup_stale_locks().unwrap(), 0);

    let held = guard.path().to_path_buf();
    drop(guard);
    assert!(!held.exists());
}
