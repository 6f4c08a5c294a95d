//! ---
//! upkeep_section: "08-scheduling"
//! upkeep_subsection: "tests"
//! upkeep_type: "test"
//! upkeep_scope: "tests"
//! upkeep_description: "End-to-end scheduling runs against in-memory host seams."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::fs;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;
use upkeep_common::{AppConfig, InMemoryProcessorRegistry, InstanceConfig, PathsConfig, SchedulingConfig};
use upkeep_core::{
    run_basic_update, run_full_update, HostSeams, PhaseOutcome, SchedulingCoordinator, SchedulingPhase,
    SchedulingRequest, ServiceContext,
};
use upkeep_host::{InMemoryProcessTable, InMemoryResourceSampler};
use upkeep_metrics::new_registry;
use upkeep_orchestrator::{
    InstanceUpdateManager, InstanceUpdateReport, InstanceUpdaterFactory, UpdateRequest,
};

#[derive(Default)]
struct CountingFactory {
    calls: Arc<AtomicU32>,
}

struct CountingUpdater {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl InstanceUpdateManager for CountingUpdater {
    async fn run_instance_update(&self, _request: &UpdateRequest) -> Result<InstanceUpdateReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(InstanceUpdateReport {
            items_processed: 3,
            ..InstanceUpdateReport::default()
        })
    }
}

impl InstanceUpdaterFactory for CountingFactory {
    fn create(&self, _instance: &str, _config: &InstanceConfig) -> Result<Arc<dyn InstanceUpdateManager>> {
        Ok(Arc::new(CountingUpdater {
            calls: self.calls.clone(),
        }))
    }
}

struct Harness {
    _root: TempDir,
    paths: PathsConfig,
    sampler: Arc<InMemoryResourceSampler>,
    calls: Arc<AtomicU32>,
    context: Arc<ServiceContext>,
}

fn harness(disk_percent: f32) -> Harness {
    harness_with(disk_percent, |_| {})
}

fn harness_with(disk_percent: f32, tweak: impl FnOnce(&mut AppConfig)) -> Harness {
    let root = TempDir::new().unwrap();
    let mut config = AppConfig::default();
    config.paths = PathsConfig::rooted_at(root.path());
    config.health.network_endpoints.clear();
    for name in ["alpha", "beta"] {
        config.instances.insert(
            name.to_owned(),
            InstanceConfig {
                directories: vec![root.path().join("data").join(name)],
                ..InstanceConfig::default()
            },
        );
    }
    tweak(&mut config);

    let sampler = Arc::new(InMemoryResourceSampler::new());
    sampler.set_disk_percent("/", disk_percent);
    let host = HostSeams {
        processes: Arc::new(InMemoryProcessTable::new(1)),
        sampler: sampler.clone(),
        processors: Arc::new(InMemoryProcessorRegistry::new()),
    };
    let factory = CountingFactory::default();
    let calls = factory.calls.clone();
    let paths = config.paths.clone();
    let context =
        Arc::new(ServiceContext::new(config, host, Arc::new(factory), new_registry()).unwrap());
    Harness {
        _root: root,
        paths,
        sampler,
        calls,
        context,
    }
}

#[tokio::test(start_paused = true)]
async fn full_run_passes_every_gate() {
    let h = harness(10.0);
    let coordinator = SchedulingCoordinator::new(h.context.clone());

    let result = coordinator
        .execute_scheduled_update(SchedulingRequest::default())
        .await;

    assert!(result.success, "{}", result.message);
    assert_eq!(result.outcome, PhaseOutcome::Passed);
    assert_eq!(result.final_phase, SchedulingPhase::Finalized);
    assert!(result.health_check_passed);
    assert!(result.conflicts_resolved);
    let orchestration = result.orchestration_result.as_ref().unwrap();
    assert_eq!(orchestration.instance_results.len(), 2);
    assert_eq!(orchestration.total_items_processed, 6);
    assert_eq!(result.recovery.as_ref().unwrap().attempts.len(), 1);
    assert_eq!(h.calls.load(Ordering::SeqCst), 2);
    assert!(!h.paths.lock_file.exists());
    assert!(h.paths.log_directory.join("monthly_orchestration.log").exists());

    let status = coordinator.status();
    assert_eq!(status.phase, SchedulingPhase::Finalized);
    assert!(!status.in_progress);
    assert_eq!(status.executions, 1);
    assert_eq!(status.success_rate, 1.0);
}

#[tokio::test]
async fn critical_disk_aborts_before_the_lock() {
    let h = harness(97.0);
    let coordinator = SchedulingCoordinator::new(h.context.clone());

    let result = coordinator
        .execute_scheduled_update(SchedulingRequest::default())
        .await;

    assert!(!result.success);
    assert!(!result.health_check_passed);
    assert!(result.orchestration_result.is_none());
    assert_eq!(result.final_phase, SchedulingPhase::Aborted);
    match &result.outcome {
        PhaseOutcome::HealthFailed(reasons) => {
            assert!(reasons.iter().any(|reason| reason.contains("disk_space")))
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(!h.paths.lock_file.exists());
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        fs::read_dir(&h.paths.report_directory)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry
                .file_name()
                .to_string_lossy()
                .starts_with("scheduled-execution-"))
            .count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn forced_execution_continues_past_failed_health() {
    let h = harness(97.0);
    let coordinator = SchedulingCoordinator::new(h.context.clone());

    let result = coordinator
        .execute_scheduled_update(SchedulingRequest {
            force_execution: true,
            ..SchedulingRequest::default()
        })
        .await;

    assert!(result.success);
    assert!(!result.health_check_passed);
    assert!(result
        .actions
        .iter()
        .any(|action| action.contains("execution is forced")));
}

#[tokio::test(start_paused = true)]
async fn held_lock_blocks_at_conflict_gate() {
    let h = harness(10.0);
    let _held = h
        .context
        .orchestrator()
        .lock()
        .try_acquire()
        .unwrap()
        .unwrap();
    let coordinator = SchedulingCoordinator::new(h.context.clone());

    let result = coordinator
        .execute_scheduled_update(SchedulingRequest::default())
        .await;

    assert!(!result.success);
    assert!(result.health_check_passed);
    assert!(!result.conflicts_resolved);
    assert!(matches!(result.outcome, PhaseOutcome::ConflictUnresolved(_)));
    assert_eq!(result.conflicts_detected.len(), 1);
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn lock_file_left_by_a_killed_run_does_not_block() {
    let h = harness(10.0);
    fs::create_dir_all(h.paths.lock_file.parent().unwrap()).unwrap();
    fs::write(&h.paths.lock_file, b"{\"pid\": 4242}").unwrap();
    let coordinator = SchedulingCoordinator::new(h.context.clone());

    let result = coordinator
        .execute_scheduled_update(SchedulingRequest::default())
        .await;

    assert!(result.success, "{}", result.message);
    assert!(result.conflicts_detected.is_empty());
    assert_eq!(h.calls.load(Ordering::SeqCst), 2);
    assert!(!h.paths.lock_file.exists());
}

#[tokio::test(start_paused = true)]
async fn basic_entry_point_skips_the_gates() {
    let h = harness(97.0);

    let result = run_basic_update(h.context.clone(), SchedulingRequest::default()).await;

    assert!(result.success);
    assert!(result.health_status.is_none());
    assert!(result.recovery.is_none());
    assert_eq!(h.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn exhausted_recovery_yields_failed_result() {
    let h = harness(10.0);
    let _held = h
        .context
        .orchestrator()
        .lock()
        .try_acquire()
        .unwrap()
        .unwrap();
    let config = SchedulingConfig {
        enable_error_recovery: true,
        ..SchedulingConfig::basic()
    };
    let coordinator = SchedulingCoordinator::with_config(h.context.clone(), config);

    let result = coordinator
        .execute_scheduled_update(SchedulingRequest::default())
        .await;

    assert!(!result.success);
    assert_eq!(result.final_phase, SchedulingPhase::Aborted);
    assert!(result.error.as_deref().unwrap().contains("already running"));
    let recovery = result.recovery.as_ref().unwrap();
    assert_eq!(recovery.attempts.len(), 3);
    assert!(!recovery.success);
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_instance_is_reported_not_raised() {
    let h = harness(10.0);
    let coordinator = SchedulingCoordinator::new(h.context.clone());

    let result = coordinator
        .execute_scheduled_update(SchedulingRequest {
            instances: vec!["gamma".to_owned()],
            ..SchedulingRequest::default()
        })
        .await;

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("unknown instance"));
    assert!(!coordinator.status().in_progress);
}

#[tokio::test(start_paused = true)]
async fn statistics_export_writes_json_and_textfile() {
    let h = harness(10.0);
    h.sampler.set_disk_percent("/", 20.0);
    let coordinator = SchedulingCoordinator::new(h.context.clone());
    coordinator
        .execute_scheduled_update(SchedulingRequest::default())
        .await;

    let path = h.context.export_statistics().unwrap();
    let exported: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(exported["scheduling"]["executions"], 1);
    assert!(exported["generated_at"].is_string());
    let metrics = fs::read_to_string(h.paths.stats_directory.join("upkeep.prom")).unwrap();
    assert!(metrics.contains("upkeep_"));
}

#[tokio::test(start_paused = true)]
async fn configured_toggles_apply_to_full_entry_point() {
    let h = harness_with(97.0, |config| {
        config.scheduling.enable_health_checks = false;
    });

    let result = run_full_update(h.context.clone(), SchedulingRequest::default()).await;

    assert!(result.success, "{}", result.message);
    assert!(result.health_status.is_none());
    assert!(result.recovery.is_some());
    assert!(result
        .actions
        .iter()
        .any(|action| action.contains("health checks disabled")));
}

#[tokio::test(start_paused = true)]
async fn entry_points_share_one_history() {
    let h = harness(10.0);

    run_full_update(h.context.clone(), SchedulingRequest::default()).await;
    run_basic_update(h.context.clone(), SchedulingRequest::default()).await;

    let status = h.context.scheduling_state().status();
    assert_eq!(status.executions, 2);
    assert_eq!(status.phase, SchedulingPhase::Finalized);
    assert!(!status.in_progress);
    assert_eq!(h.context.statistics().scheduling.executions, 2);
    assert_eq!(
        SchedulingCoordinator::new(h.context.clone()).history(10).len(),
        2
    );
}

#[tokio::test(start_paused = true)]
async fn cancelled_execution_clears_in_progress() {
    let h = harness(10.0);
    let held = h
        .context
        .orchestrator()
        .lock()
        .try_acquire()
        .unwrap()
        .unwrap();
    let config = SchedulingConfig {
        enable_error_recovery: true,
        ..SchedulingConfig::basic()
    };
    let coordinator = SchedulingCoordinator::with_config(h.context.clone(), config);

    let cancelled = tokio::time::timeout(
        Duration::from_millis(500),
        coordinator.execute_scheduled_update(SchedulingRequest::default()),
    )
    .await;
    assert!(cancelled.is_err());

    let status = coordinator.status();
    assert!(!status.in_progress);
    assert_eq!(status.phase, SchedulingPhase::Aborted);

    drop(held);
    let result = run_basic_update(h.context.clone(), SchedulingRequest::default()).await;
    assert!(result.success, "{}", result.message);
}
