//! ---
//! upkeep_section: "07-orchestration"
//! upkeep_subsection: "tests"
//! upkeep_type: "test"
//! upkeep_scope: "tests"
//! upkeep_description: "Locked, bounded-concurrency instance orchestration."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tempfile::TempDir;
use upkeep_common::{
    ActiveProcessorLookup, InMemoryProcessorRegistry, InstanceConfig, OrchestrationConfig,
    PathsConfig, ReportStore,
};
use upkeep_orchestrator::{
    InstanceUpdateManager, InstanceUpdateReport, InstanceUpdaterFactory, OrchestrationError,
    OrchestrationStatus, Orchestrator, UpdateRequest, ORCHESTRATION_REPORT_PREFIX,
};

#[derive(Clone, Copy)]
enum Script {
    Succeed(u64),
    FailTimes(u32, u64),
    AlwaysFail,
    Hang,
}

struct ScriptedUpdater {
    script: Script,
    calls: Arc<Mutex<HashMap<String, u32>>>,
}

#[async_trait]
impl InstanceUpdateManager for ScriptedUpdater {
    async fn run_instance_update(&self, request: &UpdateRequest) -> Result<InstanceUpdateReport> {
        let call = {
            let mut calls = self.calls.lock();
            let entry = calls.entry(request.instance.clone()).or_default();
            *entry += 1;
            *entry
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        match self.script {
            Script::Succeed(items) => Ok(InstanceUpdateReport {
                items_processed: items,
                ..InstanceUpdateReport::default()
            }),
            Script::FailTimes(times, items) if call > times => Ok(InstanceUpdateReport {
                items_processed: items,
                ..InstanceUpdateReport::default()
            }),
            Script::FailTimes(..) => bail!("connection reset by peer"),
            Script::AlwaysFail => bail!("permission denied writing index"),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(7 * 24 * 3600)).await;
                Ok(InstanceUpdateReport::default())
            }
        }
    }
}

#[derive(Default)]
struct ScriptedFactory {
    scripts: HashMap<String, Script>,
    calls: Arc<Mutex<HashMap<String, u32>>>,
}

impl ScriptedFactory {
    fn with(mut self, instance: &str, script: Script) -> Self {
        self.scripts.insert(instance.to_owned(), script);
        self
    }

    fn calls(&self, instance: &str) -> u32 {
        self.calls.lock().get(instance).copied().unwrap_or(0)
    }
}

impl InstanceUpdaterFactory for ScriptedFactory {
    fn create(
        &self,
        instance: &str,
        _config: &InstanceConfig,
    ) -> Result<Arc<dyn InstanceUpdateManager>> {
        let script = self
            .scripts
            .get(instance)
            .copied()
            .ok_or_else(|| anyhow!("no script for {instance}"))?;
        Ok(Arc::new(ScriptedUpdater {
            script,
            calls: self.calls.clone(),
        }))
    }
}

struct FailingLookup;

impl ActiveProcessorLookup for FailingLookup {
    fn active_processors(&self, _instance: &str) -> Result<usize> {
        bail!("state store unreachable")
    }
}

fn instances(names: &[&str]) -> IndexMap<String, InstanceConfig> {
    names
        .iter()
        .map(|name| ((*name).to_owned(), InstanceConfig::default()))
        .collect()
}

fn config(retry_rounds: u32) -> OrchestrationConfig {
    OrchestrationConfig {
        max_concurrent_instances: 2,
        retry_failed_instances: retry_rounds > 0,
        max_retry_attempts: retry_rounds,
        ..OrchestrationConfig::default()
    }
}

fn orchestrator(
    root: &TempDir,
    config: &OrchestrationConfig,
    factory: Arc<ScriptedFactory>,
    lookup: Arc<dyn ActiveProcessorLookup>,
) -> (Orchestrator, PathsConfig) {
    let paths = PathsConfig::rooted_at(root.path());
    (Orchestrator::new(config, &paths, factory, lookup), paths)
}

#[tokio::test(start_paused = true)]
async fn failing_instance_does_not_affect_siblings() {
    let root = TempDir::new().unwrap();
    let factory = Arc::new(
        ScriptedFactory::default()
            .with("alpha", Script::AlwaysFail)
            .with("beta", Script::Succeed(7)),
    );
    let (orchestrator, paths) = orchestrator(
        &root,
        &config(0),
        factory.clone(),
        Arc::new(InMemoryProcessorRegistry::new()),
    );

    let result = orchestrator
        .run_monthly_updates(&instances(&["alpha", "beta"]), false)
        .await
        .unwrap();

    assert_eq!(result.status, OrchestrationStatus::PartialFailure);
    assert!(result.failed_instances.contains_key("alpha"));
    assert_eq!(result.instance_results["beta"].items_processed, 7);
    assert!(!result.instance_results.contains_key("alpha"));
    assert_eq!(result.total_items_processed, 7);
    assert!(!paths.lock_file.exists());
    assert_eq!(
        ReportStore::new(&paths.report_directory)
            .unwrap()
            .list(ORCHESTRATION_REPORT_PREFIX)
            .len(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn batch_retry_recovers_flaky_instance() {
    let root = TempDir::new().unwrap();
    let factory = Arc::new(
        ScriptedFactory::default()
            .with("a", Script::Succeed(1))
            .with("b", Script::FailTimes(1, 2))
            .with("c", Script::Succeed(3)),
    );
    let (orchestrator, _paths) = orchestrator(
        &root,
        &config(1),
        factory.clone(),
        Arc::new(InMemoryProcessorRegistry::new()),
    );

    let result = orchestrator
        .run_monthly_updates(&instances(&["a", "b", "c"]), false)
        .await
        .unwrap();

    assert_eq!(result.status, OrchestrationStatus::Completed);
    assert_eq!(result.instance_results.len(), 3);
    assert!(result.failed_instances.is_empty());
    assert_eq!(result.retry_rounds, 1);
    assert_eq!(result.instance_results["b"].attempt, 2);
    assert_eq!(factory.calls("b"), 2);
    assert_eq!(factory.calls("a"), 1);
    assert!(result.duration >= Duration::from_secs(60));
    assert_eq!(result.total_items_processed, 6);
}

#[tokio::test(start_paused = true)]
async fn busy_instance_is_skipped_not_failed() {
    let root = TempDir::new().unwrap();
    let registry = InMemoryProcessorRegistry::new();
    registry.set("alpha", 2);
    let factory = Arc::new(
        ScriptedFactory::default()
            .with("alpha", Script::Succeed(1))
            .with("beta", Script::Succeed(1)),
    );
    let (orchestrator, _paths) =
        orchestrator(&root, &config(2), factory.clone(), Arc::new(registry));

    let result = orchestrator
        .run_monthly_updates(&instances(&["alpha", "beta"]), false)
        .await
        .unwrap();

    assert!(result.skipped_instances["alpha"].contains("already active"));
    assert!(result.failed_instances.is_empty());
    assert_eq!(factory.calls("alpha"), 0);
    assert_eq!(result.status, OrchestrationStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn hung_instance_times_out() {
    let root = TempDir::new().unwrap();
    let factory = Arc::new(
        ScriptedFactory::default()
            .with("slow", Script::Hang)
            .with("fast", Script::Succeed(1)),
    );
    let mut cfg = config(0);
    cfg.instance_timeout_hours = 1.0;
    let (orchestrator, _paths) = orchestrator(
        &root,
        &cfg,
        factory,
        Arc::new(InMemoryProcessorRegistry::new()),
    );

    let result = orchestrator
        .run_monthly_updates(&instances(&["slow", "fast"]), false)
        .await
        .unwrap();

    assert!(result.failed_instances["slow"].contains("timed out"));
    assert!(result.instance_results.contains_key("fast"));
}

#[tokio::test]
async fn validation_error_releases_lock_and_persists_report() {
    let root = TempDir::new().unwrap();
    let factory = Arc::new(ScriptedFactory::default().with("alpha", Script::Succeed(1)));
    let (orchestrator, paths) =
        orchestrator(&root, &config(0), factory.clone(), Arc::new(FailingLookup));

    let err = orchestrator
        .run_monthly_updates(&instances(&["alpha"]), false)
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestrationError::Validation(_)));
    assert!(!paths.lock_file.exists());
    assert!(orchestrator.lock().try_acquire().unwrap().is_some());
    assert_eq!(factory.calls("alpha"), 0);
    assert_eq!(
        ReportStore::new(&paths.report_directory)
            .unwrap()
            .list(ORCHESTRATION_REPORT_PREFIX)
            .len(),
        1
    );
}

#[tokio::test]
async fn held_lock_reports_already_running() {
    let root = TempDir::new().unwrap();
    let factory = Arc::new(ScriptedFactory::default().with("alpha", Script::Succeed(1)));
    let (orchestrator, _paths) = orchestrator(
        &root,
        &config(0),
        factory.clone(),
        Arc::new(InMemoryProcessorRegistry::new()),
    );
    let _held = orchestrator.lock().try_acquire().unwrap().unwrap();

    let err = orchestrator
        .run_monthly_updates(&instances(&["alpha"]), false)
        .await
        .unwrap_err();

    match err {
        OrchestrationError::AlreadyRunning { owner } => {
            assert_eq!(owner.unwrap().pid, std::process::id());
        }
        other => panic!("expected already running, got {other}"),
    }
    assert_eq!(factory.calls("alpha"), 0);
}

#[tokio::test(start_paused = true)]
async fn stop_request_prevents_unstarted_instances() {
    let root = TempDir::new().unwrap();
    let factory = Arc::new(
        ScriptedFactory::default()
            .with("a", Script::Succeed(1))
            .with("b", Script::Succeed(1))
            .with("c", Script::Succeed(1)),
    );
    let mut cfg = config(0);
    cfg.max_concurrent_instances = 1;
    let (orchestrator, _paths) = orchestrator(
        &root,
        &cfg,
        factory.clone(),
        Arc::new(InMemoryProcessorRegistry::new()),
    );
    let orchestrator = Arc::new(orchestrator);

    let runner = orchestrator.clone();
    let run = tokio::spawn(async move {
        runner
            .run_monthly_updates(&instances(&["a", "b", "c"]), false)
            .await
    });
    tokio::time::sleep(Duration::from_millis(500)).await;
    orchestrator.request_shutdown();

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.status, OrchestrationStatus::Cancelled);
    assert!(result.instance_results.contains_key("a"));
    assert_eq!(factory.calls("b"), 0);
    assert_eq!(factory.calls("c"), 0);
    assert_eq!(result.skipped_instances.len(), 2);
}
