//! ---
//! upkeep_section: "09-binary"
//! upkeep_subsection: "binary"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Binary entrypoint running scheduled upkeep and its diagnostics."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use upkeep_common::{init_tracing, AppConfig, ShutdownFlag};
use upkeep_core::{
    run_basic_update, run_full_update, SchedulingRequest, SchedulingResult, ServiceContext,
};
use upkeep_health::is_system_ready_for_update;

mod updater;

use updater::CommandUpdaterFactory;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Single-host orchestration of periodic bulk instance updates",
    long_about = None
)]
struct Cli {
    /// Configuration file; `UPKEEP_CONFIG` takes precedence when set.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run one scheduled execution")]
    Run(RunArgs),
    #[command(about = "Run the health probes and report readiness")]
    Health(ScopeArgs),
    #[command(about = "Detect conflicts and optionally resolve them")]
    Conflicts(ConflictArgs),
    #[command(about = "Remove stale lock files")]
    CleanupLocks,
    #[command(about = "Write the statistics export and print it")]
    Stats,
}

#[derive(Debug, Args, Default)]
struct ScopeArgs {
    /// Restrict to these instances; repeat for several.
    #[arg(long = "instance", value_name = "NAME")]
    instances: Vec<String>,
}

#[derive(Debug, Args, Default)]
struct RunArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    /// Re-process items even when they look current.
    #[arg(long)]
    force_update: bool,
    /// Continue past failed health or conflict gates.
    #[arg(long)]
    force_execution: bool,
    /// Skip the gates and the recovery wrapper.
    #[arg(long)]
    basic: bool,
}

#[derive(Debug, Args)]
struct ConflictArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    /// Apply the resolution strategies after detection.
    #[arg(long)]
    resolve: bool,
}

const DEFAULT_CONFIG_CANDIDATES: &[&str] = &["/etc/upkeep/upkeep.toml", "upkeep.toml"];

/// Conventional exit status after an interrupt (128 + SIGINT).
const INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.extend(DEFAULT_CONFIG_CANDIDATES.iter().map(PathBuf::from));

    let loaded = AppConfig::load_with_source(&candidates)?;
    init_tracing("upkeepd", &loaded.config.logging)?;
    info!(config_path = %loaded.source.display(), "configuration loaded");

    let context = Arc::new(
        ServiceContext::init(loaded.config, Arc::new(CommandUpdaterFactory))
            .context("failed to initialise service context")?,
    );

    let code = match cli.command.unwrap_or_else(|| Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(context.clone(), args).await?,
        Commands::Health(scope) => health(&context, &scope).await?,
        Commands::Conflicts(args) => conflicts(&context, &args).await?,
        Commands::CleanupLocks => {
            let removed = context.conflicts().cleanup_stale_locks()?;
            println!("removed {removed} stale lock file(s)");
            ExitCode::SUCCESS
        }
        Commands::Stats => {
            let path = context.export_statistics()?;
            print_json(&context.statistics())?;
            info!(path = %path.display(), "statistics written");
            ExitCode::SUCCESS
        }
    };
    Ok(code)
}

async fn run(context: Arc<ServiceContext>, args: RunArgs) -> Result<ExitCode> {
    let mut signals = spawn_signal_listener();
    let basic = args.basic;
    let request = SchedulingRequest {
        instances: args.scope.instances,
        force_update: args.force_update,
        force_execution: args.force_execution,
    };
    let execution = async {
        if basic {
            run_basic_update(context.clone(), request).await
        } else {
            run_full_update(context.clone(), request).await
        }
    };
    let result: Option<SchedulingResult> =
        drive_until_interrupted(execution, context.shutdown(), &mut signals).await;
    if let Err(err) = context.teardown() {
        warn!(error = %format!("{err:#}"), "statistics export failed");
    }
    match result {
        Some(result) => {
            print_json(&result)?;
            Ok(exit_code(result.success))
        }
        None => Ok(ExitCode::from(INTERRUPTED)),
    }
}

/// Drive `run` to completion while watching for termination signals.
///
/// The first signal raises the cooperative stop flag and keeps driving `run`.
/// A second one drops the future, so its lock guard and child processes are
/// released before the caller exits, and yields `None`.
async fn drive_until_interrupted<T>(
    run: impl Future<Output = T>,
    shutdown: &ShutdownFlag,
    signals: &mut mpsc::Receiver<()>,
) -> Option<T> {
    tokio::pin!(run);
    tokio::select! {
        biased;
        output = &mut run => return Some(output),
        Some(()) = signals.recv() => {
            warn!("termination signal received; requesting stop");
            shutdown.request();
        }
    }
    tokio::select! {
        biased;
        output = &mut run => Some(output),
        Some(()) = signals.recv() => {
            warn!("second signal received; abandoning the run");
            None
        }
    }
}

async fn health(context: &ServiceContext, scope: &ScopeArgs) -> Result<ExitCode> {
    let instances = context.config().select_instances(&scope.instances)?;
    let status = context
        .health()
        .run_comprehensive_health_check(Some(&instances))
        .await;
    let (ready, reasons) = is_system_ready_for_update(&status);
    print_json(&status)?;
    for reason in &reasons {
        eprintln!("blocking: {reason}");
    }
    Ok(exit_code(ready))
}

async fn conflicts(context: &ServiceContext, args: &ConflictArgs) -> Result<ExitCode> {
    let operation = context.config().scheduling.operation_name.clone();
    let instances = context.config().select_instances(&args.scope.instances)?;
    let scope: Vec<String> = instances.keys().cloned().collect();
    let resolver = context.conflicts();
    let detected = resolver.detect_conflicts(&operation, Some(scope.as_slice())).await;
    print_json(&detected)?;
    if !args.resolve {
        return Ok(exit_code(detected.is_empty()));
    }
    let resolution = resolver.resolve_conflicts(&detected, &operation).await;
    print_json(&resolution)?;
    Ok(exit_code(resolution.success))
}

/// Forward every SIGINT and SIGTERM into a channel consumed by the run loop.
fn spawn_signal_listener() -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        loop {
            wait_for_signal().await;
            if tx.send(()).await.is_err() {
                break;
            }
        }
    });
    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(err) => {
            warn!(error = %err, "SIGTERM handler unavailable; listening for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[tokio::test]
    async fn second_signal_abandons_the_run_and_releases_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let lock = upkeep_orchestrator::FileLock::new(dir.path().join("op.lock"));
        let shutdown = ShutdownFlag::new();
        let (tx, mut signals) = mpsc::channel(4);
        tx.send(()).await.unwrap();
        tx.send(()).await.unwrap();

        let run = async {
            let _guard = lock.acquire(std::time::Duration::ZERO).await.unwrap();
            std::future::pending::<()>().await;
        };
        let outcome = drive_until_interrupted(run, &shutdown, &mut signals).await;

        assert!(outcome.is_none());
        assert!(shutdown.is_requested());
        assert!(!lock.path().exists());
    }

    #[tokio::test]
    async fn first_signal_lets_the_run_wind_down() {
        let shutdown = ShutdownFlag::new();
        let (tx, mut signals) = mpsc::channel(4);
        tx.send(()).await.unwrap();

        let flag = shutdown.clone();
        let run = async move {
            flag.wait().await;
            "stopped"
        };
        let outcome = drive_until_interrupted(run, &shutdown, &mut signals).await;

        assert_eq!(outcome, Some("stopped"));
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "upkeepd",
            "--config",
            "/tmp/upkeep.toml",
            "run",
            "--instance",
            "alpha",
            "--instance",
            "beta",
            "--force-execution",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/upkeep.toml")));
        match cli.command {
            Some(Commands::Run(args)) => {
                assert_eq!(args.scope.instances, vec!["alpha", "beta"]);
                assert!(args.force_execution);
                assert!(!args.force_update);
                assert!(!args.basic);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
