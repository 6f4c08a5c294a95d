//! ---
//! upkeep_section: "09-binary"
//! upkeep_subsection: "binary"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Instance updater running each instance's configured command."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info};
use upkeep_common::InstanceConfig;
use upkeep_orchestrator::{
    InstanceUpdateManager, InstanceUpdateReport, InstanceUpdaterFactory, UpdateRequest,
};

const TARGET: &str = "upkeep::updater";

/// Builds a [`CommandUpdater`] from the instance's `command`.
#[derive(Debug, Default)]
pub struct CommandUpdaterFactory;

impl InstanceUpdaterFactory for CommandUpdaterFactory {
    fn create(
        &self,
        instance: &str,
        config: &InstanceConfig,
    ) -> Result<Arc<dyn InstanceUpdateManager>> {
        let command = config
            .command
            .clone()
            .filter(|command| !command.is_empty())
            .ok_or_else(|| anyhow!("instance '{instance}' has no command configured"))?;
        Ok(Arc::new(CommandUpdater {
            command,
            config: config.clone(),
        }))
    }
}

/// Runs one command per update. The child is killed if the orchestrator
/// drops the update (instance timeout).
#[derive(Debug)]
pub struct CommandUpdater {
    command: Vec<String>,
    config: InstanceConfig,
}

#[async_trait]
impl InstanceUpdateManager for CommandUpdater {
    async fn run_instance_update(&self, request: &UpdateRequest) -> Result<InstanceUpdateReport> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("empty command"))?;
        let mut command = Command::new(program);
        command
            .args(args)
            .env("UPKEEP_INSTANCE", &request.instance)
            .env("UPKEEP_FORCE_UPDATE", if request.force_update { "1" } else { "0" })
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(batch_size) = self.config.batch_size {
            command.env("UPKEEP_BATCH_SIZE", batch_size.to_string());
        }
        if !self.config.source_categories.is_empty() {
            command.env("UPKEEP_SOURCE_CATEGORIES", self.config.source_categories.join(","));
        }

        info!(target: TARGET, instance = %request.instance, program = %program, "starting instance command");
        let output = command
            .output()
            .await
            .with_context(|| format!("failed to spawn {program}"))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(target: TARGET, instance = %request.instance, stderr = %stderr.trim(), "instance command finished");

        if !output.status.success() {
            let tail = stderr.lines().last().unwrap_or("").trim();
            bail!(
                "instance command for {} exited with {}{}",
                request.instance,
                output.status,
                if tail.is_empty() {
                    String::new()
                } else {
                    format!(": {tail}")
                }
            );
        }
        Ok(parse_report(&stdout))
    }
}

/// The last stdout line that is a JSON object supplies the counters; any
/// other output leaves them at zero.
fn parse_report(stdout: &str) -> InstanceUpdateReport {
    let details = stdout
        .lines()
        .rev()
        .filter_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
        .find(Value::is_object);
    let Some(details) = details else {
        return InstanceUpdateReport::default();
    };
    InstanceUpdateReport {
        items_processed: details
            .get("items_processed")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        errors: details.get("errors").and_then(Value::as_u64).unwrap_or(0),
        details,
        ..InstanceUpdateReport::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use upkeep_common::ShutdownFlag;

    #[test]
    fn last_json_line_wins() {
        let report = parse_report(
            "starting\n{\"items_processed\": 1}\nprogress 50%\n{\"items_processed\": 12, \"errors\": 2}\ndone\n",
        );
        assert_eq!(report.items_processed, 12);
        assert_eq!(report.errors, 2);
    }

    #[test]
    fn plain_output_yields_empty_report() {
        assert_eq!(parse_report("ok\n"), InstanceUpdateReport::default());
    }

    #[test]
    fn missing_command_is_rejected() {
        let err = CommandUpdaterFactory
            .create("alpha", &InstanceConfig::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("no command"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_command_and_reads_counters() {
        let config = InstanceConfig {
            command: Some(vec![
                "sh".to_owned(),
                "-c".to_owned(),
                "echo \"{\\\"items_processed\\\": 4}\"; echo \"$UPKEEP_INSTANCE\" >&2".to_owned(),
            ]),
            ..InstanceConfig::default()
        };
        let updater = CommandUpdaterFactory.create("alpha", &config).unwrap();
        let report = updater
            .run_instance_update(&UpdateRequest {
                instance: "alpha".to_owned(),
                force_update: false,
                stop: ShutdownFlag::new(),
            })
            .await
            .unwrap();
        assert_eq!(report.items_processed, 4);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_is_an_error() {
        let config = InstanceConfig {
            command: Some(vec!["sh".to_owned(), "-c".to_owned(), "echo boom >&2; exit 3".to_owned()]),
            ..InstanceConfig::default()
        };
        let updater = CommandUpdaterFactory.create("alpha", &config).unwrap();
        let err = updater
            .run_instance_update(&UpdateRequest {
                instance: "alpha".to_owned(),
                force_update: false,
                stop: ShutdownFlag::new(),
            })
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("boom"));
    }
}
