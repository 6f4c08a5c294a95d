//! ---
//! upkeep_section: "07-orchestration"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Locked, bounded-concurrency instance orchestration."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use upkeep_common::{InstanceConfig, ShutdownFlag};

/// Arguments handed to one instance update.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    /// Instance being updated.
    pub instance: String,
    /// Re-process items even when they look current.
    pub force_update: bool,
    /// Advisory stop request. Updates should poll it between units of work;
    /// the orchestrator never kills an update that already started.
    pub stop: ShutdownFlag,
}

/// Outcome reported by a finished instance update.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceUpdateReport {
    /// Items the update processed.
    #[serde(default)]
    pub items_processed: u64,
    /// Recoverable item-level errors the update counted.
    #[serde(default)]
    pub errors: u64,
    /// Free-form collaborator output.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
    /// Wall time of the successful attempt, filled in by the orchestrator.
    #[serde(default)]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub duration: Duration,
    /// Attempt number (1 = first batch) that produced this report.
    #[serde(default)]
    pub attempt: u32,
}

/// The opaque unit of work the orchestrator schedules once per instance.
#[async_trait]
pub trait InstanceUpdateManager: Send + Sync {
    /// Update one instance. An `Err` marks the instance failed for this attempt.
    async fn run_instance_update(&self, request: &UpdateRequest) -> Result<InstanceUpdateReport>;
}

/// Builds the update manager for a named instance.
pub trait InstanceUpdaterFactory: Send + Sync {
    /// Construct the manager. Failing here fails the instance, not the run.
    fn create(&self, instance: &str, config: &InstanceConfig) -> Result<Arc<dyn InstanceUpdateManager>>;
}
