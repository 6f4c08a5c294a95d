//! ---
//! upkeep_section: "07-orchestration"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Locked, bounded-concurrency instance orchestration."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use uuid::Uuid;

use crate::manager::InstanceUpdateReport;

/// Terminal state of one orchestration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    /// Still executing; never persisted.
    Running,
    /// Every validated instance produced a report.
    Completed,
    /// Some instances succeeded and some failed.
    PartialFailure,
    /// Nothing succeeded while something failed, or the run itself errored.
    Failed,
    /// A stop request left work unscheduled.
    Cancelled,
}

impl OrchestrationStatus {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestrationStatus::Running => "running",
            OrchestrationStatus::Completed => "completed",
            OrchestrationStatus::PartialFailure => "partial_failure",
            OrchestrationStatus::Failed => "failed",
            OrchestrationStatus::Cancelled => "cancelled",
        }
    }
}

/// Everything one orchestration did, persisted as a report.
///
/// After [`OrchestrationResult::finalize`] an instance appears in exactly one
/// of `instance_results`, `failed_instances` or `skipped_instances`.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationResult {
    /// Run identifier, also used in the report file name.
    pub id: Uuid,
    /// Wall-clock start.
    pub started_at: DateTime<Utc>,
    /// Wall-clock end, set by `finalize`.
    pub finished_at: Option<DateTime<Utc>>,
    /// Elapsed run time on the runtime clock.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub duration: Duration,
    /// Whether the run asked collaborators to force re-processing.
    pub force_update: bool,
    /// Final state.
    pub status: OrchestrationStatus,
    /// Successful reports keyed by instance name.
    pub instance_results: BTreeMap<String, InstanceUpdateReport>,
    /// Failed instances with their last error.
    pub failed_instances: BTreeMap<String, String>,
    /// Instances never executed, with the reason.
    pub skipped_instances: BTreeMap<String, String>,
    /// Chronological error log across attempts and run-level problems.
    pub errors: Vec<String>,
    /// Sum of `items_processed` over successful reports.
    pub total_items_processed: u64,
    /// Sum of `errors` over successful reports.
    pub total_item_errors: u64,
    /// Batch retry rounds actually started.
    pub retry_rounds: u32,
}

impl OrchestrationResult {
    /// Fresh result stamped now.
    pub fn new(force_update: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            duration: Duration::ZERO,
            force_update,
            status: OrchestrationStatus::Running,
            instance_results: BTreeMap::new(),
            failed_instances: BTreeMap::new(),
            skipped_instances: BTreeMap::new(),
            errors: Vec::new(),
            total_items_processed: 0,
            total_item_errors: 0,
            retry_rounds: 0,
        }
    }

    /// Record a successful report, clearing any earlier failure of the instance.
    pub fn record_success(&mut self, instance: &str, report: InstanceUpdateReport) {
        self.failed_instances.remove(instance);
        self.instance_results.insert(instance.to_owned(), report);
    }

    /// Record a failed attempt; the latest error wins.
    pub fn record_failure(&mut self, instance: &str, attempt: u32, error: impl Into<String>) {
        let error = error.into();
        self.errors
            .push(format!("{instance} (attempt {attempt}): {error}"));
        self.failed_instances.insert(instance.to_owned(), error);
    }

    /// Mark an instance as not executed.
    pub fn record_skip(&mut self, instance: &str, reason: impl Into<String>) {
        self.skipped_instances
            .insert(instance.to_owned(), reason.into());
    }

    /// Whether every validated instance succeeded.
    pub fn is_success(&self) -> bool {
        self.failed_instances.is_empty()
            && matches!(self.status, OrchestrationStatus::Completed)
    }

    /// Seal the result: enforce set disjointness, total the reports and pick a status.
    pub fn finalize(&mut self, duration: Duration, cancelled: bool) {
        let succeeded: Vec<String> = self.instance_results.keys().cloned().collect();
        for instance in &succeeded {
            self.failed_instances.remove(instance);
            self.skipped_instances.remove(instance);
        }
        let failed: Vec<String> = self.failed_instances.keys().cloned().collect();
        for instance in &failed {
            self.skipped_instances.remove(instance);
        }

        self.total_items_processed = self
            .instance_results
            .values()
            .map(|report| report.items_processed)
            .sum();
        self.total_item_errors = self.instance_results.values().map(|report| report.errors).sum();
        self.duration = duration;
        self.finished_at = Some(Utc::now());

        self.status = if cancelled {
            OrchestrationStatus::Cancelled
        } else if self.failed_instances.is_empty() {
            OrchestrationStatus::Completed
        } else if self.instance_results.is_empty() {
            OrchestrationStatus::Failed
        } else {
            OrchestrationStatus::PartialFailure
        };
    }

    /// Mark the run itself as failed, keeping whatever was recorded.
    pub fn fail(&mut self, duration: Duration, error: impl Into<String>) {
        self.errors.push(error.into());
        self.finalize(duration, false);
        self.status = OrchestrationStatus::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(items: u64, errors: u64) -> InstanceUpdateReport {
        InstanceUpdateReport {
            items_processed: items,
            errors,
            ..InstanceUpdateReport::default()
        }
    }

    #[test]
    fn finalize_keeps_sets_disjoint_and_totals_reports() {
        let mut result = OrchestrationResult::new(false);
        result.record_failure("alpha", 1, "boom");
        result.record_success("alpha", report(10, 1));
        result.record_success("beta", report(5, 0));
        result.record_failure("gamma", 1, "timeout");
        result.record_skip("beta", "busy");

        result.finalize(Duration::from_secs(3), false);

        assert_eq!(result.status, OrchestrationStatus::PartialFailure);
        assert!(result.skipped_instances.is_empty());
        assert_eq!(
            result.failed_instances.keys().collect::<Vec<_>>(),
            vec!["gamma"]
        );
        assert_eq!(result.total_items_processed, 15);
        assert_eq!(result.total_item_errors, 1);
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn status_reflects_outcome() {
        let mut all_good = OrchestrationResult::new(true);
        all_good.record_success("alpha", report(1, 0));
        all_good.finalize(Duration::ZERO, false);
        assert!(all_good.is_success());

        let mut all_bad = OrchestrationResult::new(false);
        all_bad.record_failure("alpha", 1, "boom");
        all_bad.finalize(Duration::ZERO, false);
        assert_eq!(all_bad.status, OrchestrationStatus::Failed);

        let mut stopped = OrchestrationResult::new(false);
        stopped.finalize(Duration::ZERO, true);
        assert_eq!(stopped.status, OrchestrationStatus::Cancelled);
        assert!(!stopped.is_success());
    }
}
