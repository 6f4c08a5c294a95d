//! ---
//! upkeep_section: "06-conflict-management"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Contention detection and remediation."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};

/// Kind of contention a detector reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    ProcessOverlap,
    ResourceContention,
    FileLockConflict,
    InstanceConflict,
    ScheduleOverlap,
}

impl ConflictType {
    /// Label used in logs, metrics and history.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::ProcessOverlap => "process_overlap",
            ConflictType::ResourceContention => "resource_contention",
            ConflictType::FileLockConflict => "file_lock_conflict",
            ConflictType::InstanceConflict => "instance_conflict",
            ConflictType::ScheduleOverlap => "schedule_overlap",
        }
    }
}

/// Ordered low to critical; the ordering drives resolution priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ConflictSeverity {
    /// Label used in logs, metrics and history.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictSeverity::Low => "low",
            ConflictSeverity::Medium => "medium",
            ConflictSeverity::High => "high",
            ConflictSeverity::Critical => "critical",
        }
    }

    /// High and critical conflicts fail a resolution pass when left unresolved.
    pub fn is_blocking(&self) -> bool {
        *self >= ConflictSeverity::High
    }
}

/// What a detector saw.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictEvidence {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pids: Vec<u32>,
    /// Subset of `pids` running longer than the hung threshold.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hung_pids: Vec<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub readings: BTreeMap<String, f64>,
}

/// One detected conflict with the evidence behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub description: String,
    pub evidence: ConflictEvidence,
    pub detected_at: DateTime<Utc>,
}

impl ConflictInfo {
    /// Stamp a new conflict with the current time.
    pub fn new(
        conflict_type: ConflictType,
        severity: ConflictSeverity,
        description: impl Into<String>,
        evidence: ConflictEvidence,
    ) -> Self {
        Self {
            conflict_type,
            severity,
            description: description.into(),
            evidence,
            detected_at: Utc::now(),
        }
    }
}

/// Remediation applied to a conflict.
///
/// `Reschedule` only waits the configured delay; nothing is re-queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    WaitAndRetry,
    TerminateConflicting,
    Reschedule,
    SkipExecution,
    ForceExecution,
}

impl ResolutionStrategy {
    /// Label used in logs, metrics and history.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::WaitAndRetry => "wait_and_retry",
            ResolutionStrategy::TerminateConflicting => "terminate_conflicting",
            ResolutionStrategy::Reschedule => "reschedule",
            ResolutionStrategy::SkipExecution => "skip_execution",
            ResolutionStrategy::ForceExecution => "force_execution",
        }
    }

    /// Deterministic strategy table.
    pub fn for_conflict(conflict: &ConflictInfo) -> Self {
        if conflict.severity == ConflictSeverity::Critical {
            return ResolutionStrategy::SkipExecution;
        }
        match conflict.conflict_type {
            ConflictType::ProcessOverlap if conflict.severity == ConflictSeverity::High => {
                ResolutionStrategy::TerminateConflicting
            }
            ConflictType::ScheduleOverlap => ResolutionStrategy::Reschedule,
            ConflictType::ProcessOverlap
            | ConflictType::FileLockConflict
            | ConflictType::ResourceContention
            | ConflictType::InstanceConflict => ResolutionStrategy::WaitAndRetry,
        }
    }
}

/// Outcome of one resolution pass.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionResult {
    pub success: bool,
    /// Strategy applied to the most severe conflict; `None` when there was nothing to do.
    pub strategy_used: Option<ResolutionStrategy>,
    pub strategies_applied: Vec<ResolutionStrategy>,
    pub actions_taken: Vec<String>,
    pub remaining_conflicts: Vec<ConflictInfo>,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub resolution_time: Duration,
    pub resolved_at: DateTime<Utc>,
}

impl ResolutionResult {
    pub(crate) fn finish(
        strategies_applied: Vec<ResolutionStrategy>,
        actions_taken: Vec<String>,
        remaining_conflicts: Vec<ConflictInfo>,
        resolution_time: Duration,
    ) -> Self {
        let success = !remaining_conflicts
            .iter()
            .any(|conflict| conflict.severity.is_blocking());
        Self {
            success,
            strategy_used: strategies_applied.first().copied(),
            strategies_applied,
            actions_taken,
            remaining_conflicts,
            resolution_time,
            resolved_at: Utc::now(),
        }
    }
}
