//! ---
//! upkeep_section: "05-health-readiness"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Readiness probes and the pre-execution health gate."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, DurationSecondsWithFrac};

/// Probes whose critical status blocks execution. `instance:` probes block too.
pub const BLOCKING_PROBES: &[&str] = &[
    "disk_space",
    "system_resources",
    "dependencies",
    "data_store",
    "process_conflicts",
];

/// Name prefix of the per-instance checks.
pub const INSTANCE_PROBE_PREFIX: &str = "instance:";

/// Verdict of a single check or of the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Unknown,
}

impl HealthStatus {
    /// Ordering used for the overall roll-up; `Unknown` never escalates.
    fn rank(self) -> u8 {
        match self {
            HealthStatus::Unknown | HealthStatus::Healthy => 0,
            HealthStatus::Warning => 1,
            HealthStatus::Critical => 2,
        }
    }

    /// The more severe of the two.
    pub fn worst(self, other: HealthStatus) -> HealthStatus {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
            HealthStatus::Unknown => "unknown",
        }
    }

    /// Gauge value: 0 healthy, 1 warning, 2 critical, 3 unknown.
    pub fn metric_code(&self) -> i64 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Warning => 1,
            HealthStatus::Critical => 2,
            HealthStatus::Unknown => 3,
        }
    }
}

/// Outcome of one named check.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    #[serde(default)]
    pub details: Value,
    pub checked_at: DateTime<Utc>,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub duration: Duration,
}

impl HealthCheckResult {
    /// Critical and one of the gating checks.
    pub fn blocks_execution(&self) -> bool {
        self.status == HealthStatus::Critical
            && (BLOCKING_PROBES.contains(&self.name.as_str())
                || self.name.starts_with(INSTANCE_PROBE_PREFIX))
    }
}

/// Roll-up of one comprehensive health run.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealthStatus {
    pub overall: HealthStatus,
    pub checks: Vec<HealthCheckResult>,
    /// Probes that could not produce a verdict.
    pub unknown_checks: Vec<String>,
    pub checked_at: DateTime<Utc>,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub duration: Duration,
}

impl SystemHealthStatus {
    /// Sort checks by name and roll them up.
    pub fn from_checks(mut checks: Vec<HealthCheckResult>, duration: Duration) -> Self {
        checks.sort_by(|a, b| a.name.cmp(&b.name));
        let overall = checks
            .iter()
            .fold(HealthStatus::Healthy, |acc, check| acc.worst(check.status));
        let unknown_checks = checks
            .iter()
            .filter(|check| check.status == HealthStatus::Unknown)
            .map(|check| check.name.clone())
            .collect();
        Self {
            overall,
            checks,
            unknown_checks,
            checked_at: Utc::now(),
            duration,
        }
    }

    /// Look a check up by name.
    pub fn check(&self, name: &str) -> Option<&HealthCheckResult> {
        self.checks.iter().find(|check| check.name == name)
    }

    pub fn count(&self, status: HealthStatus) -> usize {
        self.checks
            .iter()
            .filter(|check| check.status == status)
            .count()
    }
}

/// The sole execution gate: ready iff nothing is critical.
///
/// Warnings and unknown probes never block.
pub fn is_system_ready_for_update(status: &SystemHealthStatus) -> (bool, Vec<String>) {
    let mut reasons: Vec<String> = status
        .checks
        .iter()
        .filter(|check| check.blocks_execution())
        .map(|check| format!("{} is critical: {}", check.name, check.message))
        .collect();
    if status.overall == HealthStatus::Critical && reasons.is_empty() {
        reasons.extend(
            status
                .checks
                .iter()
                .filter(|check| check.status == HealthStatus::Critical)
                .map(|check| format!("{} is critical: {}", check.name, check.message)),
        );
    }
    (reasons.is_empty(), reasons)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(name: &str, status: HealthStatus) -> HealthCheckResult {
        HealthCheckResult {
            name: name.to_owned(),
            status,
            message: format!("{name} {}", status.as_str()),
            details: Value::Null,
            checked_at: Utc::now(),
            duration: Duration::ZERO,
        }
    }

    #[test]
    fn overall_is_worst_and_ignores_unknown() {
        let status = SystemHealthStatus::from_checks(
            vec![
                check("disk_space", HealthStatus::Healthy),
                check("network_connectivity", HealthStatus::Warning),
                check("dependencies", HealthStatus::Unknown),
            ],
            Duration::ZERO,
        );
        assert_eq!(status.overall, HealthStatus::Warning);
        assert_eq!(status.unknown_checks, vec!["dependencies".to_owned()]);
        assert!(is_system_ready_for_update(&status).0);
    }

    #[test]
    fn any_critical_probe_blocks_with_reasons() {
        for name in ["disk_space", "permissions", "instance:alpha", "custom"] {
            let status = SystemHealthStatus::from_checks(
                vec![
                    check("system_resources", HealthStatus::Healthy),
                    check(name, HealthStatus::Critical),
                ],
                Duration::ZERO,
            );
            let (ready, reasons) = is_system_ready_for_update(&status);
            assert!(!ready, "{name}");
            assert_eq!(reasons.len(), 1, "{name}");
            assert!(reasons[0].starts_with(name));
        }
    }

    #[test]
    fn no_critical_probe_is_ready_with_no_reasons() {
        let status = SystemHealthStatus::from_checks(
            vec![
                check("disk_space", HealthStatus::Warning),
                check("system_resources", HealthStatus::Warning),
            ],
            Duration::ZERO,
        );
        assert_eq!(is_system_ready_for_update(&status), (true, Vec::new()));
    }
}
