//! ---
//! upkeep_section: "06-conflict-management"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Contention detection and remediation."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use upkeep_common::time::deadline_after;
use upkeep_common::{ConflictConfig, PathsConfig, ShutdownFlag};
use upkeep_host::{HostError, ProcessTable, ResourceSampler};
use upkeep_metrics::ConflictMetrics;

use crate::types::{ConflictInfo, ConflictType, ResolutionResult, ResolutionStrategy};

pub(crate) const TARGET: &str = "upkeep::conflict";

const KILL_POLL: Duration = Duration::from_millis(250);

/// One entry in the bounded detection/resolution history.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEntry {
    Detection {
        at: DateTime<Utc>,
        operation: String,
        conflicts: Vec<ConflictInfo>,
    },
    Resolution {
        at: DateTime<Utc>,
        operation: String,
        result: ResolutionResult,
    },
}

/// Aggregates over the retained history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConflictStatistics {
    pub detections: usize,
    pub conflicts_detected: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
    pub resolutions: usize,
    pub successful_resolutions: usize,
    pub success_rate: f64,
    pub by_strategy: BTreeMap<String, usize>,
}

/// Detects contention with other work on the host and tries to clear it.
pub struct ConflictResolver {
    pub(crate) config: ConflictConfig,
    pub(crate) lock_directory: PathBuf,
    pub(crate) log_directory: PathBuf,
    pub(crate) processes: Arc<dyn ProcessTable>,
    pub(crate) sampler: Arc<dyn ResourceSampler>,
    pub(crate) metrics: Option<ConflictMetrics>,
    history: Mutex<VecDeque<HistoryEntry>>,
    shutdown: Option<ShutdownFlag>,
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("lock_directory", &self.lock_directory)
            .field("log_directory", &self.log_directory)
            .field("history_len", &self.history.lock().len())
            .finish()
    }
}

impl ConflictResolver {
    /// Resolver over the lock and log directories in `paths`. No metrics and
    /// no stop flag until the builders below attach them.
    pub fn new(
        config: &ConflictConfig,
        paths: &PathsConfig,
        processes: Arc<dyn ProcessTable>,
        sampler: Arc<dyn ResourceSampler>,
    ) -> Self {
        Self {
            config: config.clone(),
            lock_directory: paths.lock_directory.clone(),
            log_directory: paths.log_directory.clone(),
            processes,
            sampler,
            metrics: None,
            history: Mutex::new(VecDeque::new()),
            shutdown: None,
        }
    }

    /// Count detections and resolutions in `metrics`.
    pub fn with_metrics(mut self, metrics: ConflictMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Waits and grace periods end early once the flag is raised.
    pub fn with_shutdown(mut self, shutdown: ShutdownFlag) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Pick a strategy per conflict and apply it, most severe first.
    ///
    /// A critical conflict short-circuits to `SkipExecution` without touching
    /// anything. The result succeeds when no high or critical conflict remains.
    pub async fn resolve_conflicts(
        &self,
        conflicts: &[ConflictInfo],
        operation_name: &str,
    ) -> ResolutionResult {
        let started = Instant::now();
        let mut ordered = conflicts.to_vec();
        ordered.sort_by(|a, b| b.severity.cmp(&a.severity));

        let result = if ordered.is_empty() {
            ResolutionResult::finish(
                Vec::new(),
                vec!["no conflicts to resolve".to_owned()],
                Vec::new(),
                started.elapsed(),
            )
        } else if let Some(critical) = ordered
            .iter()
            .find(|conflict| ResolutionStrategy::for_conflict(conflict) == ResolutionStrategy::SkipExecution)
        {
            let action = format!(
                "skipping {operation_name}: critical {} ({})",
                critical.conflict_type.as_str(),
                critical.description
            );
            warn!(target: TARGET, operation = operation_name, "{action}");
            ResolutionResult::finish(
                vec![ResolutionStrategy::SkipExecution],
                vec![action],
                ordered,
                started.elapsed(),
            )
        } else {
            let mut strategies = Vec::new();
            let mut actions = Vec::new();
            let mut remaining = Vec::new();
            for conflict in ordered {
                let strategy = ResolutionStrategy::for_conflict(&conflict);
                if !strategies.contains(&strategy) {
                    strategies.push(strategy);
                }
                if !self
                    .apply(strategy, &conflict, operation_name, &mut actions)
                    .await
                {
                    remaining.push(conflict);
                }
            }
            ResolutionResult::finish(strategies, actions, remaining, started.elapsed())
        };

        self.record_resolution(operation_name, &result);
        result
    }

    /// Apply one strategy to every conflict regardless of severity.
    pub async fn resolve_with_strategy(
        &self,
        conflicts: &[ConflictInfo],
        strategy: ResolutionStrategy,
        operation_name: &str,
    ) -> ResolutionResult {
        let started = Instant::now();
        let mut actions = Vec::new();
        let mut remaining = Vec::new();
        for conflict in conflicts {
            if !self
                .apply(strategy, conflict, operation_name, &mut actions)
                .await
            {
                remaining.push(conflict.clone());
            }
        }
        let strategies = if conflicts.is_empty() {
            Vec::new()
        } else {
            vec![strategy]
        };
        let result = ResolutionResult::finish(strategies, actions, remaining, started.elapsed());
        self.record_resolution(operation_name, &result);
        result
    }

    /// Delete lock files past the stale age that no process holds. Returns
    /// the number removed; a second call with nothing new returns zero.
    pub fn cleanup_stale_locks(&self) -> Result<usize> {
        let scan = self.scan_lock_directory(true)?;
        info!(
            target: TARGET,
            removed = scan.removed,
            remaining = scan.remaining.len(),
            "stale lock cleanup finished"
        );
        Ok(scan.removed)
    }

    /// Newest first.
    pub fn history(&self, limit: Option<usize>) -> Vec<HistoryEntry> {
        let history = self.history.lock();
        let take = limit.unwrap_or(history.len());
        history.iter().rev().take(take).cloned().collect()
    }

    /// Counts by type, severity and strategy over the retained history.
    pub fn conflict_statistics(&self) -> ConflictStatistics {
        let history = self.history.lock();
        let mut stats = ConflictStatistics::default();
        for entry in history.iter() {
            match entry {
                HistoryEntry::Detection { conflicts, .. } => {
                    stats.detections += 1;
                    stats.conflicts_detected += conflicts.len();
                    for conflict in conflicts {
                        *stats
                            .by_type
                            .entry(conflict.conflict_type.as_str().to_owned())
                            .or_default() += 1;
                        *stats
                            .by_severity
                            .entry(conflict.severity.as_str().to_owned())
                            .or_default() += 1;
                    }
                }
                HistoryEntry::Resolution { result, .. } => {
                    stats.resolutions += 1;
                    if result.success {
                        stats.successful_resolutions += 1;
                    }
                    for strategy in &result.strategies_applied {
                        *stats
                            .by_strategy
                            .entry(strategy.as_str().to_owned())
                            .or_default() += 1;
                    }
                }
            }
        }
        if stats.resolutions > 0 {
            stats.success_rate = stats.successful_resolutions as f64 / stats.resolutions as f64;
        }
        stats
    }

    pub(crate) fn push_history(&self, entry: HistoryEntry) {
        let mut history = self.history.lock();
        history.push_back(entry);
        while history.len() > self.config.history_limit.max(1) {
            history.pop_front();
        }
    }

    fn record_resolution(&self, operation_name: &str, result: &ResolutionResult) {
        info!(
            target: TARGET,
            operation = operation_name,
            success = result.success,
            strategy = result.strategy_used.map(|s| s.as_str()).unwrap_or("none"),
            remaining = result.remaining_conflicts.len(),
            elapsed_secs = result.resolution_time.as_secs_f64(),
            "conflict resolution finished"
        );
        if let Some(metrics) = &self.metrics {
            let strategy = result.strategy_used.map(|s| s.as_str()).unwrap_or("none");
            metrics.record_resolution(strategy, result.success);
        }
        self.push_history(HistoryEntry::Resolution {
            at: Utc::now(),
            operation: operation_name.to_owned(),
            result: result.clone(),
        });
    }

    /// Returns true when the conflict no longer stands in the way.
    async fn apply(
        &self,
        strategy: ResolutionStrategy,
        conflict: &ConflictInfo,
        operation_name: &str,
        actions: &mut Vec<String>,
    ) -> bool {
        match strategy {
            ResolutionStrategy::WaitAndRetry => {
                self.wait_for_clear(conflict, operation_name, actions).await
            }
            ResolutionStrategy::TerminateConflicting => {
                self.terminate_conflicting(conflict, operation_name, actions)
                    .await
            }
            ResolutionStrategy::Reschedule => {
                let action = format!(
                    "recommend rescheduling {operation_name}: {}",
                    conflict.description
                );
                info!(target: TARGET, operation = operation_name, "{action}");
                actions.push(action);
                self.pause(self.config.reschedule_delay).await;
                false
            }
            ResolutionStrategy::SkipExecution => {
                actions.push(format!(
                    "skipping {operation_name} for {}",
                    conflict.conflict_type.as_str()
                ));
                false
            }
            ResolutionStrategy::ForceExecution => {
                actions.push(format!(
                    "forcing {operation_name} despite {}",
                    conflict.conflict_type.as_str()
                ));
                true
            }
        }
    }

    async fn wait_for_clear(
        &self,
        conflict: &ConflictInfo,
        operation_name: &str,
        actions: &mut Vec<String>,
    ) -> bool {
        let kind = conflict.conflict_type.as_str();
        let started = Instant::now();
        let deadline = deadline_after(started, self.config.wait_timeout);
        loop {
            let now = Instant::now();
            if now >= deadline {
                let action = format!(
                    "{kind} still present after waiting {:.0}s",
                    started.elapsed().as_secs_f64()
                );
                warn!(target: TARGET, operation = operation_name, "{action}");
                actions.push(action);
                return false;
            }
            let nap = self.config.wait_poll_interval.min(deadline - now);
            if !self.pause(nap).await {
                actions.push(format!("wait for {kind} cancelled by stop request"));
                return false;
            }
            match self.still_present(conflict, operation_name).await {
                Ok(false) => {
                    let waited = started.elapsed();
                    info!(
                        target: TARGET,
                        operation = operation_name,
                        conflict_type = kind,
                        waited_secs = waited.as_secs_f64(),
                        "conflict cleared while waiting"
                    );
                    actions.push(format!(
                        "{kind} cleared after waiting {:.0}s",
                        waited.as_secs_f64()
                    ));
                    return true;
                }
                Ok(true) => {
                    debug!(target: TARGET, conflict_type = kind, "conflict still present");
                }
                Err(err) => {
                    warn!(target: TARGET, conflict_type = kind, error = %format!("{err:#}"), "re-check failed; assuming still present");
                }
            }
        }
    }

    async fn still_present(&self, conflict: &ConflictInfo, operation_name: &str) -> Result<bool> {
        Ok(match conflict.conflict_type {
            ConflictType::ProcessOverlap => self.detect_process_overlap(operation_name)?.is_some(),
            ConflictType::FileLockConflict => {
                self.detect_file_lock_conflicts(operation_name)?.is_some()
            }
            ConflictType::ResourceContention => self.detect_resource_contention().await?.is_some(),
            ConflictType::InstanceConflict => !self
                .detect_instance_conflicts(operation_name, &conflict.evidence.instances)?
                .is_empty(),
            ConflictType::ScheduleOverlap => {
                self.detect_schedule_overlap(operation_name)?.is_some()
            }
        })
    }

    /// SIGTERM every recorded pid, give them the grace period, then SIGKILL.
    async fn terminate_conflicting(
        &self,
        conflict: &ConflictInfo,
        operation_name: &str,
        actions: &mut Vec<String>,
    ) -> bool {
        let mut pending = Vec::new();
        for &pid in &conflict.evidence.pids {
            match self.processes.terminate(pid) {
                Ok(()) => {
                    info!(target: TARGET, operation = operation_name, pid, "sent SIGTERM");
                    actions.push(format!("sent SIGTERM to {pid}"));
                    pending.push(pid);
                }
                Err(HostError::ProcessNotFound(_)) => {
                    actions.push(format!("process {pid} already exited"));
                }
                Err(err) => {
                    warn!(target: TARGET, pid, error = %err, "terminate failed");
                    actions.push(format!("failed to terminate {pid}: {err}"));
                    pending.push(pid);
                }
            }
        }

        let deadline = deadline_after(Instant::now(), self.config.terminate_grace);
        while pending.iter().any(|&pid| self.processes.is_alive(pid)) {
            let now = Instant::now();
            if now >= deadline || !self.pause(KILL_POLL.min(deadline - now)).await {
                break;
            }
        }

        for &pid in &pending {
            if !self.processes.is_alive(pid) {
                continue;
            }
            match self.processes.force_kill(pid) {
                Ok(()) => {
                    warn!(target: TARGET, operation = operation_name, pid, "grace period expired; sent SIGKILL");
                    actions.push(format!("sent SIGKILL to {pid}"));
                }
                Err(HostError::ProcessNotFound(_)) => {}
                Err(err) => {
                    warn!(target: TARGET, pid, error = %err, "force kill failed");
                    actions.push(format!("failed to kill {pid}: {err}"));
                }
            }
        }

        let survivors: Vec<u32> = pending
            .into_iter()
            .filter(|&pid| self.processes.is_alive(pid))
            .collect();
        if survivors.is_empty() {
            true
        } else {
            actions.push(format!("processes still alive: {survivors:?}"));
            false
        }
    }

    /// Sleep unless a stop is requested first. Returns false when interrupted.
    async fn pause(&self, duration: Duration) -> bool {
        match &self.shutdown {
            Some(flag) => {
                if flag.is_requested() {
                    return false;
                }
                tokio::select! {
                    _ = tokio::time::sleep(duration) => true,
                    _ = flag.wait() => false,
                }
            }
            None => {
                tokio::time::sleep(duration).await;
                true
            }
        }
    }
}
