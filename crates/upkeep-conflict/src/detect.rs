//! ---
//! upkeep_section: "06-conflict-management"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Contention detection and remediation."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use upkeep_common::time::file_age;
use upkeep_host::{is_flock_held, scan_overlap};
use walkdir::WalkDir;

use crate::resolver::{ConflictResolver, HistoryEntry, TARGET};
use crate::types::{ConflictEvidence, ConflictInfo, ConflictSeverity, ConflictType};

/// Lock directory contents after a stale sweep.
#[derive(Debug, Default)]
pub(crate) struct LockScan {
    pub remaining: Vec<PathBuf>,
    pub removed: usize,
}

impl ConflictResolver {
    /// Run every detector. A detector that fails is logged and skipped.
    pub async fn detect_conflicts(
        &self,
        operation_name: &str,
        instances: Option<&[String]>,
    ) -> Vec<ConflictInfo> {
        let mut conflicts = Vec::new();

        match self.detect_process_overlap(operation_name) {
            Ok(found) => conflicts.extend(found),
            Err(err) => warn!(target: TARGET, detector = "process_overlap", error = %format!("{err:#}"), "detector failed"),
        }
        match self.detect_file_lock_conflicts(operation_name) {
            Ok(found) => conflicts.extend(found),
            Err(err) => warn!(target: TARGET, detector = "file_lock_conflict", error = %format!("{err:#}"), "detector failed"),
        }
        if let Some(instances) = instances {
            match self.detect_instance_conflicts(operation_name, instances) {
                Ok(found) => conflicts.extend(found),
                Err(err) => warn!(target: TARGET, detector = "instance_conflict", error = %format!("{err:#}"), "detector failed"),
            }
        }
        match self.detect_resource_contention().await {
            Ok(found) => conflicts.extend(found),
            Err(err) => warn!(target: TARGET, detector = "resource_contention", error = %format!("{err:#}"), "detector failed"),
        }
        match self.detect_schedule_overlap(operation_name) {
            Ok(found) => conflicts.extend(found),
            Err(err) => warn!(target: TARGET, detector = "schedule_overlap", error = %format!("{err:#}"), "detector failed"),
        }

        for conflict in &conflicts {
            info!(
                target: TARGET,
                operation = operation_name,
                conflict_type = conflict.conflict_type.as_str(),
                severity = conflict.severity.as_str(),
                description = %conflict.description,
                "conflict detected"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_detected(conflict.conflict_type.as_str(), conflict.severity.as_str());
            }
        }
        if conflicts.is_empty() {
            debug!(target: TARGET, operation = operation_name, "no conflicts detected");
        }
        self.push_history(HistoryEntry::Detection {
            at: chrono::Utc::now(),
            operation: operation_name.to_owned(),
            conflicts: conflicts.clone(),
        });
        conflicts
    }

    fn operation_patterns(&self, operation_name: &str) -> Vec<String> {
        let mut patterns = self.config.process_patterns.clone();
        if !operation_name.is_empty() && !patterns.iter().any(|p| p == operation_name) {
            patterns.push(operation_name.to_owned());
        }
        patterns
    }

    /// Other live processes working on the same operation.
    pub fn detect_process_overlap(&self, operation_name: &str) -> Result<Option<ConflictInfo>> {
        let scan = scan_overlap(
            self.processes.as_ref(),
            &self.operation_patterns(operation_name),
            self.config.hung_process_age(),
        )
        .context("process table scan failed")?;
        if scan.is_empty() {
            return Ok(None);
        }
        let severity = if scan.matches.len() > 2 {
            ConflictSeverity::High
        } else {
            ConflictSeverity::Medium
        };
        let mut description = format!(
            "{} other process(es) running {}",
            scan.matches.len(),
            operation_name
        );
        if !scan.hung.is_empty() {
            description.push_str(&format!(
                "; {} running longer than {:.0}h (likely hung)",
                scan.hung.len(),
                self.config.hung_process_age_hours
            ));
        }
        Ok(Some(ConflictInfo::new(
            ConflictType::ProcessOverlap,
            severity,
            description,
            ConflictEvidence {
                pids: scan.pids(),
                hung_pids: scan.hung.iter().map(|process| process.pid).collect(),
                ..ConflictEvidence::default()
            },
        )))
    }

    /// Lock files for the operation that some process still holds.
    ///
    /// Stale, unheld files are deleted on the way. Fresh files nobody holds are
    /// leftovers of a killed run and are ignored; the next acquirer reclaims them.
    pub fn detect_file_lock_conflicts(&self, operation_name: &str) -> Result<Option<ConflictInfo>> {
        let scan = self.scan_lock_directory(true)?;
        let files: Vec<PathBuf> = scan
            .remaining
            .into_iter()
            .filter(|path| file_name_contains(path, operation_name))
            .filter(|path| match is_flock_held(path) {
                Ok(true) => true,
                Ok(false) => {
                    debug!(target: TARGET, path = %path.display(), "lock file not held; ignoring");
                    false
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => false,
                Err(err) => {
                    warn!(target: TARGET, path = %path.display(), error = %err, "unable to check lock file; treating as held");
                    true
                }
            })
            .collect();
        if files.is_empty() {
            return Ok(None);
        }
        Ok(Some(ConflictInfo::new(
            ConflictType::FileLockConflict,
            ConflictSeverity::High,
            format!("{} lock file(s) present for {}", files.len(), operation_name),
            ConflictEvidence {
                files,
                ..ConflictEvidence::default()
            },
        )))
    }

    /// Instance-scoped lock files or live processes mentioning a requested instance.
    pub fn detect_instance_conflicts(
        &self,
        operation_name: &str,
        instances: &[String],
    ) -> Result<Vec<ConflictInfo>> {
        if instances.is_empty() {
            return Ok(Vec::new());
        }
        let locks = self.scan_lock_directory(false)?.remaining;
        let processes = self
            .processes
            .find_matching(&self.operation_patterns(operation_name))
            .context("process table scan failed")?;

        let mut conflicts = Vec::new();
        for instance in instances {
            let files: Vec<PathBuf> = locks
                .iter()
                .filter(|path| file_name_contains(path, instance))
                .cloned()
                .collect();
            let pids: Vec<u32> = processes
                .iter()
                .filter(|process| process.cmdline.contains(instance.as_str()))
                .map(|process| process.pid)
                .collect();
            if files.is_empty() && pids.is_empty() {
                continue;
            }
            conflicts.push(ConflictInfo::new(
                ConflictType::InstanceConflict,
                ConflictSeverity::Medium,
                format!(
                    "instance {instance} busy ({} lock file(s), {} process(es))",
                    files.len(),
                    pids.len()
                ),
                ConflictEvidence {
                    pids,
                    files,
                    instances: vec![instance.clone()],
                    ..ConflictEvidence::default()
                },
            ));
        }
        Ok(conflicts)
    }

    /// Memory, CPU, and I/O pressure. Two or more simultaneous issues are high.
    pub async fn detect_resource_contention(&self) -> Result<Option<ConflictInfo>> {
        let snapshot = self
            .sampler
            .sample()
            .await
            .context("resource sampling failed")?;
        let mut issues = Vec::new();
        let mut evidence = ConflictEvidence::default();
        evidence
            .readings
            .insert("memory_percent".into(), f64::from(snapshot.memory_percent));
        evidence
            .readings
            .insert("cpu_percent".into(), f64::from(snapshot.cpu_percent));
        evidence
            .readings
            .insert("io_bytes_per_sec".into(), snapshot.io_bytes_per_sec as f64);

        if snapshot.memory_percent > self.config.memory_threshold_percent {
            issues.push(format!("memory at {:.1}%", snapshot.memory_percent));
        }
        if snapshot.cpu_percent > self.config.cpu_threshold_percent {
            issues.push(format!("cpu at {:.1}%", snapshot.cpu_percent));
        }
        if snapshot.io_bytes_per_sec > self.config.io_threshold_bytes_per_sec {
            issues.push(format!("disk io at {} B/s", snapshot.io_bytes_per_sec));
        }
        if issues.is_empty() {
            return Ok(None);
        }
        let severity = if issues.len() >= 2 {
            ConflictSeverity::High
        } else {
            ConflictSeverity::Medium
        };
        Ok(Some(ConflictInfo::new(
            ConflictType::ResourceContention,
            severity,
            format!("resource contention: {}", issues.join(", ")),
            evidence,
        )))
    }

    /// A log for the same operation written within the schedule window.
    pub fn detect_schedule_overlap(&self, operation_name: &str) -> Result<Option<ConflictInfo>> {
        if !self.log_directory.exists() {
            return Ok(None);
        }
        let window = self.config.schedule_window();
        let now = SystemTime::now();
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.log_directory)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
        {
            let path = entry.into_path();
            if !file_name_contains(&path, operation_name) {
                continue;
            }
            match file_age(&path, now) {
                Ok(age) if age <= window => files.push(path),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("unable to stat {}", path.display()))
                }
            }
        }
        if files.is_empty() {
            return Ok(None);
        }
        Ok(Some(ConflictInfo::new(
            ConflictType::ScheduleOverlap,
            ConflictSeverity::Medium,
            format!(
                "{operation_name} ran within the last {:.0}h",
                self.config.schedule_window_hours
            ),
            ConflictEvidence {
                files,
                ..ConflictEvidence::default()
            },
        )))
    }

    /// Walk the lock directory, optionally deleting stale files nobody holds.
    pub(crate) fn scan_lock_directory(&self, remove_stale: bool) -> Result<LockScan> {
        let mut scan = LockScan::default();
        if !self.lock_directory.exists() {
            return Ok(scan);
        }
        let stale_after = self.config.stale_lock_age();
        let now = SystemTime::now();
        for entry in WalkDir::new(&self.lock_directory)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
        {
            let path = entry.into_path();
            let age = match file_age(&path, now) {
                Ok(age) => age,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("unable to stat {}", path.display()))
                }
            };
            if age <= stale_after {
                scan.remaining.push(path);
                continue;
            }
            if matches!(is_flock_held(&path), Ok(true)) {
                warn!(target: TARGET, path = %path.display(), age_secs = age.as_secs(), "old lock file still held; keeping");
                scan.remaining.push(path);
                continue;
            }
            if !remove_stale {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    scan.removed += 1;
                    info!(target: TARGET, path = %path.display(), age_secs = age.as_secs(), "removed stale lock file");
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(target: TARGET, path = %path.display(), error = %err, "failed removing stale lock");
                    scan.remaining.push(path);
                }
            }
        }
        Ok(scan)
    }
}

fn file_name_contains(path: &std::path::Path, needle: &str) -> bool {
    !needle.is_empty()
        && path
            .file_name()
            .map(|name| name.to_string_lossy().contains(needle))
            .unwrap_or(false)
}
