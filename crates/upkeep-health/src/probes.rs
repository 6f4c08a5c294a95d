//! ---
//! upkeep_section: "05-health-readiness"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Readiness probes and the pre-execution health gate."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;
use upkeep_common::{ActiveProcessorLookup, HealthConfig, InstanceConfig};
use upkeep_host::{scan_overlap, ProcessTable, ResourceSampler};

use crate::status::{HealthStatus, INSTANCE_PROBE_PREFIX};

/// Verdict produced by a single probe.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub status: HealthStatus,
    pub message: String,
    pub details: Value,
}

impl ProbeReport {
    pub fn new(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn healthy(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Healthy, message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// A single, independent readiness check.
///
/// Returning `Err` marks the probe `unknown`; it never aborts the batch.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> String;

    async fn check(&self) -> Result<ProbeReport>;
}

fn grade(value: f64, warning: f64, critical: f64) -> HealthStatus {
    if value >= critical {
        HealthStatus::Critical
    } else if value >= warning {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    }
}

fn summarise(status: HealthStatus, issues: &[String], ok: &str) -> String {
    if status == HealthStatus::Healthy || issues.is_empty() {
        ok.to_owned()
    } else {
        issues.join("; ")
    }
}

/// Write and remove a marker file to prove `dir` is writable.
fn probe_writable(dir: &Path) -> io::Result<()> {
    let marker = dir.join(format!(".upkeep-write-probe-{}", std::process::id()));
    fs::write(&marker, b"probe")?;
    fs::remove_file(&marker)
}

/// CPU, memory, and load against warning/critical thresholds.
pub struct ResourceProbe {
    sampler: Arc<dyn ResourceSampler>,
    config: HealthConfig,
}

impl ResourceProbe {
    pub fn new(sampler: Arc<dyn ResourceSampler>, config: HealthConfig) -> Self {
        Self { sampler, config }
    }
}

#[async_trait]
impl HealthProbe for ResourceProbe {
    fn name(&self) -> String {
        "system_resources".to_owned()
    }

    async fn check(&self) -> Result<ProbeReport> {
        let snapshot = self.sampler.sample().await?;
        let cfg = &self.config;
        let readings = [
            (
                "cpu",
                f64::from(snapshot.cpu_percent),
                f64::from(cfg.cpu_warning_percent),
                f64::from(cfg.cpu_critical_percent),
            ),
            (
                "memory",
                f64::from(snapshot.memory_percent),
                f64::from(cfg.memory_warning_percent),
                f64::from(cfg.memory_critical_percent),
            ),
            (
                "load_per_cpu",
                snapshot.load_per_cpu(),
                cfg.load_warning_per_cpu,
                cfg.load_critical_per_cpu,
            ),
        ];
        let mut status = HealthStatus::Healthy;
        let mut issues = Vec::new();
        for (label, value, warning, critical) in readings {
            let graded = grade(value, warning, critical);
            if graded != HealthStatus::Healthy {
                issues.push(format!("{label} at {value:.1} ({})", graded.as_str()));
            }
            status = status.worst(graded);
        }
        Ok(ProbeReport::new(
            status,
            summarise(status, &issues, "resource utilisation within limits"),
        )
        .with_details(json!({
            "cpu_percent": snapshot.cpu_percent,
            "memory_percent": snapshot.memory_percent,
            "load_average_one": snapshot.load_average_one,
            "cpu_count": snapshot.cpu_count,
        })))
    }
}

/// Used-space percentage for each configured mount.
pub struct DiskSpaceProbe {
    sampler: Arc<dyn ResourceSampler>,
    mounts: Vec<PathBuf>,
    warning_percent: f32,
    critical_percent: f32,
}

impl DiskSpaceProbe {
    pub fn new(sampler: Arc<dyn ResourceSampler>, config: &HealthConfig) -> Self {
        Self {
            sampler,
            mounts: config.mount_points.clone(),
            warning_percent: config.disk_warning_percent,
            critical_percent: config.disk_critical_percent,
        }
    }
}

#[async_trait]
impl HealthProbe for DiskSpaceProbe {
    fn name(&self) -> String {
        "disk_space".to_owned()
    }

    async fn check(&self) -> Result<ProbeReport> {
        let mut status = HealthStatus::Healthy;
        let mut issues = Vec::new();
        let mut details = serde_json::Map::new();
        for mount in &self.mounts {
            match self.sampler.disk_usage(mount) {
                Ok(usage) => {
                    let graded = grade(
                        f64::from(usage.used_percent),
                        f64::from(self.warning_percent),
                        f64::from(self.critical_percent),
                    );
                    if graded != HealthStatus::Healthy {
                        issues.push(format!(
                            "{} is {:.1}% full",
                            mount.display(),
                            usage.used_percent
                        ));
                    }
                    status = status.worst(graded);
                    details.insert(
                        mount.display().to_string(),
                        json!({
                            "used_percent": usage.used_percent,
                            "available_bytes": usage.available_bytes,
                        }),
                    );
                }
                Err(err) => {
                    issues.push(format!("{}: {err}", mount.display()));
                    status = status.worst(HealthStatus::Warning);
                }
            }
        }
        Ok(
            ProbeReport::new(status, summarise(status, &issues, "disk space sufficient"))
                .with_details(Value::Object(details)),
        )
    }
}

/// TCP reachability of external endpoints: one failure warns, two or more are critical.
pub struct NetworkProbe {
    endpoints: Vec<String>,
    timeout: Duration,
}

impl NetworkProbe {
    pub fn new(endpoints: Vec<String>, timeout: Duration) -> Self {
        Self { endpoints, timeout }
    }
}

#[async_trait]
impl HealthProbe for NetworkProbe {
    fn name(&self) -> String {
        "network_connectivity".to_owned()
    }

    async fn check(&self) -> Result<ProbeReport> {
        if self.endpoints.is_empty() {
            return Ok(ProbeReport::healthy("no endpoints configured"));
        }
        let attempts = self.endpoints.iter().map(|endpoint| async move {
            let reachable = matches!(
                timeout(self.timeout, TcpStream::connect(endpoint.as_str())).await,
                Ok(Ok(_))
            );
            debug!(endpoint = %endpoint, reachable, "network probe");
            (endpoint.clone(), reachable)
        });
        let outcomes = join_all(attempts).await;
        let failed: Vec<String> = outcomes
            .iter()
            .filter(|(_, reachable)| !reachable)
            .map(|(endpoint, _)| endpoint.clone())
            .collect();
        let status = match failed.len() {
            0 => HealthStatus::Healthy,
            1 => HealthStatus::Warning,
            _ => HealthStatus::Critical,
        };
        let message = if failed.is_empty() {
            "all endpoints reachable".to_owned()
        } else {
            format!("unreachable: {}", failed.join(", "))
        };
        Ok(ProbeReport::new(status, message).with_details(json!({ "failed": failed })))
    }
}

/// Required executables resolvable on `PATH`.
pub struct DependencyProbe {
    commands: Vec<String>,
}

impl DependencyProbe {
    pub fn new(commands: Vec<String>) -> Self {
        Self { commands }
    }
}

#[async_trait]
impl HealthProbe for DependencyProbe {
    fn name(&self) -> String {
        "dependencies".to_owned()
    }

    async fn check(&self) -> Result<ProbeReport> {
        let missing: Vec<&String> = self
            .commands
            .iter()
            .filter(|command| which::which(command.as_str()).is_err())
            .collect();
        if missing.is_empty() {
            Ok(ProbeReport::healthy("all runtime dependencies present"))
        } else {
            Ok(ProbeReport::new(
                HealthStatus::Critical,
                format!(
                    "missing: {}",
                    missing
                        .iter()
                        .map(|command| command.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            )
            .with_details(json!({ "missing": missing })))
        }
    }
}

/// Reachability of the backing data store, by address or by path.
pub struct DataStoreProbe {
    address: Option<String>,
    path: Option<PathBuf>,
    timeout: Duration,
}

impl DataStoreProbe {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            address: config.data_store_address.clone(),
            path: config.data_store_path.clone(),
            timeout: config.network_timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for DataStoreProbe {
    fn name(&self) -> String {
        "data_store".to_owned()
    }

    async fn check(&self) -> Result<ProbeReport> {
        if let Some(address) = &self.address {
            return Ok(
                match timeout(self.timeout, TcpStream::connect(address.as_str())).await {
                    Ok(Ok(_)) => ProbeReport::healthy(format!("data store {address} reachable")),
                    Ok(Err(err)) => ProbeReport::new(
                        HealthStatus::Critical,
                        format!("data store {address} unreachable: {err}"),
                    ),
                    Err(_) => ProbeReport::new(
                        HealthStatus::Critical,
                        format!("data store {address} timed out"),
                    ),
                },
            );
        }
        if let Some(path) = &self.path {
            return Ok(match fs::metadata(path) {
                Ok(_) => ProbeReport::healthy(format!("data store {} present", path.display())),
                Err(err) => ProbeReport::new(
                    HealthStatus::Critical,
                    format!("data store {} unavailable: {err}", path.display()),
                ),
            });
        }
        Ok(ProbeReport::healthy("no data store configured"))
    }
}

/// Required directories exist and are writable.
pub struct PermissionsProbe {
    directories: Vec<PathBuf>,
}

impl PermissionsProbe {
    pub fn new(directories: Vec<PathBuf>) -> Self {
        Self { directories }
    }
}

#[async_trait]
impl HealthProbe for PermissionsProbe {
    fn name(&self) -> String {
        "permissions".to_owned()
    }

    async fn check(&self) -> Result<ProbeReport> {
        let (status, issues) = check_directories(&self.directories);
        Ok(ProbeReport::new(
            status,
            summarise(status, &issues, "required directories writable"),
        ))
    }
}

/// Missing directories warn (they are created on demand); unwritable ones are critical.
fn check_directories(directories: &[PathBuf]) -> (HealthStatus, Vec<String>) {
    let mut status = HealthStatus::Healthy;
    let mut issues = Vec::new();
    for dir in directories {
        if !dir.exists() {
            issues.push(format!("{} does not exist", dir.display()));
            status = status.worst(HealthStatus::Warning);
        } else if let Err(err) = probe_writable(dir) {
            issues.push(format!("{} not writable: {err}", dir.display()));
            status = status.worst(HealthStatus::Critical);
        }
    }
    (status, issues)
}

/// Other orchestration processes on the host.
pub struct ProcessConflictProbe {
    table: Arc<dyn ProcessTable>,
    patterns: Vec<String>,
    hung_after: Duration,
}

impl ProcessConflictProbe {
    pub fn new(table: Arc<dyn ProcessTable>, patterns: Vec<String>, hung_after: Duration) -> Self {
        Self {
            table,
            patterns,
            hung_after,
        }
    }
}

#[async_trait]
impl HealthProbe for ProcessConflictProbe {
    fn name(&self) -> String {
        "process_conflicts".to_owned()
    }

    async fn check(&self) -> Result<ProbeReport> {
        let scan = scan_overlap(self.table.as_ref(), &self.patterns, self.hung_after)
            .context("process table scan failed")?;
        let status = if scan.is_empty() {
            HealthStatus::Healthy
        } else if !scan.hung.is_empty() || scan.matches.len() > 2 {
            HealthStatus::Critical
        } else {
            HealthStatus::Warning
        };
        let message = if scan.is_empty() {
            "no conflicting processes".to_owned()
        } else {
            format!(
                "{} conflicting process(es), {} hung",
                scan.matches.len(),
                scan.hung.len()
            )
        };
        Ok(ProbeReport::new(status, message).with_details(json!({ "pids": scan.pids() })))
    }
}

/// Per-instance readiness: directories usable and no processor already active.
pub struct InstanceProbe {
    instance: String,
    config: InstanceConfig,
    lookup: Arc<dyn ActiveProcessorLookup>,
}

impl InstanceProbe {
    pub fn new(
        instance: impl Into<String>,
        config: InstanceConfig,
        lookup: Arc<dyn ActiveProcessorLookup>,
    ) -> Self {
        Self {
            instance: instance.into(),
            config,
            lookup,
        }
    }
}

#[async_trait]
impl HealthProbe for InstanceProbe {
    fn name(&self) -> String {
        format!("{INSTANCE_PROBE_PREFIX}{}", self.instance)
    }

    async fn check(&self) -> Result<ProbeReport> {
        let (mut status, mut issues) = check_directories(&self.config.directories);
        let active = self
            .lookup
            .active_processors(&self.instance)
            .with_context(|| format!("processor lookup failed for {}", self.instance))?;
        if active > 0 {
            issues.push(format!("{active} active processor(s)"));
            status = status.worst(HealthStatus::Critical);
        }
        Ok(ProbeReport::new(
            status,
            summarise(status, &issues, "instance ready"),
        )
        .with_details(json!({ "active_processors": active })))
    }
}
