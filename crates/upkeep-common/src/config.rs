//! ---
//! upkeep_section: "01-core-functionality"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Shared primitives and utilities for the orchestration runtime."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use tracing::debug;

use crate::logging::LogFormat;

/// Operation name used for the wrapped orchestration and its lock/log files.
pub const DEFAULT_OPERATION_NAME: &str = "monthly_orchestration";

fn default_true() -> bool {
    true
}

fn default_max_concurrent_instances() -> usize {
    2
}

fn default_instance_timeout_hours() -> f64 {
    24.0
}

fn default_batch_retry_rounds() -> u32 {
    2
}

fn default_report_retention_days() -> u32 {
    90
}

fn default_retry_backoff_base() -> Duration {
    Duration::from_secs(60)
}

fn default_recovery_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(300)
}

fn default_exponential_base() -> f64 {
    2.0
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_timeout_minutes() -> f64 {
    30.0
}

fn default_breaker_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_error_history_limit() -> usize {
    1000
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_conflict_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_execution_timeout_hours() -> f64 {
    48.0
}

fn default_operation_name() -> String {
    DEFAULT_OPERATION_NAME.to_owned()
}

fn default_scheduling_history_limit() -> usize {
    50
}

fn default_mount_points() -> Vec<PathBuf> {
    vec![PathBuf::from("/")]
}

fn default_network_endpoints() -> Vec<String> {
    vec![
        "1.1.1.1:53".to_owned(),
        "8.8.8.8:53".to_owned(),
        "9.9.9.9:53".to_owned(),
    ]
}

fn default_network_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_process_patterns() -> Vec<String> {
    vec!["upkeepd run".to_owned(), DEFAULT_OPERATION_NAME.to_owned()]
}

fn default_stale_lock_age_hours() -> f64 {
    6.0
}

fn default_hung_process_age_hours() -> f64 {
    12.0
}

fn default_schedule_window_hours() -> f64 {
    2.0
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_wait_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_terminate_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_reschedule_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_conflict_history_limit() -> usize {
    100
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("var/upkeep/locks").join(format!("{DEFAULT_OPERATION_NAME}.lock"))
}

fn default_lock_directory() -> PathBuf {
    PathBuf::from("var/upkeep/locks")
}

fn default_report_directory() -> PathBuf {
    PathBuf::from("var/upkeep/reports")
}

fn default_log_directory() -> PathBuf {
    PathBuf::from("var/upkeep/logs")
}

fn default_stats_directory() -> PathBuf {
    PathBuf::from("var/upkeep/stats")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Longest hour-valued setting accepted by validation (one year).
pub const MAX_CONFIG_HOURS: f64 = 24.0 * 366.0;

/// Longest duration-valued setting accepted by validation.
pub const MAX_CONFIG_DURATION: Duration = Duration::from_secs(24 * 366 * 3600);

/// Converts an hour count, clamping values no `Duration` can hold.
fn hours(value: f64) -> Duration {
    seconds(value * 3600.0)
}

fn seconds(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

fn ensure_hours(value: f64, field: &str) -> Result<()> {
    ensure!(
        value.is_finite() && value > 0.0 && value <= MAX_CONFIG_HOURS,
        "{field} must be positive and at most {MAX_CONFIG_HOURS} hours, got {value}"
    );
    Ok(())
}

fn ensure_bounded(value: Duration, field: &str) -> Result<()> {
    ensure!(
        value <= MAX_CONFIG_DURATION,
        "{field} must be at most {}s, got {}s",
        MAX_CONFIG_DURATION.as_secs(),
        value.as_secs_f64()
    );
    Ok(())
}

/// Primary configuration object for the upkeep runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub conflict: ConflictConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub instances: IndexMap<String, InstanceConfig>,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "UPKEEP_CONFIG";

    /// Load configuration from disk, respecting the `UPKEEP_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Retrieve an instance configuration by name.
    pub fn instance(&self, name: &str) -> Option<&InstanceConfig> {
        self.instances.get(name)
    }

    /// Restrict the configured instances to the requested names, preserving order.
    ///
    /// An empty selection returns every configured instance.
    pub fn select_instances(&self, names: &[String]) -> Result<IndexMap<String, InstanceConfig>> {
        if names.is_empty() {
            return Ok(self.instances.clone());
        }
        let mut selected = IndexMap::new();
        for name in names {
            let instance = self
                .instances
                .get(name)
                .ok_or_else(|| anyhow!("unknown instance '{}'", name))?;
            selected.insert(name.clone(), instance.clone());
        }
        Ok(selected)
    }

    /// Validate structural invariants across every section.
    pub fn validate(&self) -> Result<()> {
        self.orchestration.validate()?;
        self.recovery.validate()?;
        self.scheduling.validate()?;
        self.health.validate()?;
        self.conflict.validate()?;
        for (name, instance) in &self.instances {
            instance.validate(name)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Limits and retry policy for one orchestration run.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    #[serde(default = "default_max_concurrent_instances")]
    pub max_concurrent_instances: usize,
    #[serde(default = "default_instance_timeout_hours")]
    pub instance_timeout_hours: f64,
    #[serde(default = "default_true")]
    pub retry_failed_instances: bool,
    /// Number of batch retry rounds applied to the failed set.
    #[serde(default = "default_batch_retry_rounds")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_report_retention_days")]
    pub report_retention_days: u32,
    #[serde(default, rename = "lock_timeout_seconds")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub lock_timeout: Duration,
    #[serde(
        default = "default_retry_backoff_base",
        rename = "retry_backoff_base_seconds"
    )]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub retry_backoff_base: Duration,
}

impl OrchestrationConfig {
    pub fn instance_timeout(&self) -> Duration {
        hours(self.instance_timeout_hours)
    }

    /// Delay before batch retry round `round` (1-indexed): base, 2x base, 4x base, ...
    pub fn retry_round_delay(&self, round: u32) -> Duration {
        let exponent = round.saturating_sub(1).min(16);
        self.retry_backoff_base.saturating_mul(1u32 << exponent)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_concurrent_instances > 0,
            "orchestration.max_concurrent_instances must be at least 1"
        );
        ensure_hours(
            self.instance_timeout_hours,
            "orchestration.instance_timeout_hours",
        )?;
        ensure_bounded(self.lock_timeout, "orchestration.lock_timeout_seconds")?;
        ensure_bounded(
            self.retry_backoff_base,
            "orchestration.retry_backoff_base_seconds",
        )?;
        Ok(())
    }
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_concurrent_instances: default_max_concurrent_instances(),
            instance_timeout_hours: default_instance_timeout_hours(),
            retry_failed_instances: true,
            max_retry_attempts: default_batch_retry_rounds(),
            report_retention_days: default_report_retention_days(),
            lock_timeout: Duration::ZERO,
            retry_backoff_base: default_retry_backoff_base(),
        }
    }
}

/// Retry, backoff and circuit breaker policy for the recovery engine.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_recovery_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_base_delay", rename = "base_delay_seconds")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay", rename = "max_delay_seconds")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub max_delay: Duration,
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_breaker_timeout_minutes")]
    pub circuit_breaker_timeout_minutes: f64,
    /// Fixed delay used between attempts classified with the circuit breaker strategy.
    #[serde(default = "default_breaker_delay", rename = "circuit_breaker_delay_seconds")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub circuit_breaker_delay: Duration,
    #[serde(default = "default_error_history_limit")]
    pub error_history_limit: usize,
}

impl RecoveryConfig {
    pub fn circuit_breaker_timeout(&self) -> Duration {
        seconds(self.circuit_breaker_timeout_minutes * 60.0)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_retry_attempts > 0,
            "recovery.max_retry_attempts must be at least 1"
        );
        ensure!(
            self.exponential_base.is_finite() && self.exponential_base >= 1.0,
            "recovery.exponential_base must be finite and >= 1.0"
        );
        ensure_bounded(self.max_delay, "recovery.max_delay_seconds")?;
        ensure_bounded(
            self.circuit_breaker_delay,
            "recovery.circuit_breaker_delay_seconds",
        )?;
        ensure!(
            self.base_delay <= self.max_delay,
            "recovery.base_delay_seconds must not exceed max_delay_seconds"
        );
        ensure!(
            self.circuit_breaker_threshold > 0,
            "recovery.circuit_breaker_threshold must be at least 1"
        );
        ensure_hours(
            self.circuit_breaker_timeout_minutes / 60.0,
            "recovery.circuit_breaker_timeout_minutes",
        )?;
        Ok(())
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: default_recovery_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            exponential_base: default_exponential_base(),
            circuit_breaker_threshold: default_breaker_threshold(),
            circuit_breaker_timeout_minutes: default_breaker_timeout_minutes(),
            circuit_breaker_delay: default_breaker_delay(),
            error_history_limit: default_error_history_limit(),
        }
    }
}

/// Phase toggles and timeouts for the scheduling coordinator.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    #[serde(default = "default_true")]
    pub enable_health_checks: bool,
    #[serde(default = "default_true")]
    pub enable_conflict_resolution: bool,
    #[serde(default = "default_true")]
    pub enable_error_recovery: bool,
    #[serde(default = "default_health_timeout", rename = "health_check_timeout_seconds")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub health_check_timeout: Duration,
    #[serde(
        default = "default_conflict_timeout",
        rename = "conflict_resolution_timeout_seconds"
    )]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub conflict_resolution_timeout: Duration,
    #[serde(default = "default_execution_timeout_hours")]
    pub execution_timeout_hours: f64,
    #[serde(default = "default_operation_name")]
    pub operation_name: String,
    #[serde(default = "default_scheduling_history_limit")]
    pub history_limit: usize,
}

impl SchedulingConfig {
    /// Preset with every gate enabled.
    pub fn full() -> Self {
        Self {
            enable_health_checks: true,
            enable_conflict_resolution: true,
            enable_error_recovery: true,
            health_check_timeout: default_health_timeout(),
            conflict_resolution_timeout: default_conflict_timeout(),
            execution_timeout_hours: default_execution_timeout_hours(),
            operation_name: default_operation_name(),
            history_limit: default_scheduling_history_limit(),
        }
    }

    /// Preset that skips the gates and the recovery wrapper; phases auto-pass.
    pub fn basic() -> Self {
        Self {
            enable_health_checks: false,
            enable_conflict_resolution: false,
            enable_error_recovery: false,
            ..Self::full()
        }
    }

    pub fn execution_timeout(&self) -> Duration {
        hours(self.execution_timeout_hours)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.operation_name.trim().is_empty(),
            "scheduling.operation_name must not be empty"
        );
        ensure_hours(
            self.execution_timeout_hours,
            "scheduling.execution_timeout_hours",
        )?;
        ensure_bounded(
            self.health_check_timeout,
            "scheduling.health_check_timeout_seconds",
        )?;
        ensure_bounded(
            self.conflict_resolution_timeout,
            "scheduling.conflict_resolution_timeout_seconds",
        )?;
        ensure!(
            self.history_limit > 0,
            "scheduling.history_limit must be at least 1"
        );
        Ok(())
    }
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self::full()
    }
}

/// Thresholds and targets for the health probe battery.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "HealthConfig::default_cpu_warning")]
    pub cpu_warning_percent: f32,
    #[serde(default = "HealthConfig::default_cpu_critical")]
    pub cpu_critical_percent: f32,
    #[serde(default = "HealthConfig::default_memory_warning")]
    pub memory_warning_percent: f32,
    #[serde(default = "HealthConfig::default_memory_critical")]
    pub memory_critical_percent: f32,
    /// One-minute load average per logical cpu that raises a warning.
    #[serde(default = "HealthConfig::default_load_warning")]
    pub load_warning_per_cpu: f64,
    #[serde(default = "HealthConfig::default_load_critical")]
    pub load_critical_per_cpu: f64,
    #[serde(default = "HealthConfig::default_disk_warning")]
    pub disk_warning_percent: f32,
    #[serde(default = "HealthConfig::default_disk_critical")]
    pub disk_critical_percent: f32,
    #[serde(default = "default_mount_points")]
    pub mount_points: Vec<PathBuf>,
    /// `host:port` pairs probed with a TCP connect.
    #[serde(default = "default_network_endpoints")]
    pub network_endpoints: Vec<String>,
    #[serde(default = "default_network_timeout", rename = "network_timeout_seconds")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub network_timeout: Duration,
    /// Executables that must be resolvable on `PATH`.
    #[serde(default)]
    pub required_commands: Vec<String>,
    #[serde(default)]
    pub required_directories: Vec<PathBuf>,
    /// `host:port` of the backing data store, when it is networked.
    #[serde(default)]
    pub data_store_address: Option<String>,
    /// Path of the backing data store, when it is file based.
    #[serde(default)]
    pub data_store_path: Option<PathBuf>,
    #[serde(default = "default_probe_timeout", rename = "probe_timeout_seconds")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub probe_timeout: Duration,
}

impl HealthConfig {
    fn default_cpu_warning() -> f32 {
        80.0
    }

    fn default_cpu_critical() -> f32 {
        95.0
    }

    fn default_memory_warning() -> f32 {
        80.0
    }

    fn default_memory_critical() -> f32 {
        95.0
    }

    fn default_load_warning() -> f64 {
        2.0
    }

    fn default_load_critical() -> f64 {
        4.0
    }

    fn default_disk_warning() -> f32 {
        85.0
    }

    fn default_disk_critical() -> f32 {
        95.0
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.cpu_warning_percent < self.cpu_critical_percent,
            "health.cpu_warning_percent must be below cpu_critical_percent"
        );
        ensure!(
            self.memory_warning_percent < self.memory_critical_percent,
            "health.memory_warning_percent must be below memory_critical_percent"
        );
        ensure!(
            self.load_warning_per_cpu < self.load_critical_per_cpu,
            "health.load_warning_per_cpu must be below load_critical_per_cpu"
        );
        ensure!(
            self.disk_warning_percent < self.disk_critical_percent,
            "health.disk_warning_percent must be below disk_critical_percent"
        );
        ensure_bounded(self.network_timeout, "health.network_timeout_seconds")?;
        ensure_bounded(self.probe_timeout, "health.probe_timeout_seconds")?;
        Ok(())
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            cpu_warning_percent: Self::default_cpu_warning(),
            cpu_critical_percent: Self::default_cpu_critical(),
            memory_warning_percent: Self::default_memory_warning(),
            memory_critical_percent: Self::default_memory_critical(),
            load_warning_per_cpu: Self::default_load_warning(),
            load_critical_per_cpu: Self::default_load_critical(),
            disk_warning_percent: Self::default_disk_warning(),
            disk_critical_percent: Self::default_disk_critical(),
            mount_points: default_mount_points(),
            network_endpoints: default_network_endpoints(),
            network_timeout: default_network_timeout(),
            required_commands: Vec::new(),
            required_directories: Vec::new(),
            data_store_address: None,
            data_store_path: None,
            probe_timeout: default_probe_timeout(),
        }
    }
}

/// Detection thresholds and remediation timings for conflict handling.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictConfig {
    /// Command-line fragments identifying orchestration processes.
    #[serde(default = "default_process_patterns")]
    pub process_patterns: Vec<String>,
    #[serde(default = "default_stale_lock_age_hours")]
    pub stale_lock_age_hours: f64,
    #[serde(default = "default_hung_process_age_hours")]
    pub hung_process_age_hours: f64,
    #[serde(default = "ConflictConfig::default_memory_threshold")]
    pub memory_threshold_percent: f32,
    #[serde(default = "ConflictConfig::default_cpu_threshold")]
    pub cpu_threshold_percent: f32,
    #[serde(default = "ConflictConfig::default_io_threshold")]
    pub io_threshold_bytes_per_sec: u64,
    #[serde(default = "default_schedule_window_hours")]
    pub schedule_window_hours: f64,
    #[serde(default = "default_poll_interval", rename = "wait_poll_interval_seconds")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub wait_poll_interval: Duration,
    #[serde(default = "default_wait_timeout", rename = "wait_timeout_seconds")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub wait_timeout: Duration,
    #[serde(default = "default_terminate_grace", rename = "terminate_grace_seconds")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub terminate_grace: Duration,
    #[serde(default = "default_reschedule_delay", rename = "reschedule_delay_seconds")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub reschedule_delay: Duration,
    #[serde(default = "default_conflict_history_limit")]
    pub history_limit: usize,
}

impl ConflictConfig {
    fn default_memory_threshold() -> f32 {
        85.0
    }

    fn default_cpu_threshold() -> f32 {
        80.0
    }

    fn default_io_threshold() -> u64 {
        100 * 1024 * 1024
    }

    pub fn stale_lock_age(&self) -> Duration {
        hours(self.stale_lock_age_hours)
    }

    pub fn hung_process_age(&self) -> Duration {
        hours(self.hung_process_age_hours)
    }

    pub fn schedule_window(&self) -> Duration {
        hours(self.schedule_window_hours)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.wait_poll_interval.is_zero(),
            "conflict.wait_poll_interval_seconds must be positive"
        );
        ensure_hours(self.stale_lock_age_hours, "conflict.stale_lock_age_hours")?;
        ensure_hours(self.hung_process_age_hours, "conflict.hung_process_age_hours")?;
        ensure_hours(self.schedule_window_hours, "conflict.schedule_window_hours")?;
        for (value, field) in [
            (self.wait_poll_interval, "conflict.wait_poll_interval_seconds"),
            (self.wait_timeout, "conflict.wait_timeout_seconds"),
            (self.terminate_grace, "conflict.terminate_grace_seconds"),
            (self.reschedule_delay, "conflict.reschedule_delay_seconds"),
        ] {
            ensure_bounded(value, field)?;
        }
        ensure!(
            self.history_limit > 0,
            "conflict.history_limit must be at least 1"
        );
        Ok(())
    }
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            process_patterns: default_process_patterns(),
            stale_lock_age_hours: default_stale_lock_age_hours(),
            hung_process_age_hours: default_hung_process_age_hours(),
            memory_threshold_percent: Self::default_memory_threshold(),
            cpu_threshold_percent: Self::default_cpu_threshold(),
            io_threshold_bytes_per_sec: Self::default_io_threshold(),
            schedule_window_hours: default_schedule_window_hours(),
            wait_poll_interval: default_poll_interval(),
            wait_timeout: default_wait_timeout(),
            terminate_grace: default_terminate_grace(),
            reschedule_delay: default_reschedule_delay(),
            history_limit: default_conflict_history_limit(),
        }
    }
}

/// Filesystem locations used for locks, reports, logs, and exports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,
    #[serde(default = "default_lock_directory")]
    pub lock_directory: PathBuf,
    #[serde(default = "default_report_directory")]
    pub report_directory: PathBuf,
    #[serde(default = "default_log_directory")]
    pub log_directory: PathBuf,
    #[serde(default = "default_stats_directory")]
    pub stats_directory: PathBuf,
}

impl PathsConfig {
    /// Lay every path out below a single root, handy for tests and sandboxes.
    pub fn rooted_at(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let lock_directory = root.join("locks");
        Self {
            lock_file: lock_directory.join(format!("{DEFAULT_OPERATION_NAME}.lock")),
            lock_directory,
            report_directory: root.join("reports"),
            log_directory: root.join("logs"),
            stats_directory: root.join("stats"),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            lock_file: default_lock_file(),
            lock_directory: default_lock_directory(),
            report_directory: default_report_directory(),
            log_directory: default_log_directory(),
            stats_directory: default_stats_directory(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

/// Opaque per-instance settings handed to the instance update collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Directories the instance writes to; validated before each run.
    #[serde(default)]
    pub directories: Vec<PathBuf>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub source_categories: Vec<String>,
    /// Program and arguments executing one update of this instance.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub metadata: IndexMap<String, String>,
}

impl InstanceConfig {
    pub fn validate(&self, name: &str) -> Result<()> {
        ensure!(!name.trim().is_empty(), "instance names must not be empty");
        if let Some(command) = &self.command {
            ensure!(
                !command.is_empty(),
                "instance '{}' declares an empty command",
                name
            );
        }
        if let Some(batch_size) = self.batch_size {
            ensure!(
                batch_size > 0,
                "instance '{}' batch_size must be at least 1",
                name
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: AppConfig = "".parse().unwrap();
        assert_eq!(config.orchestration.max_concurrent_instances, 2);
        assert_eq!(config.recovery.max_retry_attempts, 3);
        assert_eq!(config.conflict.wait_poll_interval, Duration::from_secs(30));
        assert!(config.scheduling.enable_health_checks);
        assert_eq!(config.scheduling.operation_name, DEFAULT_OPERATION_NAME);
    }

    #[test]
    fn parses_sections_and_instances_in_order() {
        let raw = r#"
            [orchestration]
            max_concurrent_instances = 4
            instance_timeout_hours = 0.5
            retry_backoff_base_seconds = 1.5

            [recovery]
            base_delay_seconds = 0.25
            circuit_breaker_timeout_minutes = 2

            [instances.beta]
            directories = ["/tmp/beta"]
            source_categories = ["cs.AI"]

            [instances.alpha]
            batch_size = 10
        "#;
        let config: AppConfig = raw.parse().unwrap();
        assert_eq!(config.orchestration.max_concurrent_instances, 4);
        assert_eq!(
            config.orchestration.instance_timeout(),
            Duration::from_secs(1800)
        );
        assert_eq!(
            config.orchestration.retry_backoff_base,
            Duration::from_millis(1500)
        );
        assert_eq!(config.recovery.base_delay, Duration::from_millis(250));
        assert_eq!(
            config.recovery.circuit_breaker_timeout(),
            Duration::from_secs(120)
        );
        let names: Vec<_> = config.instances.keys().cloned().collect();
        assert_eq!(names, vec!["beta".to_owned(), "alpha".to_owned()]);
    }

    #[test]
    fn rejects_zero_concurrency() {
        let err = "[orchestration]\nmax_concurrent_instances = 0"
            .parse::<AppConfig>()
            .unwrap_err();
        assert!(format!("{err:#}").contains("max_concurrent_instances"));
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let err = "[health]\ndisk_warning_percent = 99\ndisk_critical_percent = 90"
            .parse::<AppConfig>()
            .unwrap_err();
        assert!(format!("{err:#}").contains("disk_warning_percent"));
    }

    #[test]
    fn rejects_unbounded_timeouts() {
        for raw in [
            "[orchestration]\ninstance_timeout_hours = 1e20\n",
            "[orchestration]\ninstance_timeout_hours = inf\n",
            "[orchestration]\nlock_timeout_seconds = 1e12\n",
            "[scheduling]\nexecution_timeout_hours = 1e20\n",
            "[recovery]\ncircuit_breaker_timeout_minutes = inf\n",
            "[recovery]\nexponential_base = inf\n",
            "[conflict]\nwait_timeout_seconds = 1e12\n",
            "[conflict]\nstale_lock_age_hours = nan\n",
        ] {
            assert!(raw.parse::<AppConfig>().is_err(), "accepted {raw:?}");
        }
    }

    #[test]
    fn hour_conversions_clamp_instead_of_panicking() {
        let mut config = AppConfig::default();
        config.orchestration.instance_timeout_hours = 1e20;
        config.scheduling.execution_timeout_hours = f64::INFINITY;
        config.recovery.circuit_breaker_timeout_minutes = f64::NAN;
        assert_eq!(config.orchestration.instance_timeout(), Duration::MAX);
        assert_eq!(config.scheduling.execution_timeout(), Duration::MAX);
        assert_eq!(config.recovery.circuit_breaker_timeout(), Duration::ZERO);
    }

    #[test]
    fn ceiling_values_are_accepted() {
        let raw = format!("[orchestration]\ninstance_timeout_hours = {MAX_CONFIG_HOURS}\n");
        let config: AppConfig = raw.parse().unwrap();
        assert_eq!(
            config.orchestration.instance_timeout(),
            Duration::from_secs(24 * 366 * 3600)
        );
    }

    #[test]
    fn batch_retry_rounds_double() {
        let config = OrchestrationConfig::default();
        assert_eq!(config.retry_round_delay(1), Duration::from_secs(60));
        assert_eq!(config.retry_round_delay(2), Duration::from_secs(120));
        assert_eq!(config.retry_round_delay(3), Duration::from_secs(240));
    }

    #[test]
    fn select_instances_rejects_unknown_names() {
        let mut config = AppConfig::default();
        config
            .instances
            .insert("alpha".into(), InstanceConfig::default());
        assert_eq!(config.select_instances(&[]).unwrap().len(), 1);
        assert!(config.select_instances(&["nope".into()]).is_err());
    }

    #[test]
    fn basic_preset_disables_gates() {
        let basic = SchedulingConfig::basic();
        assert!(!basic.enable_health_checks);
        assert!(!basic.enable_conflict_resolution);
        assert!(!basic.enable_error_recovery);
        assert_eq!(basic.history_limit, SchedulingConfig::full().history_limit);
    }
}
