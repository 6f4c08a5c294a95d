//! ---
//! upkeep_section: "02-host-inspection"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Process table, signalling, and resource sampling."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, ProcessRefreshKind, System};

use crate::error::HostError;

/// Point-in-time host utilisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub memory_available_bytes: u64,
    pub load_average_one: f64,
    pub cpu_count: usize,
    /// Aggregate disk read+write throughput over the sampling window.
    pub io_bytes_per_sec: u64,
}

impl ResourceSnapshot {
    /// One-minute load normalised by logical cpu count.
    pub fn load_per_cpu(&self) -> f64 {
        self.load_average_one / self.cpu_count.max(1) as f64
    }
}

impl Default for ResourceSnapshot {
    fn default() -> Self {
        Self {
            cpu_percent: 0.0,
            memory_percent: 0.0,
            memory_available_bytes: 0,
            load_average_one: 0.0,
            cpu_count: 1,
            io_bytes_per_sec: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub mount_point: PathBuf,
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_percent: f32,
}

impl DiskUsage {
    pub fn new(mount_point: impl Into<PathBuf>, total_bytes: u64, available_bytes: u64) -> Self {
        let used = total_bytes.saturating_sub(available_bytes);
        let used_percent = if total_bytes == 0 {
            0.0
        } else {
            (used as f64 / total_bytes as f64 * 100.0) as f32
        };
        Self {
            mount_point: mount_point.into(),
            total_bytes,
            available_bytes,
            used_percent,
        }
    }
}

#[async_trait]
pub trait ResourceSampler: Send + Sync {
    async fn sample(&self) -> Result<ResourceSnapshot, HostError>;

    /// Usage of the filesystem holding `path`.
    fn disk_usage(&self, path: &Path) -> Result<DiskUsage, HostError>;
}

/// Pick the entry whose mount point is the longest prefix of `path`.
fn covering_mount<'a, I>(path: &Path, mounts: I) -> Option<&'a DiskUsage>
where
    I: IntoIterator<Item = &'a DiskUsage>,
{
    mounts
        .into_iter()
        .filter(|disk| path.starts_with(&disk.mount_point))
        .max_by_key(|disk| disk.mount_point.components().count())
}

/// sysinfo-backed sampler. CPU and I/O figures need two refreshes, so
/// [`ResourceSampler::sample`] sleeps for `window` between them.
pub struct SystemResourceSampler {
    system: Mutex<System>,
    window: Duration,
}

impl SystemResourceSampler {
    pub fn new() -> Self {
        Self::with_window(Duration::from_millis(250))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            system: Mutex::new(System::new()),
            window: window.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL),
        }
    }
}

impl Default for SystemResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SystemResourceSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemResourceSampler")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ResourceSampler for SystemResourceSampler {
    async fn sample(&self) -> Result<ResourceSnapshot, HostError> {
        {
            let mut system = self.system.lock();
            system.refresh_cpu();
            system.refresh_processes_specifics(ProcessRefreshKind::new().with_disk_usage());
        }
        tokio::time::sleep(self.window).await;

        let mut system = self.system.lock();
        system.refresh_cpu();
        system.refresh_memory();
        system.refresh_processes_specifics(ProcessRefreshKind::new().with_disk_usage());

        let total_memory = system.total_memory();
        let memory_percent = if total_memory == 0 {
            0.0
        } else {
            (system.used_memory() as f64 / total_memory as f64 * 100.0) as f32
        };
        let io_bytes: u64 = system
            .processes()
            .values()
            .map(|process| {
                let usage = process.disk_usage();
                usage.read_bytes.saturating_add(usage.written_bytes)
            })
            .sum();
        let io_bytes_per_sec = (io_bytes as f64 / self.window.as_secs_f64()) as u64;

        Ok(ResourceSnapshot {
            cpu_percent: system.global_cpu_info().cpu_usage(),
            memory_percent,
            memory_available_bytes: system.available_memory(),
            load_average_one: System::load_average().one,
            cpu_count: system.cpus().len().max(1),
            io_bytes_per_sec,
        })
    }

    fn disk_usage(&self, path: &Path) -> Result<DiskUsage, HostError> {
        let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();
        let mounts: Vec<DiskUsage> = disks
            .list()
            .iter()
            .map(|disk| {
                DiskUsage::new(
                    disk.mount_point(),
                    disk.total_space(),
                    disk.available_space(),
                )
            })
            .collect();
        covering_mount(&target, &mounts)
            .cloned()
            .ok_or(HostError::NoFilesystem(target))
    }
}

/// Sampler returning values set by the caller.
#[derive(Debug, Default)]
pub struct InMemoryResourceSampler {
    snapshot: Mutex<ResourceSnapshot>,
    disks: Mutex<BTreeMap<PathBuf, DiskUsage>>,
}

impl InMemoryResourceSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_snapshot(&self, snapshot: ResourceSnapshot) {
        *self.snapshot.lock() = snapshot;
    }

    /// Register a mount with the given used percentage of a 100 GiB volume.
    pub fn set_disk_percent(&self, mount_point: impl Into<PathBuf>, used_percent: f32) {
        let total: u64 = 100 * 1024 * 1024 * 1024;
        let used = (total as f64 * f64::from(used_percent.clamp(0.0, 100.0)) / 100.0) as u64;
        let mount_point = mount_point.into();
        self.disks.lock().insert(
            mount_point.clone(),
            DiskUsage::new(mount_point, total, total - used),
        );
    }
}

#[async_trait]
impl ResourceSampler for InMemoryResourceSampler {
    async fn sample(&self) -> Result<ResourceSnapshot, HostError> {
        Ok(self.snapshot.lock().clone())
    }

    fn disk_usage(&self, path: &Path) -> Result<DiskUsage, HostError> {
        let disks = self.disks.lock();
        covering_mount(path, disks.values())
            .cloned()
            .ok_or_else(|| HostError::NoFilesystem(path.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_mount_prefix_wins() {
        let sampler = InMemoryResourceSampler::new();
        sampler.set_disk_percent("/", 10.0);
        sampler.set_disk_percent("/var", 97.0);

        let var = sampler.disk_usage(Path::new("/var/lib/upkeep")).unwrap();
        assert_eq!(var.mount_point, PathBuf::from("/var"));
        assert!(var.used_percent > 96.0);

        let root = sampler.disk_usage(Path::new("/srv")).unwrap();
        assert_eq!(root.mount_point, PathBuf::from("/"));
    }

    #[test]
    fn disk_usage_handles_empty_volume() {
        let usage = DiskUsage::new("/", 0, 0);
        assert_eq!(usage.used_percent, 0.0);
    }

    #[test]
    fn load_is_normalised_per_cpu() {
        let snapshot = ResourceSnapshot {
            load_average_one: 8.0,
            cpu_count: 4,
            ..ResourceSnapshot::default()
        };
        assert_eq!(snapshot.load_per_cpu(), 2.0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn system_sampler_reports_sane_ranges() {
        let sampler = SystemResourceSampler::with_window(Duration::from_millis(200));
        let snapshot = sampler.sample().await.unwrap();
        assert!(snapshot.cpu_count >= 1);
        assert!((0.0..=100.0).contains(&snapshot.memory_percent));
    }
}
