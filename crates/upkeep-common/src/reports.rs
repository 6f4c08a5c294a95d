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
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::time::{file_age, timestamp_slug};

/// JSON report storage with age-based retention.
#[derive(Debug, Clone)]
pub struct ReportStore {
    root: PathBuf,
}

impl ReportStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("unable to create report directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist `report` as `<prefix>-<timestamp>-<id>.json` and return its path.
    pub fn write<T: Serialize>(
        &self,
        prefix: &str,
        id: &str,
        at: DateTime<Utc>,
        report: &T,
    ) -> Result<PathBuf> {
        let path = self
            .root
            .join(format!("{}-{}-{}.json", prefix, timestamp_slug(at), id));
        write_json_atomic(&path, report)?;
        debug!(path = %path.display(), "report persisted");
        Ok(path)
    }

    /// Report files for `prefix`, oldest first.
    pub fn list(&self, prefix: &str) -> Vec<PathBuf> {
        let needle = format!("{prefix}-");
        let mut entries: Vec<PathBuf> = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                let name = entry.file_name().to_string_lossy();
                name.starts_with(&needle) && name.ends_with(".json")
            })
            .map(|entry| entry.into_path())
            .collect();
        entries.sort();
        entries
    }

    /// Delete report files whose modification time is older than `retention`.
    pub fn prune_older_than(&self, prefix: &str, retention: Duration) -> Result<usize> {
        let mut removed = 0;
        for path in self.list(prefix) {
            let age = match file_age(&path, SystemTime::now()) {
                Ok(age) => age,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "unable to stat report");
                    continue;
                }
            };
            if age <= retention {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed pruning report")
                }
            }
        }
        if removed > 0 {
            debug!(prefix, removed, "pruned expired reports");
        }
        Ok(removed)
    }
}

/// Serialize `value` to a sibling temp file and rename it into place.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("unable to create directory {}", parent.display()))?;
    }
    let payload = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, payload).with_context(|| format!("unable to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("unable to move report into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn writes_and_lists_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::new(dir.path()).unwrap();
        let now = Utc::now();
        store.write("orchestration", "a", now, &json!({"ok": true})).unwrap();
        store.write("scheduling", "b", now, &json!({"ok": false})).unwrap();

        let listed = store.list("orchestration");
        assert_eq!(listed.len(), 1);
        let body: serde_json::Value =
            serde_json::from_slice(&fs::read(&listed[0]).unwrap()).unwrap();
        assert_eq!(body["ok"], json!(true));
    }

    #[test]
    fn prune_keeps_recent_reports() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::new(dir.path()).unwrap();
        store.write("orchestration", "a", Utc::now(), &json!({})).unwrap();
        let removed = store
            .prune_older_than("orchestration", Duration::from_secs(3600))
            .unwrap();
        assert_eq!(removed, 0);
        let removed = store
            .prune_older_than("orchestration", Duration::ZERO)
            .unwrap();
        assert!(removed <= 1);
    }
}
