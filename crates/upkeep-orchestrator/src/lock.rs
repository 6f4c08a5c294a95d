//! ---
//! upkeep_section: "07-orchestration"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Locked, bounded-concurrency instance orchestration."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use upkeep_common::time::deadline_after;

use crate::error::LockError;

const TARGET: &str = "upkeep::lock";

/// Interval between non-blocking attempts while a timeout is still running.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Owner metadata written into the lock file for diagnosis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Process id of the holder.
    pub pid: u32,
    /// When the lock was taken.
    pub acquired_at: DateTime<Utc>,
    /// Executable name of the holder.
    pub process_name: String,
}

impl LockRecord {
    /// Record describing the calling process, stamped now.
    pub fn current() -> Self {
        let process_name = std::env::current_exe()
            .ok()
            .and_then(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "upkeep".to_owned());
        Self {
            pid: std::process::id(),
            acquired_at: Utc::now(),
            process_name,
        }
    }
}

/// Host-wide exclusive lock on a named path, backed by `flock(2)`.
///
/// Acquisition never queues: every attempt is non-blocking and the optional
/// timeout only repeats those attempts. The kernel drops the flock when the
/// holder dies, so a leftover file does not by itself mean the lock is held.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Lock handle for `path`. Nothing touches the filesystem until [`FileLock::acquire`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Lock file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock, retrying every [`LOCK_POLL_INTERVAL`] until `timeout`.
    ///
    /// A zero timeout makes exactly one attempt. Contention yields
    /// [`LockError::Busy`] carrying the current owner record when readable.
    pub async fn acquire(&self, timeout: Duration) -> Result<LockGuard, LockError> {
        let deadline = deadline_after(Instant::now(), timeout);
        loop {
            if let Some(guard) = self.try_acquire()? {
                return Ok(guard);
            }
            let now = Instant::now();
            if now >= deadline {
                let owner = self.read_owner().unwrap_or(None);
                debug!(target: TARGET, path = %self.path.display(), owner = ?owner, "lock busy");
                return Err(LockError::Busy {
                    path: self.path.clone(),
                    owner,
                });
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Single non-blocking attempt. `Ok(None)` means someone else holds it.
    pub fn try_acquire(&self) -> Result<Option<LockGuard>, LockError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let Some(mut held) = lock_platform::try_lock(&self.path)? else {
            return Ok(None);
        };

        let record = LockRecord::current();
        let payload = serde_json::to_vec(&record)?;
        let file = held.file_mut();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&payload)?;
        file.sync_all()?;

        info!(
            target: TARGET,
            path = %self.path.display(),
            pid = record.pid,
            "lock acquired"
        );
        Ok(Some(LockGuard {
            path: self.path.clone(),
            held: Some(held),
            record,
        }))
    }

    /// Owner recorded in the lock file, if the file exists and holds a record.
    pub fn read_owner(&self) -> Result<Option<LockRecord>, LockError> {
        let mut contents = String::new();
        match File::open(&self.path) {
            Ok(mut file) => {
                file.read_to_string(&mut contents)?;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        if contents.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&contents)?))
    }
}

/// Scoped ownership of a [`FileLock`]. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    held: Option<lock_platform::Held>,
    record: LockRecord,
}

impl LockGuard {
    /// Owner record written at acquisition.
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Lock file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether [`LockGuard::release`] already ran.
    pub fn is_released(&self) -> bool {
        self.held.is_none()
    }

    /// Remove the lock file and drop the flock. Calling it again is a no-op.
    pub fn release(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };
        // Unlink while still holding so no newcomer locks the doomed inode.
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(target: TARGET, path = %self.path.display(), error = %err, "failed removing lock file")
            }
        }
        drop(held);
        info!(target: TARGET, path = %self.path.display(), "lock released");
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(unix)]
mod lock_platform {
    use std::fs::{File, OpenOptions};
    use std::os::unix::fs::MetadataExt;
    use std::path::Path;

    use nix::errno::Errno;
    use nix::fcntl::{Flock, FlockArg};

    use super::*;

    pub(super) struct Held(Flock<File>);

    impl std::fmt::Debug for Held {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("Held(flock)")
        }
    }

    impl Held {
        pub(super) fn file_mut(&mut self) -> &mut File {
            &mut self.0
        }
    }

    pub(super) fn try_lock(path: &Path) -> Result<Option<Held>, LockError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let locked = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => locked,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => return Ok(None),
            Err((_, errno)) => return Err(io::Error::from(errno).into()),
        };
        // The previous holder unlinks before unlocking; a lock on an inode
        // that is no longer at `path` protects nothing.
        let ours = locked.metadata()?;
        match std::fs::metadata(path) {
            Ok(current) if current.ino() == ours.ino() && current.dev() == ours.dev() => {
                Ok(Some(Held(locked)))
            }
            Ok(_) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(not(unix))]
mod lock_platform {
    use std::fs::{File, OpenOptions};
    use std::path::Path;

    use super::*;

    #[derive(Debug)]
    pub(super) struct Held(File);

    impl Held {
        pub(super) fn file_mut(&mut self) -> &mut File {
            &mut self.0
        }
    }

    pub(super) fn try_lock(path: &Path) -> Result<Option<Held>, LockError> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => Ok(Some(Held(file))),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn second_acquire_is_busy_and_names_owner() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path().join("run.lock"));
        let guard = lock.acquire(Duration::ZERO).await.unwrap();
        assert_eq!(guard.record().pid, std::process::id());

        match lock.acquire(Duration::from_millis(250)).await {
            Err(LockError::Busy { owner, .. }) => {
                assert_eq!(owner.unwrap().pid, std::process::id());
            }
            other => panic!("expected busy, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unbounded_timeout_does_not_overflow_the_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path().join("run.lock"));
        let guard = lock.acquire(Duration::MAX).await.unwrap();
        assert!(!guard.is_released());
    }

    #[tokio::test]
    async fn release_is_idempotent_and_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path().join("nested").join("run.lock"));
        let mut guard = lock.acquire(Duration::ZERO).await.unwrap();
        assert!(lock.path().exists());

        guard.release();
        guard.release();
        assert!(guard.is_released());
        assert!(!lock.path().exists());
        assert!(lock.read_owner().unwrap().is_none());
        drop(guard);

        let again = lock.acquire(Duration::ZERO).await;
        assert!(again.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquirers_get_at_most_one_lock() {
        let dir = tempfile::tempdir().unwrap();
        let lock = Arc::new(FileLock::new(dir.path().join("run.lock")));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            tasks.push(tokio::spawn(async move {
                match lock.acquire(Duration::from_millis(200)).await {
                    Ok(guard) => {
                        tokio::time::sleep(Duration::from_millis(600)).await;
                        drop(guard);
                        true
                    }
                    Err(LockError::Busy { .. }) => false,
                    Err(err) => panic!("unexpected lock error: {err}"),
                }
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn leftover_unlocked_file_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.lock");
        fs::write(&path, br#"{"pid":1,"acquired_at":"2024-01-01T00:00:00Z","process_name":"ghost"}"#)
            .unwrap();
        let lock = FileLock::new(&path);
        assert_eq!(lock.read_owner().unwrap().unwrap().process_name, "ghost");

        let guard = lock.acquire(Duration::ZERO).await.unwrap();
        assert_eq!(lock.read_owner().unwrap().unwrap().pid, guard.record().pid);
    }
}
