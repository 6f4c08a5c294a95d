//! ---
//! upkeep_section: "07-orchestration"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Locked, bounded-concurrency instance orchestration."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::lock::LockRecord;

/// Failures of the host-wide file lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another live owner holds the lock. This is the normal "already running" outcome.
    #[error("lock {} is held{}", .path.display(), owner_suffix(.owner))]
    Busy {
        /// Lock file path.
        path: PathBuf,
        /// Owner record read from the file, when readable.
        owner: Option<LockRecord>,
    },
    /// Filesystem failure opening, locking, or writing the lock file.
    #[error("lock file i/o failed: {0}")]
    Io(#[from] io::Error),
    /// The owner record could not be encoded or decoded.
    #[error("lock owner record is malformed: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn owner_suffix(owner: &Option<LockRecord>) -> String {
    match owner {
        Some(record) => format!(
            " by pid {} ({}) since {}",
            record.pid,
            record.process_name,
            record.acquired_at.to_rfc3339()
        ),
        None => String::new(),
    }
}

/// Run-level failures of [`crate::Orchestrator::run_monthly_updates`].
///
/// Per-instance failures never surface here; they are recorded in the result.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// Another orchestration holds the global lock.
    #[error("orchestration already running{}", owner_suffix(.owner))]
    AlreadyRunning {
        /// Owner of the lock at the time of the attempt.
        owner: Option<LockRecord>,
    },
    /// The lock could not be taken for a reason other than contention.
    #[error(transparent)]
    Lock(LockError),
    /// Instance validation could not be carried out (for example the shared
    /// state lookup failed).
    #[error("instance validation failed: {0:#}")]
    Validation(anyhow::Error),
    /// The report directory is unusable.
    #[error("report persistence unavailable: {0:#}")]
    Persistence(anyhow::Error),
    /// A stop was requested before the run started.
    #[error("orchestration cancelled before start")]
    Cancelled,
}

impl From<LockError> for OrchestrationError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Busy { owner, .. } => OrchestrationError::AlreadyRunning { owner },
            other => OrchestrationError::Lock(other),
        }
    }
}
