//! ---
//! upkeep_section: "02-host-inspection"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Process table, signalling, and resource sampling."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("process {0} not found")]
    ProcessNotFound(u32),
    #[error("failed to signal process {pid}: {reason}")]
    Signal { pid: u32, reason: String },
    #[error("no mounted filesystem covers {0}")]
    NoFilesystem(PathBuf),
    #[error("host inspection failed: {0}")]
    Inspect(String),
}
