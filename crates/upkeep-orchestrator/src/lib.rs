//! ---
//! upkeep_section: "07-orchestration"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Locked, bounded-concurrency instance orchestration."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
//! Runs the per-instance updates of one orchestration under a host-wide lock.
//!
//! The [`Orchestrator`] owns the run: it takes the [`FileLock`], validates
//! instances against the shared processor state, executes them through the
//! [`InstanceUpdateManager`] contract with bounded concurrency and a
//! per-instance timeout, retries the failed set in rounds, and persists an
//! [`OrchestrationResult`] whatever the outcome.
#![warn(missing_docs)]

pub mod error;
pub mod lock;
pub mod manager;
pub mod orchestrator;
pub mod processors;
pub mod result;

pub use error::{LockError, OrchestrationError};
pub use lock::{FileLock, LockGuard, LockRecord};
pub use manager::{InstanceUpdateManager, InstanceUpdateReport, InstanceUpdaterFactory, UpdateRequest};
pub use orchestrator::{Orchestrator, ORCHESTRATION_REPORT_PREFIX};
pub use processors::HostProcessorLookup;
pub use result::{OrchestrationResult, OrchestrationStatus};
