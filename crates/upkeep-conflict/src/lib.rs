//! ---
//! upkeep_section: "06-conflict-management"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Contention detection and remediation."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
//! Detection of process, lock, resource, instance, and schedule contention,
//! plus the remediation strategies applied before an orchestration starts.

pub mod detect;
pub mod resolver;
pub mod types;

pub use resolver::{ConflictResolver, ConflictStatistics, HistoryEntry};
pub use types::{
    ConflictEvidence, ConflictInfo, ConflictSeverity, ConflictType, ResolutionResult,
    ResolutionStrategy,
};
