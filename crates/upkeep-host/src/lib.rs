//! ---
//! upkeep_section: "02-host-inspection"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Process table, signalling, and resource sampling."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
//! Host inspection seams.
//!
//! Everything that touches the live process table or kernel counters sits
//! behind [`ProcessTable`] and [`ResourceSampler`] so the gates above can be
//! exercised against in-memory hosts.

pub mod error;
pub mod lockfile;
pub mod process;
pub mod resources;

pub use error::HostError;
pub use lockfile::is_flock_held;
pub use process::{
    scan_overlap, InMemoryProcessTable, OverlapScan, ProcessInfo, ProcessTable, SystemProcessTable,
};
pub use resources::{
    DiskUsage, InMemoryResourceSampler, ResourceSampler, ResourceSnapshot, SystemResourceSampler,
};
