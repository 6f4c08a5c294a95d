//! ---
//! upkeep_section: "05-health-readiness"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Readiness probes and the pre-execution health gate."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
//! Health probes and the readiness gate consulted before every orchestration.

pub mod checker;
pub mod probes;
pub mod status;

pub use checker::HealthChecker;
pub use probes::{
    DataStoreProbe, DependencyProbe, DiskSpaceProbe, HealthProbe, InstanceProbe, NetworkProbe,
    PermissionsProbe, ProbeReport, ProcessConflictProbe, ResourceProbe,
};
pub use status::{is_system_ready_for_update, HealthCheckResult, HealthStatus, SystemHealthStatus};
