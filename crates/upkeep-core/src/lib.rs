//! ---
//! upkeep_section: "08-scheduling"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Service context and phase sequencing for scheduled updates."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
//! Top of the upkeep stack: the explicit [`ServiceContext`] owning every
//! component, and the [`SchedulingCoordinator`] that walks a scheduled
//! execution through its health, conflict and execution phases.

pub mod context;
pub mod coordinator;
pub mod entry;

pub use context::{HostSeams, ServiceContext, StatisticsExport};
pub use coordinator::{
    ExecutionSummary, PhaseOutcome, SchedulingCoordinator, SchedulingPhase, SchedulingRequest,
    SchedulingResult, SchedulingState, SchedulingStatus, SCHEDULING_REPORT_PREFIX,
};
pub use entry::{run_basic_update, run_full_update};
