//! ---
//! upkeep_section: "08-scheduling"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Service context and phase sequencing for scheduled updates."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::sync::Arc;

use upkeep_common::SchedulingConfig;

use crate::context::ServiceContext;
use crate::coordinator::{SchedulingCoordinator, SchedulingRequest, SchedulingResult};

/// Keep the configured names and timeouts, switch every gate off.
fn without_gates(base: &SchedulingConfig) -> SchedulingConfig {
    let basic = SchedulingConfig::basic();
    SchedulingConfig {
        enable_health_checks: basic.enable_health_checks,
        enable_conflict_resolution: basic.enable_conflict_resolution,
        enable_error_recovery: basic.enable_error_recovery,
        ..base.clone()
    }
}

/// Lock-protected orchestration only: every gate auto-passes and the
/// orchestrator runs without the recovery wrapper.
pub async fn run_basic_update(
    context: Arc<ServiceContext>,
    request: SchedulingRequest,
) -> SchedulingResult {
    let config = without_gates(&context.config().scheduling);
    SchedulingCoordinator::with_config(context, config)
        .execute_scheduled_update(request)
        .await
}

/// Gates and recovery as configured in `[scheduling]`; every toggle defaults to on.
pub async fn run_full_update(
    context: Arc<ServiceContext>,
    request: SchedulingRequest,
) -> SchedulingResult {
    SchedulingCoordinator::new(context)
        .execute_scheduled_update(request)
        .await
}
