//! ---
//! upkeep_section: "01-core-functionality"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Shared primitives and utilities for the orchestration runtime."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
//! Core shared primitives for the upkeep workspace.
//! This crate exposes configuration loading, logging, report persistence,
//! the shared processor-state lookup, and the cooperative shutdown flag.

pub mod config;
pub mod logging;
pub mod reports;
pub mod shutdown;
pub mod state;
pub mod time;

pub use config::{
    AppConfig, ConflictConfig, HealthConfig, InstanceConfig, LoggingConfig, OrchestrationConfig,
    PathsConfig, RecoveryConfig, SchedulingConfig,
};
pub use logging::{init_console_tracing, init_tracing, LogFormat};
pub use reports::ReportStore;
pub use shutdown::ShutdownFlag;
pub use state::{ActiveProcessorLookup, InMemoryProcessorRegistry};
