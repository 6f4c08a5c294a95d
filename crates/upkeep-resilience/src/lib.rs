//! ---
//! upkeep_section: "07-resilience-fault-tolerance"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Retry engine with error classification and circuit breaking."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Generic retry engine used to wrap orchestration-level operations.

pub mod backoff;
pub mod breaker;
pub mod classify;
pub mod manager;

pub use backoff::BackoffPolicy;
pub use breaker::{CircuitBreakerRegistry, CircuitBreakerSnapshot};
pub use classify::{ErrorClassification, ErrorClassifier, ErrorRule, ErrorSeverity, RecoveryStrategy};
pub use manager::{
    ErrorRecord, ErrorRecoveryManager, ErrorStatistics, RecoveryAttempt, RecoveryResult,
    RecoverySummary,
};

/// Crate prelude collecting the types needed to wrap an operation.
pub mod prelude {
    pub use super::classify::{ErrorSeverity, RecoveryStrategy};
    pub use super::manager::{ErrorRecoveryManager, RecoveryResult};
}
