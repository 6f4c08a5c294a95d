//! ---
//! upkeep_section: "07-resilience-fault-tolerance"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Retry engine with error classification and circuit breaking."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::time::Duration;

use upkeep_common::RecoveryConfig;

use crate::classify::RecoveryStrategy;

/// Delay computation for each [`RecoveryStrategy`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay unit for exponential and linear growth.
    pub base_delay: Duration,
    /// Upper bound for every computed delay.
    pub max_delay: Duration,
    /// Growth factor for exponential backoff.
    pub multiplier: f64,
    /// Fixed delay for the circuit breaker strategy.
    pub breaker_delay: Duration,
}

impl BackoffPolicy {
    /// Build the policy from the recovery section of the configuration.
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            multiplier: config.exponential_base.max(1.0),
            breaker_delay: config.circuit_breaker_delay,
        }
    }

    /// Delay to wait after failed attempt `attempt` (1-indexed).
    pub fn delay_for(&self, strategy: RecoveryStrategy, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match strategy {
            RecoveryStrategy::ExponentialBackoff => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                self.capped(self.base_delay.as_secs_f64() * self.multiplier.powi(exponent))
            }
            RecoveryStrategy::LinearBackoff => {
                self.capped(self.base_delay.as_secs_f64() * f64::from(attempt))
            }
            RecoveryStrategy::CircuitBreaker => self.breaker_delay.min(self.max_delay),
            RecoveryStrategy::Immediate
            | RecoveryStrategy::SkipAndContinue
            | RecoveryStrategy::AbortOperation => Duration::ZERO,
        }
    }

    fn capped(&self, seconds: f64) -> Duration {
        if !seconds.is_finite() || seconds >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(seconds.max(0.0))
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&RecoveryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_grows_until_capped() {
        let policy = BackoffPolicy::default();
        let delays: Vec<_> = (1..=12)
            .map(|attempt| policy.delay_for(RecoveryStrategy::ExponentialBackoff, attempt))
            .collect();
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[2], Duration::from_secs(4));
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert_eq!(*delays.last().unwrap(), policy.max_delay);
    }

    #[test]
    fn huge_attempts_do_not_overflow() {
        let policy = BackoffPolicy::default();
        assert_eq!(
            policy.delay_for(RecoveryStrategy::ExponentialBackoff, u32::MAX),
            policy.max_delay
        );
        assert_eq!(
            policy.delay_for(RecoveryStrategy::LinearBackoff, u32::MAX),
            policy.max_delay
        );
    }

    #[test]
    fn linear_and_fixed_strategies() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(7),
            multiplier: 2.0,
            breaker_delay: Duration::from_secs(5),
        };
        assert_eq!(policy.delay_for(RecoveryStrategy::LinearBackoff, 3), Duration::from_secs(6));
        assert_eq!(policy.delay_for(RecoveryStrategy::LinearBackoff, 4), Duration::from_secs(7));
        assert_eq!(policy.delay_for(RecoveryStrategy::CircuitBreaker, 9), Duration::from_secs(5));
        assert_eq!(policy.delay_for(RecoveryStrategy::Immediate, 3), Duration::ZERO);
    }
}
