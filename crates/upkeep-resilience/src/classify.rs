//! ---
//! upkeep_section: "07-resilience-fault-tolerance"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Retry engine with error classification and circuit breaking."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Impact assigned to a classified error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    /// Recoverable noise, usually bad input.
    Low,
    /// Transient operational failure.
    Medium,
    /// Failure needing operator attention.
    High,
    /// Failure that makes further attempts pointless.
    Critical,
}

impl ErrorSeverity {
    /// Stable lowercase label used in logs, metrics, and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        }
    }
}

/// How the retry loop reacts to a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// `base * multiplier^(attempt-1)`, capped.
    ExponentialBackoff,
    /// `base * attempt`, capped.
    LinearBackoff,
    /// Retry without delay.
    Immediate,
    /// Short fixed delay; repeated failures feed the breaker.
    CircuitBreaker,
    /// Give up on this operation without treating it as a breaker failure.
    SkipAndContinue,
    /// Stop retrying immediately regardless of remaining budget.
    AbortOperation,
}

impl RecoveryStrategy {
    /// Stable lowercase label used in logs, metrics, and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::ExponentialBackoff => "exponential_backoff",
            RecoveryStrategy::LinearBackoff => "linear_backoff",
            RecoveryStrategy::Immediate => "immediate",
            RecoveryStrategy::CircuitBreaker => "circuit_breaker",
            RecoveryStrategy::SkipAndContinue => "skip_and_continue",
            RecoveryStrategy::AbortOperation => "abort_operation",
        }
    }
}

/// One row of the classification table.
#[derive(Debug, Clone, Copy)]
pub struct ErrorRule {
    /// Pattern name reported in statistics.
    pub name: &'static str,
    /// Regular expression matched against the rendered error chain.
    pub pattern: &'static str,
    /// Severity assigned on match.
    pub severity: ErrorSeverity,
    /// Strategy assigned on match.
    pub strategy: RecoveryStrategy,
}

/// Ordered rules; the first match wins.
pub const STANDARD_RULES: &[ErrorRule] = &[
    ErrorRule {
        name: "connection_error",
        pattern: r"(?i)connection|timed out|timeout",
        severity: ErrorSeverity::Medium,
        strategy: RecoveryStrategy::ExponentialBackoff,
    },
    ErrorRule {
        name: "permission_denied",
        pattern: r"(?i)permission denied|access denied|operation not permitted",
        severity: ErrorSeverity::High,
        strategy: RecoveryStrategy::AbortOperation,
    },
    ErrorRule {
        name: "disk_full",
        pattern: r"(?i)no space left|disk full|disk quota exceeded",
        severity: ErrorSeverity::Critical,
        strategy: RecoveryStrategy::AbortOperation,
    },
    ErrorRule {
        name: "out_of_memory",
        pattern: r"(?i)out of memory|cannot allocate memory|memory ?error",
        severity: ErrorSeverity::High,
        strategy: RecoveryStrategy::CircuitBreaker,
    },
    ErrorRule {
        name: "validation_error",
        pattern: r"(?i)validation|invalid",
        severity: ErrorSeverity::Low,
        strategy: RecoveryStrategy::SkipAndContinue,
    },
    ErrorRule {
        name: "http_500",
        pattern: r"(?i)\b500\b|internal server error",
        severity: ErrorSeverity::Medium,
        strategy: RecoveryStrategy::ExponentialBackoff,
    },
    ErrorRule {
        name: "rate_limited",
        pattern: r"(?i)\b429\b|too many requests|rate limit",
        severity: ErrorSeverity::Medium,
        strategy: RecoveryStrategy::LinearBackoff,
    },
    ErrorRule {
        name: "already_running",
        pattern: r"(?i)already running|lock (is )?(held|busy)",
        severity: ErrorSeverity::Medium,
        strategy: RecoveryStrategy::LinearBackoff,
    },
];

/// Pattern name reported for errors no rule matched.
pub const UNCLASSIFIED: &str = "unclassified";

/// Result of matching one error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClassification {
    /// Matched rule name or [`UNCLASSIFIED`].
    pub pattern: String,
    /// Assigned severity.
    pub severity: ErrorSeverity,
    /// Assigned strategy.
    pub strategy: RecoveryStrategy,
}

/// Compiled, ordered classification table.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<(ErrorRule, Regex)>,
}

impl ErrorClassifier {
    /// Compile `rules`, failing on the first invalid pattern.
    pub fn from_rules(rules: &[ErrorRule]) -> Result<Self, regex::Error> {
        let rules = rules
            .iter()
            .map(|rule| Regex::new(rule.pattern).map(|regex| (*rule, regex)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Classify a rendered error. Unmatched errors are medium/exponential.
    pub fn classify(&self, message: &str) -> ErrorClassification {
        self.rules
            .iter()
            .find(|(_, regex)| regex.is_match(message))
            .map(|(rule, _)| ErrorClassification {
                pattern: rule.name.to_owned(),
                severity: rule.severity,
                strategy: rule.strategy,
            })
            .unwrap_or_else(|| ErrorClassification {
                pattern: UNCLASSIFIED.to_owned(),
                severity: ErrorSeverity::Medium,
                strategy: RecoveryStrategy::ExponentialBackoff,
            })
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        let rules = STANDARD_RULES
            .iter()
            .filter_map(|rule| match Regex::new(rule.pattern) {
                Ok(regex) => Some((*rule, regex)),
                Err(err) => {
                    warn!(rule = rule.name, error = %err, "skipping invalid error rule");
                    None
                }
            })
            .collect();
        Self { rules }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(message: &str) -> ErrorClassification {
        ErrorClassifier::default().classify(message)
    }

    #[test]
    fn standard_rules_compile() {
        assert!(ErrorClassifier::from_rules(STANDARD_RULES).is_ok());
    }

    #[test]
    fn table_assigns_expected_strategies() {
        let cases = [
            ("Connection refused (os error 111)", "connection_error", RecoveryStrategy::ExponentialBackoff),
            ("request timed out after 30s", "connection_error", RecoveryStrategy::ExponentialBackoff),
            ("Permission denied (os error 13)", "permission_denied", RecoveryStrategy::AbortOperation),
            ("No space left on device", "disk_full", RecoveryStrategy::AbortOperation),
            ("worker ran out of memory", "out_of_memory", RecoveryStrategy::CircuitBreaker),
            ("validation failed for record 12", "validation_error", RecoveryStrategy::SkipAndContinue),
            ("upstream returned 500", "http_500", RecoveryStrategy::ExponentialBackoff),
            ("HTTP 429 Too Many Requests", "rate_limited", RecoveryStrategy::LinearBackoff),
            ("orchestration already running", "already_running", RecoveryStrategy::LinearBackoff),
        ];
        for (message, pattern, strategy) in cases {
            let classification = classify(message);
            assert_eq!(classification.pattern, pattern, "{message}");
            assert_eq!(classification.strategy, strategy, "{message}");
        }
    }

    #[test]
    fn disk_full_is_critical() {
        assert_eq!(classify("disk full").severity, ErrorSeverity::Critical);
    }

    #[test]
    fn first_matching_rule_wins() {
        // Mentions both a timeout and a permission problem.
        let classification = classify("timeout while permission denied");
        assert_eq!(classification.pattern, "connection_error");
    }

    #[test]
    fn unmatched_errors_default_to_exponential() {
        let classification = classify("something odd happened");
        assert_eq!(classification.pattern, UNCLASSIFIED);
        assert_eq!(classification.severity, ErrorSeverity::Medium);
        assert_eq!(classification.strategy, RecoveryStrategy::ExponentialBackoff);
    }
}
