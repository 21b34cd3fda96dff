use crate::error::FailureKind;
use std::time::Duration;

/// Bounded attempts with capped exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts allowed for agent execution failures
    pub max_attempts: u32,
    /// Attempts allowed when calls keep timing out
    pub timeout_max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between attempts
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout_max_attempts: 2,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            timeout_max_attempts: 1,
            ..Self::default()
        }
    }

    /// Attempt budget for a failure kind; non-retryable kinds get one attempt
    pub fn max_attempts_for(&self, kind: FailureKind) -> u32 {
        match kind {
            FailureKind::AgentExecution => self.max_attempts.max(1),
            FailureKind::Timeout => self.timeout_max_attempts.max(1),
            _ => 1,
        }
    }

    /// Delay to wait after the `attempt`-th failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = (self.base_delay.as_millis() as f64 * factor).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(1, 50 ; "first retry waits the base delay")]
    #[test_case(2, 100 ; "second retry doubles")]
    #[test_case(4, 400 ; "fourth retry")]
    #[test_case(20, 2000 ; "capped at max delay")]
    fn test_backoff(attempt: u32, expected_ms: u64) {
        assert_eq!(RetryPolicy::default().delay_for(attempt), Duration::from_millis(expected_ms));
    }

    #[test]
    fn test_budget_per_failure_kind() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts_for(FailureKind::AgentExecution), 3);
        assert_eq!(policy.max_attempts_for(FailureKind::Timeout), 2);
        assert_eq!(policy.max_attempts_for(FailureKind::CircuitOpen), 1);
        assert_eq!(policy.max_attempts_for(FailureKind::Decomposition), 1);
    }
}
