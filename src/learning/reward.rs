use crate::protocol::TaskResult;
use serde::{Deserialize, Serialize};

/// Reward shaping
///
/// success: `quality_weight * quality + speed_weight / (1 + secs / reference_secs)`
/// failure: `failure_reward`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    pub quality_weight: f64,
    pub speed_weight: f64,
    /// Execution time at which the speed term is halved
    pub reference_secs: f64,
    pub failure_reward: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            quality_weight: 1.0,
            speed_weight: 0.5,
            reference_secs: 1.0,
            failure_reward: -1.0,
        }
    }
}

impl RewardConfig {
    /// Scalar reward for one result
    pub fn reward(&self, result: &TaskResult) -> f64 {
        if !result.success {
            return self.failure_reward;
        }
        let quality = result.quality_score.clamp(0.0, 1.0);
        let secs = result.execution_time.as_secs_f64();
        let reference = if self.reference_secs > 0.0 {
            self.reference_secs
        } else {
            1.0
        };
        self.quality_weight * quality + self.speed_weight / (1.0 + secs / reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::time::Duration;
    use test_case::test_case;

    fn result(quality: f64, millis: u64) -> TaskResult {
        TaskResult::success("t", "a", json!(null))
            .with_quality(quality)
            .with_execution_time(Duration::from_millis(millis))
    }

    #[test_case(1.0, 0, 1.5 ; "instant perfect result")]
    #[test_case(1.0, 1000, 1.25 ; "one reference second halves speed term")]
    #[test_case(0.5, 3000, 0.625 ; "slow mediocre result")]
    #[test_case(0.0, 0, 0.5 ; "speed only")]
    fn test_success_reward(quality: f64, millis: u64, expected: f64) {
        let reward = RewardConfig::default().reward(&result(quality, millis));
        assert!((reward - expected).abs() < 1e-9, "got {}", reward);
    }

    #[test]
    fn test_failure_reward() {
        let failed = TaskResult::failure("t", "a", "boom");
        assert_eq!(RewardConfig::default().reward(&failed), -1.0);
    }

    proptest! {
        #[test]
        fn success_reward_is_bounded(q in 0.0f64..=1.0, ms in 0u64..600_000) {
            let config = RewardConfig::default();
            let reward = config.reward(&result(q, ms));
            prop_assert!(reward >= 0.0);
            prop_assert!(reward <= config.quality_weight + config.speed_weight + 1e-9);
            prop_assert!(reward > config.failure_reward);
        }
    }
}
