use super::features::FEATURE_DIM;
use super::ExplorationRng;
use crate::config::LearningConfig;
use crate::protocol::{AgentId, Experience};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const WEIGHT_LIMIT: f64 = 10.0;
const BASELINE_SMOOTHING: f64 = 0.1;

/// Linear softmax policy trained with REINFORCE and a running baseline
///
/// Each agent owns a weight vector over the task features plus a bias; the
/// preference for an agent is the dot product with the task's features.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyGradientEngine {
    weights: HashMap<AgentId, Vec<f64>>,
    learning_rate: f64,
    temperature: f64,
    baseline: f64,
    rng: ExplorationRng,
    updates: u64,
    reward_sum: f64,
    /// Probability mass outside the greedy choice at the last selection
    last_exploration: f64,
}

impl PolicyGradientEngine {
    pub fn new(config: &LearningConfig, seed: u64) -> Self {
        Self {
            weights: HashMap::new(),
            learning_rate: config.policy_learning_rate,
            temperature: config.temperature.max(1e-3),
            baseline: 0.0,
            rng: ExplorationRng::new(seed),
            updates: 0,
            reward_sum: 0.0,
            last_exploration: 0.0,
        }
    }

    fn score(&self, agent: &str, state: &[f64]) -> f64 {
        let Some(w) = self.weights.get(agent) else {
            return 0.0;
        };
        let bias = w.last().copied().unwrap_or(0.0);
        w.iter().zip(state.iter()).map(|(w, x)| w * x).sum::<f64>() + bias
    }

    fn probabilities(&self, state: &[f64], agents: &[AgentId]) -> Vec<f64> {
        let scores: Vec<f64> = agents
            .iter()
            .map(|a| self.score(a, state) / self.temperature)
            .collect();
        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
        let total: f64 = exps.iter().sum();
        exps.into_iter().map(|e| e / total).collect()
    }

    /// Eligible agents by descending policy probability; ties keep input order
    pub fn rank_agents(&self, state: &[f64], eligible: &[AgentId]) -> Vec<(AgentId, f64)> {
        let mut ranked: Vec<(AgentId, f64)> = eligible
            .iter()
            .cloned()
            .zip(self.probabilities(state, eligible))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked
    }

    /// Samples an agent from the softmax policy
    pub fn select_agent(&mut self, state: &[f64], eligible: &[AgentId]) -> Option<AgentId> {
        if eligible.is_empty() {
            return None;
        }
        for agent in eligible {
            self.weights
                .entry(agent.clone())
                .or_insert_with(|| vec![0.0; FEATURE_DIM + 1]);
        }
        let probabilities = self.probabilities(state, eligible);
        let greedy = probabilities.iter().copied().fold(0.0, f64::max);
        self.last_exploration = 1.0 - greedy;

        let draw = self.rng.next_f64();
        let mut cumulative = 0.0;
        for (agent, p) in eligible.iter().zip(probabilities.iter()) {
            cumulative += p;
            if draw < cumulative {
                return Some(agent.clone());
            }
        }
        eligible.last().cloned()
    }

    /// Gradient ascent on log pi(action) scaled by the advantage
    ///
    /// Competitors are every agent the policy has scored so far.
    pub fn update(&mut self, experience: &Experience) {
        let advantage = experience.reward - self.baseline;
        self.weights
            .entry(experience.action.clone())
            .or_insert_with(|| vec![0.0; FEATURE_DIM + 1]);

        let mut agents: Vec<AgentId> = self.weights.keys().cloned().collect();
        agents.sort();
        let probabilities = self.probabilities(&experience.state, &agents);

        let mut input = experience.state.clone();
        input.resize(FEATURE_DIM, 0.0);
        input.push(1.0);

        for (agent, p) in agents.iter().zip(probabilities) {
            let indicator = if *agent == experience.action { 1.0 } else { 0.0 };
            let scale = self.learning_rate * advantage * (indicator - p);
            if let Some(w) = self.weights.get_mut(agent) {
                for (weight, x) in w.iter_mut().zip(input.iter()) {
                    *weight = (*weight + scale * x).clamp(-WEIGHT_LIMIT, WEIGHT_LIMIT);
                }
            }
        }

        self.baseline += BASELINE_SMOOTHING * (experience.reward - self.baseline);
        self.updates += 1;
        self.reward_sum += experience.reward;
    }

    pub fn exploration_rate(&self) -> f64 {
        self.last_exploration
    }

    /// Total number of weights
    pub fn parameter_count(&self) -> usize {
        self.weights.values().map(Vec::len).sum()
    }

    pub fn update_count(&self) -> u64 {
        self.updates
    }

    pub fn average_reward(&self) -> f64 {
        if self.updates == 0 {
            0.0
        } else {
            self.reward_sum / self.updates as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn experience(state: &[f64], action: &str, reward: f64) -> Experience {
        Experience {
            agent_id: action.to_string(),
            state: state.to_vec(),
            action: action.to_string(),
            reward,
            next_state: state.to_vec(),
            terminal: true,
            timestamp: Utc::now(),
        }
    }

    fn engine() -> PolicyGradientEngine {
        let config = LearningConfig {
            policy_learning_rate: 0.5,
            ..LearningConfig::default()
        };
        PolicyGradientEngine::new(&config, 11)
    }

    #[test]
    fn test_untrained_policy_is_uniform() {
        let mut engine = engine();
        let state = vec![0.5; FEATURE_DIM];
        let eligible = vec!["a".to_string(), "b".to_string()];
        engine.select_agent(&state, &eligible);

        let ranked = engine.rank_agents(&state, &eligible);
        assert!((ranked[0].1 - 0.5).abs() < 1e-9);
        assert!((engine.exploration_rate() - 0.5).abs() < 1e-9);
        assert_eq!(engine.parameter_count(), 2 * (FEATURE_DIM + 1));
    }

    #[test]
    fn test_rewards_shift_probability_mass() {
        let mut engine = engine();
        let state = vec![0.5; FEATURE_DIM];
        let eligible = vec!["a".to_string(), "b".to_string()];
        engine.select_agent(&state, &eligible);

        for _ in 0..30 {
            engine.update(&experience(&state, "b", 1.0));
            engine.update(&experience(&state, "a", -1.0));
        }
        let ranked = engine.rank_agents(&state, &eligible);
        assert_eq!(ranked[0].0, "b");
        assert!(ranked[0].1 > 0.9);
        assert_eq!(engine.update_count(), 60);
    }

    #[test]
    fn test_weights_stay_bounded() {
        let mut engine = engine();
        let state = vec![1.0; FEATURE_DIM];
        for _ in 0..10_000 {
            engine.update(&experience(&state, "a", 100.0));
        }
        assert!(engine
            .weights
            .values()
            .flatten()
            .all(|w| w.abs() <= WEIGHT_LIMIT));
    }
}
