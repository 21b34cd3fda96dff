use super::features::state_key;
use super::ExplorationRng;
use crate::config::LearningConfig;
use crate::protocol::{AgentId, Experience};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tabular Q-learning with decaying epsilon-greedy exploration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QLearningEngine {
    table: HashMap<String, HashMap<AgentId, f64>>,
    learning_rate: f64,
    discount_factor: f64,
    exploration_rate: f64,
    exploration_decay: f64,
    min_exploration_rate: f64,
    rng: ExplorationRng,
    updates: u64,
    reward_sum: f64,
}

impl QLearningEngine {
    pub fn new(config: &LearningConfig, seed: u64) -> Self {
        Self {
            table: HashMap::new(),
            learning_rate: config.learning_rate,
            discount_factor: config.discount_factor,
            exploration_rate: config.exploration_rate,
            exploration_decay: config.exploration_decay,
            min_exploration_rate: config.min_exploration_rate,
            rng: ExplorationRng::new(seed),
            updates: 0,
            reward_sum: 0.0,
        }
    }

    fn q(&self, key: &str, agent: &str) -> f64 {
        self.table
            .get(key)
            .and_then(|row| row.get(agent))
            .copied()
            .unwrap_or(0.0)
    }

    /// Eligible agents by descending Q value; ties keep input order
    pub fn rank_agents(&self, state: &[f64], eligible: &[AgentId]) -> Vec<(AgentId, f64)> {
        let key = state_key(state);
        let mut ranked: Vec<(AgentId, f64)> = eligible
            .iter()
            .map(|agent| (agent.clone(), self.q(&key, agent)))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked
    }

    /// Epsilon-greedy choice; exploring picks one of the non-greedy agents
    pub fn select_agent(&mut self, state: &[f64], eligible: &[AgentId]) -> Option<AgentId> {
        let ranked = self.rank_agents(state, eligible);
        let (best, _) = ranked.first()?;
        if ranked.len() > 1 && self.rng.next_f64() < self.exploration_rate {
            let pick = 1 + self.rng.next_index(ranked.len() - 1);
            return Some(ranked[pick].0.clone());
        }
        Some(best.clone())
    }

    /// Q(s,a) += lr * (r + gamma * max Q(s',.) - Q(s,a)), then decays epsilon
    pub fn update(&mut self, experience: &Experience) {
        let key = state_key(&experience.state);
        let future = if experience.terminal {
            0.0
        } else {
            self.table
                .get(&state_key(&experience.next_state))
                .and_then(|row| row.values().copied().reduce(f64::max))
                .unwrap_or(0.0)
        };
        let current = self.q(&key, &experience.action);
        let target = experience.reward + self.discount_factor * future;
        let updated = current + self.learning_rate * (target - current);
        self.table
            .entry(key)
            .or_default()
            .insert(experience.action.clone(), updated);

        self.exploration_rate =
            (self.exploration_rate * self.exploration_decay).max(self.min_exploration_rate);
        self.updates += 1;
        self.reward_sum += experience.reward;
    }

    pub fn exploration_rate(&self) -> f64 {
        self.exploration_rate
    }

    /// Number of (state, action) entries
    pub fn parameter_count(&self) -> usize {
        self.table.values().map(HashMap::len).sum()
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

    fn greedy() -> QLearningEngine {
        let config = LearningConfig {
            exploration_rate: 0.0,
            min_exploration_rate: 0.0,
            learning_rate: 0.5,
            ..LearningConfig::default()
        };
        QLearningEngine::new(&config, 7)
    }

    #[test]
    fn test_learns_the_rewarded_agent() {
        let mut engine = greedy();
        let state = vec![0.2, 0.1, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let eligible = vec!["a".to_string(), "b".to_string()];

        assert_eq!(engine.select_agent(&state, &eligible).as_deref(), Some("a"));
        engine.update(&experience(&state, "a", -1.0));
        engine.update(&experience(&state, "b", 1.0));
        assert_eq!(engine.select_agent(&state, &eligible).as_deref(), Some("b"));

        assert_eq!(engine.parameter_count(), 2);
        assert_eq!(engine.update_count(), 2);
        assert!((engine.average_reward()).abs() < 1e-9);
    }

    #[test]
    fn test_exploration_decays_to_floor() {
        let config = LearningConfig {
            exploration_rate: 0.5,
            exploration_decay: 0.5,
            min_exploration_rate: 0.1,
            ..LearningConfig::default()
        };
        let mut engine = QLearningEngine::new(&config, 1);
        let state = vec![0.0; 11];
        for _ in 0..5 {
            engine.update(&experience(&state, "a", 1.0));
        }
        assert!((engine.exploration_rate() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_always_exploring_avoids_greedy_choice() {
        let config = LearningConfig {
            exploration_rate: 1.0,
            min_exploration_rate: 1.0,
            ..LearningConfig::default()
        };
        let mut engine = QLearningEngine::new(&config, 3);
        let state = vec![0.0; 11];
        engine.update(&experience(&state, "a", 5.0));
        let eligible = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        for _ in 0..20 {
            assert_ne!(engine.select_agent(&state, &eligible).as_deref(), Some("a"));
        }
        assert_eq!(engine.select_agent(&state, &eligible[..1]).as_deref(), Some("a"));
    }
}
