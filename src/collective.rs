//! Consensus over independent agent answers

use crate::error::{OrchestratorError, Result};
use crate::protocol::{AgentId, TaskId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// One agent's answer to a shared question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentContribution {
    pub agent_id: AgentId,
    pub answer: Value,
    /// Confidence in [0, 1]
    pub confidence: f64,
}

impl AgentContribution {
    pub fn new(agent_id: impl Into<AgentId>, answer: Value, confidence: f64) -> Self {
        Self {
            agent_id: agent_id.into(),
            answer,
            confidence: if confidence.is_finite() {
                confidence.clamp(0.0, 1.0)
            } else {
                0.0
            },
        }
    }
}

/// How contributions are folded together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    /// Most frequent answer; ties go to the larger confidence sum
    MajorityVote,
    /// Confidence-weighted mean of numeric answers
    WeightedAverage,
    /// Answer of the most confident contributor
    HighestConfidence,
}

/// Consensus result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectiveKnowledge {
    pub task_id: TaskId,
    pub answer: Value,
    pub confidence: f64,
    pub method: AggregationMethod,
    /// Share of contributors whose answer matches the consensus
    pub agreement: f64,
    pub contributions: Vec<AgentContribution>,
    /// Agents whose answer differs from the consensus
    pub dissenters: Vec<AgentId>,
    pub created_at: DateTime<Utc>,
}

/// Aggregator with a method per task type
pub struct CollectiveIntelligence {
    methods: RwLock<HashMap<String, AggregationMethod>>,
    default_method: AggregationMethod,
}

impl Default for CollectiveIntelligence {
    fn default() -> Self {
        Self::new(AggregationMethod::MajorityVote)
    }
}

impl CollectiveIntelligence {
    /// Creates an aggregator pre-configured for the numeric worker outputs
    pub fn new(default_method: AggregationMethod) -> Self {
        let methods = [
            ("data_analysis", AggregationMethod::WeightedAverage),
            ("statistics", AggregationMethod::WeightedAverage),
            ("forecasting", AggregationMethod::WeightedAverage),
            ("research", AggregationMethod::HighestConfidence),
        ]
        .into_iter()
        .map(|(task_type, method)| (task_type.to_string(), method))
        .collect();
        Self {
            methods: RwLock::new(methods),
            default_method,
        }
    }

    /// Routes `task_type` to `method`
    pub fn set_method(&self, task_type: impl Into<String>, method: AggregationMethod) {
        self.methods.write().insert(task_type.into(), method);
    }

    pub fn method_for(&self, task_type: &str) -> AggregationMethod {
        self.methods
            .read()
            .get(task_type)
            .copied()
            .unwrap_or(self.default_method)
    }

    /// Folds contributions with the method configured for `task_type`
    pub fn aggregate(
        &self,
        task_id: &str,
        task_type: &str,
        contributions: Vec<AgentContribution>,
    ) -> Result<CollectiveKnowledge> {
        if contributions.is_empty() {
            return Err(OrchestratorError::Aggregation(format!(
                "no contributions for task {}",
                task_id
            )));
        }
        let method = self.method_for(task_type);
        let (answer, confidence) = match method {
            AggregationMethod::MajorityVote => majority_vote(&contributions),
            AggregationMethod::WeightedAverage => weighted_average(&contributions)?,
            AggregationMethod::HighestConfidence => highest_confidence(&contributions),
        };

        let dissenters: Vec<AgentId> = contributions
            .iter()
            .filter(|c| !same_answer(&c.answer, &answer))
            .map(|c| c.agent_id.clone())
            .collect();
        let agreement = 1.0 - dissenters.len() as f64 / contributions.len() as f64;
        debug!(task = task_id, ?method, agreement, "aggregated contributions");

        Ok(CollectiveKnowledge {
            task_id: task_id.to_string(),
            answer,
            confidence,
            method,
            agreement,
            contributions,
            dissenters,
            created_at: Utc::now(),
        })
    }
}

fn same_answer(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x - y).abs() < 1e-9,
        _ => a == b,
    }
}

fn majority_vote(contributions: &[AgentContribution]) -> (Value, f64) {
    // (answer, votes, confidence sum), first-seen order
    let mut tally: Vec<(&Value, usize, f64)> = Vec::new();
    for contribution in contributions {
        match tally.iter_mut().find(|(answer, _, _)| same_answer(answer, &contribution.answer)) {
            Some(entry) => {
                entry.1 += 1;
                entry.2 += contribution.confidence;
            }
            None => tally.push((&contribution.answer, 1, contribution.confidence)),
        }
    }
    let mut winner = tally[0];
    for entry in tally.iter().skip(1) {
        if entry.1 > winner.1 || (entry.1 == winner.1 && entry.2 > winner.2) {
            winner = *entry;
        }
    }
    let (answer, votes, confidence_sum) = winner;
    (answer.clone(), confidence_sum / votes as f64)
}

fn weighted_average(contributions: &[AgentContribution]) -> Result<(Value, f64)> {
    let mut weighted = 0.0;
    let mut weights = 0.0;
    for contribution in contributions {
        let value = contribution.answer.as_f64().ok_or_else(|| {
            OrchestratorError::Aggregation(format!(
                "weighted average needs numeric answers, {} answered {}",
                contribution.agent_id, contribution.answer
            ))
        })?;
        weighted += value * contribution.confidence;
        weights += contribution.confidence;
    }
    let mean_confidence = weights / contributions.len() as f64;
    let answer = if weights > 0.0 {
        weighted / weights
    } else {
        contributions.iter().filter_map(|c| c.answer.as_f64()).sum::<f64>() / contributions.len() as f64
    };
    Ok((serde_json::json!(answer), mean_confidence))
}

fn highest_confidence(contributions: &[AgentContribution]) -> (Value, f64) {
    let mut best = &contributions[0];
    for contribution in &contributions[1..] {
        if contribution.confidence > best.confidence {
            best = contribution;
        }
    }
    (best.answer.clone(), best.confidence)
}
