//! Dispatch-policy learning
//!
//! Two interchangeable engines sit behind [`LearningEngine`]. The
//! [`LearningRegistry`] owns one instance of each, routes selections to the
//! active one, and feeds every experience to both so switching modes never
//! starts from scratch.

pub mod features;
mod policy_gradient;
mod q_learning;
pub mod reward;

pub use features::{state_key, task_features, FEATURE_DIM};
pub use policy_gradient::PolicyGradientEngine;
pub use q_learning::QLearningEngine;
pub use reward::RewardConfig;

use crate::config::LearningConfig;
use crate::error::{OrchestratorError, Result};
use crate::protocol::{AgentId, Experience};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

/// Artifact format version written by `save`
pub const ARTIFACT_VERSION: u32 = 1;

/// Which engine variant drives dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    QLearning,
    PolicyGradient,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QLearning => "q_learning",
            Self::PolicyGradient => "policy_gradient",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "q_learning" | "qlearning" => Ok(Self::QLearning),
            "policy_gradient" | "policygradient" => Ok(Self::PolicyGradient),
            other => Err(OrchestratorError::Config(format!(
                "Unknown learning mode '{}', expected q_learning or policy_gradient",
                other
            ))),
        }
    }
}

/// Reproducible random draws
///
/// Every draw is derived from `(seed, draws)`, so persisting the pair is
/// enough to replay the exact sequence after a restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorationRng {
    seed: u64,
    draws: u64,
}

impl ExplorationRng {
    pub fn new(seed: u64) -> Self {
        Self { seed, draws: 0 }
    }

    fn next_rng(&mut self) -> StdRng {
        let rng = StdRng::seed_from_u64(self.seed ^ self.draws.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        self.draws += 1;
        rng
    }

    /// Uniform in [0, 1)
    pub fn next_f64(&mut self) -> f64 {
        self.next_rng().gen::<f64>()
    }

    /// Uniform in [0, n); `n` must be positive
    pub fn next_index(&mut self, n: usize) -> usize {
        self.next_rng().gen_range(0..n.max(1))
    }
}

/// Observability snapshot of one engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningStatistics {
    pub engine_kind: EngineKind,
    /// Q-table entries or policy weights
    pub parameter_count: usize,
    pub exploration_rate: f64,
    pub average_reward: f64,
    pub update_count: u64,
}

/// Persisted engine state; `weights` is engine specific
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyArtifact {
    pub engine_id: String,
    pub kind: EngineKind,
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub weights: Value,
}

/// A dispatch policy
#[derive(Debug, Clone)]
pub enum LearningEngine {
    QLearning(QLearningEngine),
    PolicyGradient(PolicyGradientEngine),
}

impl LearningEngine {
    /// Builds an engine of `kind` from the learning settings
    pub fn new(kind: EngineKind, config: &LearningConfig, seed: u64) -> Self {
        match kind {
            EngineKind::QLearning => Self::QLearning(QLearningEngine::new(config, seed)),
            EngineKind::PolicyGradient => Self::PolicyGradient(PolicyGradientEngine::new(config, seed)),
        }
    }

    pub fn kind(&self) -> EngineKind {
        match self {
            Self::QLearning(_) => EngineKind::QLearning,
            Self::PolicyGradient(_) => EngineKind::PolicyGradient,
        }
    }

    /// Picks one of `eligible` for a task with features `state`
    pub fn select_agent(&mut self, state: &[f64], eligible: &[AgentId]) -> Option<AgentId> {
        match self {
            Self::QLearning(engine) => engine.select_agent(state, eligible),
            Self::PolicyGradient(engine) => engine.select_agent(state, eligible),
        }
    }

    /// Preference over `eligible`, best first
    pub fn rank_agents(&self, state: &[f64], eligible: &[AgentId]) -> Vec<(AgentId, f64)> {
        match self {
            Self::QLearning(engine) => engine.rank_agents(state, eligible),
            Self::PolicyGradient(engine) => engine.rank_agents(state, eligible),
        }
    }

    /// Ingests one observation
    pub fn update(&mut self, experience: &Experience) {
        match self {
            Self::QLearning(engine) => engine.update(experience),
            Self::PolicyGradient(engine) => engine.update(experience),
        }
    }

    pub fn statistics(&self) -> LearningStatistics {
        let (parameter_count, exploration_rate, average_reward, update_count) = match self {
            Self::QLearning(e) => (e.parameter_count(), e.exploration_rate(), e.average_reward(), e.update_count()),
            Self::PolicyGradient(e) => {
                (e.parameter_count(), e.exploration_rate(), e.average_reward(), e.update_count())
            }
        };
        LearningStatistics {
            engine_kind: self.kind(),
            parameter_count,
            exploration_rate,
            average_reward,
            update_count,
        }
    }

    /// Serializes the full engine state, random stream position included
    pub fn save(&self, engine_id: &str) -> Result<PolicyArtifact> {
        let weights = match self {
            Self::QLearning(engine) => serde_json::to_value(engine)?,
            Self::PolicyGradient(engine) => serde_json::to_value(engine)?,
        };
        Ok(PolicyArtifact {
            engine_id: engine_id.to_string(),
            kind: self.kind(),
            version: ARTIFACT_VERSION,
            saved_at: Utc::now(),
            weights,
        })
    }

    /// Rebuilds an engine from an artifact
    pub fn load(artifact: PolicyArtifact) -> Result<Self> {
        if artifact.version != ARTIFACT_VERSION {
            return Err(OrchestratorError::Policy(format!(
                "artifact '{}' has version {}, expected {}",
                artifact.engine_id, artifact.version, ARTIFACT_VERSION
            )));
        }
        let engine = match artifact.kind {
            EngineKind::QLearning => Self::QLearning(serde_json::from_value(artifact.weights)?),
            EngineKind::PolicyGradient => Self::PolicyGradient(serde_json::from_value(artifact.weights)?),
        };
        Ok(engine)
    }
}

/// One engine per kind, with one of them active
///
/// Each engine sits behind its own lock so updates are serialized per engine.
pub struct LearningRegistry {
    q_learning: Mutex<LearningEngine>,
    policy_gradient: Mutex<LearningEngine>,
    active: Mutex<EngineKind>,
}

impl LearningRegistry {
    pub fn new(config: &LearningConfig) -> Self {
        let seed = config.seed.unwrap_or_else(rand::random);
        Self {
            q_learning: Mutex::new(LearningEngine::new(EngineKind::QLearning, config, seed)),
            policy_gradient: Mutex::new(LearningEngine::new(
                EngineKind::PolicyGradient,
                config,
                seed.wrapping_add(1),
            )),
            active: Mutex::new(config.mode),
        }
    }

    fn engine(&self, kind: EngineKind) -> &Mutex<LearningEngine> {
        match kind {
            EngineKind::QLearning => &self.q_learning,
            EngineKind::PolicyGradient => &self.policy_gradient,
        }
    }

    pub fn active_kind(&self) -> EngineKind {
        *self.active.lock()
    }

    pub fn set_active(&self, kind: EngineKind) {
        *self.active.lock() = kind;
        info!(mode = %kind, "switched active learning engine");
    }

    /// Asks the active engine for an agent
    pub fn select_agent(&self, state: &[f64], eligible: &[AgentId]) -> Option<AgentId> {
        self.engine(self.active_kind()).lock().select_agent(state, eligible)
    }

    /// Active engine's preference, best first
    pub fn rank_agents(&self, state: &[f64], eligible: &[AgentId]) -> Vec<(AgentId, f64)> {
        self.engine(self.active_kind()).lock().rank_agents(state, eligible)
    }

    /// Feeds an experience to every engine
    pub fn observe(&self, experience: &Experience) {
        self.q_learning.lock().update(experience);
        self.policy_gradient.lock().update(experience);
        debug!(action = %experience.action, reward = experience.reward, "learning engines updated");
    }

    /// Statistics of the active engine
    pub fn statistics(&self) -> LearningStatistics {
        self.engine(self.active_kind()).lock().statistics()
    }

    /// Statistics of every engine
    pub fn all_statistics(&self) -> Vec<LearningStatistics> {
        [EngineKind::QLearning, EngineKind::PolicyGradient]
            .iter()
            .map(|kind| self.engine(*kind).lock().statistics())
            .collect()
    }

    /// Artifact path for an engine inside `dir`
    pub fn artifact_path(dir: &Path, kind: EngineKind) -> PathBuf {
        dir.join(format!("{}.policy.json", kind.as_str()))
    }

    /// Writes one artifact per engine into `dir`
    pub async fn save_all(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        tokio::fs::create_dir_all(dir).await?;
        let mut written = Vec::new();
        for kind in [EngineKind::QLearning, EngineKind::PolicyGradient] {
            let artifact = self.engine(kind).lock().save(kind.as_str())?;
            let path = Self::artifact_path(dir, kind);
            tokio::fs::write(&path, serde_json::to_string_pretty(&artifact)?).await?;
            written.push(path);
        }
        info!(dir = %dir.display(), "saved learning policies");
        Ok(written)
    }

    /// Restores every artifact present in `dir`; returns how many were loaded
    pub async fn load_all(&self, dir: &Path) -> Result<usize> {
        let mut loaded = 0;
        for kind in [EngineKind::QLearning, EngineKind::PolicyGradient] {
            let path = Self::artifact_path(dir, kind);
            if !path.exists() {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            let artifact: PolicyArtifact = serde_json::from_str(&content)?;
            if artifact.kind != kind {
                return Err(OrchestratorError::Policy(format!(
                    "{} holds a {} engine",
                    path.display(),
                    artifact.kind
                )));
            }
            *self.engine(kind).lock() = LearningEngine::load(artifact)?;
            loaded += 1;
        }
        if loaded > 0 {
            info!(dir = %dir.display(), loaded, "loaded learning policies");
        }
        Ok(loaded)
    }
}
