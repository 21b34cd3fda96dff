mod env_manager;

use crate::agents::Specialization;
use crate::coordinator::CoordinationStrategy;
use crate::error::{OrchestratorError, Result};
use crate::executor::{BreakerConfig, RetryPolicy};
use crate::learning::{EngineKind, RewardConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use env_manager::{EnvOverrides, ENV_PREFIX};

/// Main configuration struct for the engine
///
/// Every section carries serde defaults, so a config file only needs the
/// keys it wants to change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level used when `RUST_LOG` is unset
    pub log_level: String,
    /// Directory for metrics, memory snapshots and policies; nothing is
    /// persisted when unset
    pub data_dir: Option<PathBuf>,
    /// How long `stop` waits for in-flight tasks
    pub drain_timeout_ms: u64,
    /// Finished tasks kept for `get_task`, least recently used evicted first
    pub task_history: usize,
    /// Decomposition and dispatch settings
    pub orchestrator: OrchestratorConfig,
    /// Retry, breaker and timeout settings
    pub executor: ExecutorConfig,
    /// Learning engine settings
    pub learning: LearningConfig,
    /// Semantic memory settings
    pub memory: MemoryConfig,
    /// Default worker pool
    pub pool: PoolConfig,
    /// Message bus settings
    pub messaging: MessagingConfig,
    /// Distributed coordination settings
    pub coordination: CoordinationConfig,
}

/// Decomposition and dispatch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Id the orchestrator signs aggregate results and messages with
    pub orchestrator_id: String,
    /// Maximum number of agent invocations in flight at once
    pub max_concurrent_agents: usize,
    /// Merge capability tags one agent can serve into a single subtask
    pub merge_shared_capabilities: bool,
    /// Infer capability tags from the description when none are given
    pub infer_capabilities: bool,
    /// Upper bound on agents consulted in diversity-seeking mode
    pub max_diversity: usize,
}

/// Retry, breaker and per-call timeout settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Attempts per call for execution failures
    pub max_attempts: u32,
    /// Attempts per call for timeouts
    pub timeout_max_attempts: u32,
    /// First backoff delay
    pub base_backoff_ms: u64,
    /// Backoff ceiling
    pub max_backoff_ms: u64,
    /// Backoff growth factor
    pub backoff_multiplier: f64,
    /// Per-invocation timeout
    pub call_timeout_ms: u64,
    /// Failures inside the window that open the breaker
    pub failure_threshold: u32,
    /// Sliding failure window
    pub failure_window_ms: u64,
    /// Open -> half-open cooldown
    pub cooldown_ms: u64,
}

/// Learning engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Engine used for dispatch decisions
    pub mode: EngineKind,
    /// Q-learning step size
    pub learning_rate: f64,
    /// Q-learning discount factor
    pub discount_factor: f64,
    /// Initial exploration rate for both engines
    pub exploration_rate: f64,
    /// Multiplicative decay applied per update
    pub exploration_decay: f64,
    /// Exploration floor
    pub min_exploration_rate: f64,
    /// Policy-gradient step size
    pub policy_learning_rate: f64,
    /// Softmax temperature for the policy-gradient engine
    pub temperature: f64,
    /// Seed for exploration draws; random when unset
    pub seed: Option<u64>,
    /// Reward shaping
    pub reward: RewardConfig,
}

/// Semantic memory settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Entries kept per agent partition
    pub capacity_per_agent: usize,
    /// Entries kept in the shared partition
    pub shared_capacity: usize,
    /// Minimum cosine similarity for a search hit
    pub min_similarity: f64,
}

/// Default worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Specializations instantiated by `start`
    pub default_agents: Vec<Specialization>,
    /// EMA factor for agent performance scores
    pub performance_smoothing: f64,
}

/// Message bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// TTL stamped on engine-generated messages
    pub default_ttl_secs: u64,
    /// Messages kept per mailbox before the oldest is evicted
    pub mailbox_capacity: usize,
    /// Replies kept for `find_response`, least recently used evicted first
    pub response_capacity: usize,
}

/// Distributed coordination settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Role assignment strategy for new sessions
    pub strategy: CoordinationStrategy,
    /// Minimum nodes for a session to elect
    pub quorum: usize,
    /// In-flight spread between busiest and idlest node that triggers rebalancing
    pub skew_threshold: usize,
}

impl Config {
    /// Loads configuration from the default config file location
    ///
    /// If the config file doesn't exist, returns the default configuration.
    /// Environment overrides are applied either way.
    pub fn load() -> Result<Self> {
        let config = match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        let config = config.apply_env_overrides(&EnvOverrides::from_env())?;
        config.validate()?;
        Ok(config)
    }

    /// `<config_dir>/llama-orchestrator/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("llama-orchestrator").join("config.toml"))
    }

    /// Reads a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies environment overrides on top of this config
    pub fn apply_env_overrides(mut self, overrides: &EnvOverrides) -> Result<Self> {
        overrides.apply(&mut self)?;
        Ok(self)
    }

    /// Rejects settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.max_concurrent_agents == 0 {
            return Err(OrchestratorError::Config(
                "max_concurrent_agents must be at least 1".into(),
            ));
        }
        if self.executor.max_attempts == 0 || self.executor.timeout_max_attempts == 0 {
            return Err(OrchestratorError::Config("retry attempts must be at least 1".into()));
        }
        if self.executor.failure_threshold == 0 {
            return Err(OrchestratorError::Config("failure_threshold must be at least 1".into()));
        }
        let learning = &self.learning;
        if !(learning.learning_rate > 0.0 && learning.learning_rate <= 1.0) {
            return Err(OrchestratorError::Config("learning_rate must be in (0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&learning.discount_factor) {
            return Err(OrchestratorError::Config("discount_factor must be in [0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&learning.exploration_rate)
            || !(0.0..=1.0).contains(&learning.min_exploration_rate)
        {
            return Err(OrchestratorError::Config("exploration rates must be in [0, 1]".into()));
        }
        if learning.temperature <= 0.0 {
            return Err(OrchestratorError::Config("temperature must be positive".into()));
        }
        if self.memory.capacity_per_agent == 0 || self.memory.shared_capacity == 0 {
            return Err(OrchestratorError::Config("memory capacities must be at least 1".into()));
        }
        if self.task_history == 0 {
            return Err(OrchestratorError::Config("task_history must be at least 1".into()));
        }
        if self.messaging.mailbox_capacity == 0 || self.messaging.response_capacity == 0 {
            return Err(OrchestratorError::Config("messaging capacities must be at least 1".into()));
        }
        Ok(())
    }

    /// Creates `data_dir` if one is configured
    pub async fn ensure_directories_exist(&self) -> Result<()> {
        if let Some(dir) = &self.data_dir {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }

    /// How long `stop` waits for in-flight tasks
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl ExecutorConfig {
    /// Retry strategy derived from these settings
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            timeout_max_attempts: self.timeout_max_attempts,
            base_delay: Duration::from_millis(self.base_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.backoff_multiplier,
        }
    }

    /// Breaker settings derived from these settings
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            window: Duration::from_millis(self.failure_window_ms),
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }

    /// Per-invocation timeout
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            data_dir: None,
            drain_timeout_ms: 30_000,
            task_history: 1024,
            orchestrator: OrchestratorConfig::default(),
            executor: ExecutorConfig::default(),
            learning: LearningConfig::default(),
            memory: MemoryConfig::default(),
            pool: PoolConfig::default(),
            messaging: MessagingConfig::default(),
            coordination: CoordinationConfig::default(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            orchestrator_id: "orchestrator".to_string(),
            max_concurrent_agents: 4,
            merge_shared_capabilities: true,
            infer_capabilities: true,
            max_diversity: 5,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout_max_attempts: 2,
            base_backoff_ms: 50,
            max_backoff_ms: 2_000,
            backoff_multiplier: 2.0,
            call_timeout_ms: 30_000,
            failure_threshold: 5,
            failure_window_ms: 60_000,
            cooldown_ms: 30_000,
        }
    }
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            mode: EngineKind::QLearning,
            learning_rate: 0.1,
            discount_factor: 0.9,
            exploration_rate: 0.2,
            exploration_decay: 0.995,
            min_exploration_rate: 0.01,
            policy_learning_rate: 0.05,
            temperature: 1.0,
            seed: None,
            reward: RewardConfig::default(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity_per_agent: 256,
            shared_capacity: 1024,
            min_similarity: 0.1,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_agents: vec![
                Specialization::Research,
                Specialization::Code,
                Specialization::Test,
                Specialization::DataAnalyst,
                Specialization::General,
            ],
            performance_smoothing: 0.2,
        }
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            mailbox_capacity: 256,
            response_capacity: 1024,
        }
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            strategy: CoordinationStrategy::CapabilityWeighted,
            quorum: 1,
            skew_threshold: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_config_validation() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config = Config {
            data_dir: Some(temp_dir.path().join("state")),
            ..Config::default()
        };

        assert!(config.validate().is_ok());
        config.ensure_directories_exist().await?;
        assert!(temp_dir.path().join("state").exists());
        Ok(())
    }

    #[test]
    fn test_partial_toml_keeps_defaults() -> Result<()> {
        let config = Config::from_toml_str(
            r#"
            log_level = "debug"

            [orchestrator]
            max_concurrent_agents = 1

            [learning]
            mode = "policy_gradient"
            "#,
        )?;
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.orchestrator.max_concurrent_agents, 1);
        assert!(config.orchestrator.merge_shared_capabilities);
        assert_eq!(config.learning.mode, EngineKind::PolicyGradient);
        assert_eq!(config.executor.failure_threshold, 5);
        Ok(())
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = Config::default();
        config.orchestrator.max_concurrent_agents = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.learning.discount_factor = 1.5;
        assert!(config.validate().is_err());

        assert!(Config::from_toml_str("[executor]\nfailure_threshold = 0").is_err());
    }

    #[test]
    fn test_executor_derivations() {
        let executor = ExecutorConfig::default();
        assert_eq!(executor.retry_policy().max_attempts, 3);
        assert_eq!(executor.breaker_config().failure_threshold, 5);
        assert_eq!(executor.call_timeout(), Duration::from_secs(30));
    }
}
