use super::Config;
use crate::error::{OrchestratorError, Result};
use crate::learning::EngineKind;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

/// Prefix shared by every recognised environment variable
pub const ENV_PREFIX: &str = "LLAMA_ORCH_";

/// Configuration overrides collected from the environment
///
/// Kept separate from `std::env` so tests can build one from plain pairs.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    vars: HashMap<String, String>,
}

impl EnvOverrides {
    /// Collects every `LLAMA_ORCH_*` variable from the process environment
    pub fn from_env() -> Self {
        Self {
            vars: env::vars()
                .filter_map(|(k, v)| k.strip_prefix(ENV_PREFIX).map(|k| (k.to_string(), v)))
                .collect(),
        }
    }

    /// Builds overrides from `(suffix, value)` pairs, e.g. `("LOG_LEVEL", "debug")`
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Writes the overrides into `config`
    pub fn apply(&self, config: &mut Config) -> Result<()> {
        if let Some(level) = self.get("LOG_LEVEL") {
            config.log_level = level.to_string();
        }
        if let Some(dir) = self.get("DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(limit) = self.get("MAX_CONCURRENT_AGENTS") {
            config.orchestrator.max_concurrent_agents = limit.parse().map_err(|e| {
                OrchestratorError::Config(format!("Invalid MAX_CONCURRENT_AGENTS '{}': {}", limit, e))
            })?;
        }
        if let Some(timeout) = self.get("CALL_TIMEOUT_MS") {
            config.executor.call_timeout_ms = timeout.parse().map_err(|e| {
                OrchestratorError::Config(format!("Invalid CALL_TIMEOUT_MS '{}': {}", timeout, e))
            })?;
        }
        if let Some(mode) = self.get("LEARNING_MODE") {
            config.learning.mode = mode.parse::<EngineKind>()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply() -> Result<()> {
        let overrides = EnvOverrides::from_pairs([
            ("LOG_LEVEL", "trace"),
            ("MAX_CONCURRENT_AGENTS", "7"),
            ("LEARNING_MODE", "policy_gradient"),
            ("DATA_DIR", "/tmp/orchestrator"),
            ("CALL_TIMEOUT_MS", " "),
        ]);
        let config = Config::default().apply_env_overrides(&overrides)?;

        assert_eq!(config.log_level, "trace");
        assert_eq!(config.orchestrator.max_concurrent_agents, 7);
        assert_eq!(config.learning.mode, EngineKind::PolicyGradient);
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/orchestrator")));
        assert_eq!(config.executor.call_timeout_ms, 30_000);
        Ok(())
    }

    #[test]
    fn test_bad_numbers_are_config_errors() {
        let overrides = EnvOverrides::from_pairs([("MAX_CONCURRENT_AGENTS", "many")]);
        let err = Config::default().apply_env_overrides(&overrides).unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
    }
}
