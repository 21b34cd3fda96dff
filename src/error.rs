use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Custom result type alias for the orchestration engine
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors that can occur while scheduling and executing tasks
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// An agent raised an error or reported `success = false`
    #[error("Agent {agent_id} failed: {message}")]
    AgentExecution {
        /// Agent that failed
        agent_id: String,
        /// Failure description
        message: String,
    },

    /// The circuit breaker for this agent is open
    #[error("Circuit open for agent {0}")]
    CircuitOpen(String),

    /// A deadline or per-call timeout was exceeded
    #[error("Timeout: {0}")]
    Timeout(String),

    /// No eligible agent exists for a required capability
    #[error("Decomposition error: {0}")]
    Decomposition(String),

    /// A coordination session could not elect roles or lost quorum
    #[error("Coordination error: {0}")]
    Coordination(String),

    /// An id is already in use by work that has not finished
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Contributions could not be folded into a consensus
    #[error("Aggregation error: {0}")]
    Aggregation(String),

    /// Illegal task status transition
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        /// Task whose status was being changed
        task_id: String,
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Agent id not registered
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// Agent id already registered
    #[error("Agent already registered: {0}")]
    DuplicateAgent(String),

    /// Shared environment resource not registered
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Lease does not grant the requested operation
    #[error("Access denied on resource {0}")]
    AccessDenied(String),

    /// Policy artifact could not be saved or restored
    #[error("Policy error: {0}")]
    Policy(String),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// The system has not been started or is shutting down
    #[error("System is not running")]
    NotRunning,

    /// I/O errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON parsing/serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// General message errors
    #[error("{0}")]
    Message(String),
}

/// Failure classes surfaced in result metadata and used for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Agent raised or returned an unsuccessful result
    AgentExecution,
    /// Breaker open, call short-circuited
    CircuitOpen,
    /// Deadline or per-call timeout exceeded
    Timeout,
    /// No eligible agent for a required capability
    Decomposition,
    /// Distributed session failure
    Coordination,
}

impl FailureKind {
    /// Stable string form used in result metadata
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentExecution => "agent_execution",
            Self::CircuitOpen => "circuit_open",
            Self::Timeout => "timeout",
            Self::Decomposition => "decomposition",
            Self::Coordination => "coordination",
        }
    }

    /// Whether the executor may retry a call that failed this way
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AgentExecution | Self::Timeout)
    }

    /// Whether this failure counts against the agent's circuit breaker
    pub fn counts_against_breaker(&self) -> bool {
        matches!(self, Self::AgentExecution | Self::Timeout)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl OrchestratorError {
    /// Creates a new error with the specified message
    pub fn new(message: &str) -> Self {
        Self::Message(message.to_string())
    }

    /// Shorthand for an agent execution failure
    pub fn agent(agent_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AgentExecution {
            agent_id: agent_id.into(),
            message: message.into(),
        }
    }

    /// Maps this error onto the failure taxonomy, if it belongs to it
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::AgentExecution { .. } => Some(FailureKind::AgentExecution),
            Self::CircuitOpen(_) => Some(FailureKind::CircuitOpen),
            Self::Timeout(_) => Some(FailureKind::Timeout),
            Self::Decomposition(_) | Self::AgentNotFound(_) => Some(FailureKind::Decomposition),
            Self::Coordination(_) | Self::Conflict(_) => Some(FailureKind::Coordination),
            _ => None,
        }
    }

    /// Checks if this error is transient and retryable
    pub fn is_retryable(&self) -> bool {
        self.failure_kind().map_or(false, |kind| kind.is_retryable())
    }

    /// Checks if this error is fatal for the unit of work it occurred in
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = OrchestratorError::new("test error");
        assert!(matches!(error, OrchestratorError::Message(_)));

        if let OrchestratorError::Message(msg) = error {
            assert_eq!(msg, "test error");
        }
    }

    #[test]
    fn test_is_retryable() {
        let transient = OrchestratorError::agent("code-agent", "boom");
        let timeout = OrchestratorError::Timeout("call exceeded 50ms".into());
        let open = OrchestratorError::CircuitOpen("code-agent".into());
        let fatal = OrchestratorError::Decomposition("no agent for 'quantum'".into());

        assert!(transient.is_retryable());
        assert!(timeout.is_retryable());
        assert!(!open.is_retryable());
        assert!(fatal.is_fatal());
    }

    #[test]
    fn test_failure_kind_mapping() {
        assert_eq!(
            OrchestratorError::Coordination("quorum lost".into()).failure_kind(),
            Some(FailureKind::Coordination)
        );
        assert_eq!(OrchestratorError::NotRunning.failure_kind(), None);
        assert_eq!(FailureKind::CircuitOpen.to_string(), "circuit_open");
        assert!(!FailureKind::CircuitOpen.counts_against_breaker());
    }
}
