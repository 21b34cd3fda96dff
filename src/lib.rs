#![doc = include_str!("../README.md")]
#![warn(clippy::all)]

//! llama-orchestrator - a multi-agent task orchestration engine
//!
//! Work requests are described by capability tags. The engine decomposes
//! them, routes each piece to a specialized agent chosen by an online
//! learning policy, and isolates failing agents behind retries and circuit
//! breakers.
//!
//! ## Usage
//! ```rust,no_run
//! use llama_orchestrator::{Config, System};
//!
//! # async fn example() -> llama_orchestrator::Result<()> {
//! let system = System::new(Config::default())?;
//! system.start().await?;
//! let result = system.execute_task("Research async runtimes", &[], 1).await;
//! println!("{} -> {}", result.agent_id, result.data);
//! system.stop().await?;
//! # Ok(())
//! # }
//! ```

/// Executable agents and the worker pool
pub mod agents;
/// Consensus over independent agent answers
pub mod collective;
/// Configuration loading, defaults and environment overrides
pub mod config;
/// Role assignment and task bidding across orchestrator instances
pub mod coordinator;
/// Mediated access to shared resources
pub mod environment;
/// Error handling types and utilities
pub mod error;
/// Retries and per-agent circuit breakers
pub mod executor;
/// Dispatch policies learned from observed outcomes
pub mod learning;
/// Logging configuration and utilities
pub mod logging;
/// Per-agent and shared semantic memory
pub mod memory;
/// Mailbox-based message bus
pub mod messaging;
/// Metrics collection and reporting
pub mod metrics;
/// Task decomposition, agent selection and aggregation
pub mod orchestrator;
/// Value objects exchanged between components
pub mod protocol;
/// Public entry point
pub mod system;

// Re-export common types
pub use agents::{Agent, AgentPool, Specialization, WorkerAgent};
pub use collective::{AggregationMethod, AgentContribution, CollectiveIntelligence, CollectiveKnowledge};
pub use config::Config;
pub use coordinator::{CoordinationNode, CoordinationStrategy, DistributedCoordinator, NodeRole, SessionState};
pub use environment::{AccessMode, EnvironmentEvent, SharedEnvironment};
pub use error::{FailureKind, OrchestratorError, Result};
pub use executor::{CircuitState, ResilientExecutor};
pub use learning::{EngineKind, LearningEngine, LearningRegistry};
pub use protocol::{
    AgentCapability, AgentState, AgentStatus, Experience, Message, MessageType, SystemMetrics, Task,
    TaskResult, TaskStatus,
};
pub use system::System;
