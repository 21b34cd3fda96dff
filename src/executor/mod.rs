//! Retry and circuit-breaker wrapper around every agent invocation
//!
//! The executor never returns `Err`: raised errors, panics, timeouts and
//! short circuits all come back as a `TaskResult` with `success = false`.

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use retry::RetryPolicy;

use crate::agents::Agent;
use crate::error::{FailureKind, OrchestratorError};
use crate::protocol::{AgentId, Task, TaskResult};
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, warn};

/// Outcome of one `execute` call
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// Final result; carries `attempts` and `failure_kind` metadata
    pub result: TaskResult,
    /// Times the agent was actually invoked
    pub attempts: u32,
    /// Classification of the final failure, if any
    pub failure: Option<FailureKind>,
}

impl ExecutionReport {
    /// Whether the agent ran at least once
    pub fn invoked(&self) -> bool {
        self.attempts > 0
    }
}

/// Runs agents under a retry policy and a breaker per agent id
pub struct ResilientExecutor {
    policy: RetryPolicy,
    breaker_config: BreakerConfig,
    call_timeout: Duration,
    breakers: DashMap<AgentId, Arc<Mutex<CircuitBreaker>>>,
}

impl ResilientExecutor {
    pub fn new(policy: RetryPolicy, breaker_config: BreakerConfig, call_timeout: Duration) -> Self {
        Self {
            policy,
            breaker_config,
            call_timeout,
            breakers: DashMap::new(),
        }
    }

    fn breaker(&self, agent_id: &str) -> Arc<Mutex<CircuitBreaker>> {
        self.breakers
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitBreaker::new(self.breaker_config.clone()))))
            .clone()
    }

    /// Breaker position for an agent; unknown agents are closed
    pub fn circuit_state(&self, agent_id: &str) -> CircuitState {
        self.breakers
            .get(agent_id)
            .map_or(CircuitState::Closed, |b| b.lock().state())
    }

    /// Drops breaker state for a removed agent
    pub fn forget(&self, agent_id: &str) {
        self.breakers.remove(agent_id);
    }

    /// Invokes `agent` on `task`, retrying per failure kind
    pub async fn execute(&self, agent: &Arc<dyn Agent>, task: &Task) -> ExecutionReport {
        let agent_id = agent.id().to_string();
        let breaker = self.breaker(&agent_id);
        let mut attempts = 0u32;
        let mut last: Option<(TaskResult, FailureKind)> = None;

        loop {
            if task.is_expired(Utc::now()) {
                let failure = TaskResult::failure(
                    task.id.clone(),
                    agent_id.clone(),
                    format!("Deadline passed before attempt {}", attempts + 1),
                );
                return self.report(failure, attempts, Some(FailureKind::Timeout));
            }

            let admitted = breaker.lock().try_acquire(Instant::now());
            if !admitted {
                debug!(agent = %agent_id, task = %task.id, "circuit open, short-circuiting");
                return match last {
                    Some((result, kind)) => {
                        let result = result.with_metadata("circuit_open", json!(true));
                        self.report(result, attempts, Some(kind))
                    }
                    None => {
                        let err = OrchestratorError::CircuitOpen(agent_id.clone());
                        let result = TaskResult::failure(task.id.clone(), agent_id.clone(), err.to_string());
                        self.report(result, 0, Some(FailureKind::CircuitOpen))
                    }
                };
            }

            attempts += 1;
            let started = Instant::now();
            let outcome = timeout(
                self.call_timeout,
                AssertUnwindSafe(agent.process_task(task)).catch_unwind(),
            )
            .await;
            let elapsed = started.elapsed();

            let (result, kind) = match outcome {
                Ok(Ok(Ok(result))) if result.success => {
                    breaker.lock().record_success();
                    let mut result = result.normalized();
                    result.task_id = task.id.clone();
                    if result.agent_id.is_empty() {
                        result.agent_id = agent_id.clone();
                    }
                    if result.execution_time.is_zero() {
                        result.execution_time = elapsed;
                    }
                    return self.report(result, attempts, None);
                }
                Ok(Ok(Ok(result))) => {
                    let mut result = result.normalized();
                    result.task_id = task.id.clone();
                    result.agent_id = agent_id.clone();
                    (result, FailureKind::AgentExecution)
                }
                Ok(Ok(Err(err))) => {
                    let kind = match err.failure_kind() {
                        Some(FailureKind::Timeout) => FailureKind::Timeout,
                        _ => FailureKind::AgentExecution,
                    };
                    (TaskResult::failure(task.id.clone(), agent_id.clone(), err.to_string()), kind)
                }
                Ok(Err(panic)) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "agent panicked".to_string());
                    let err = OrchestratorError::agent(agent_id.clone(), format!("panicked: {}", message));
                    (TaskResult::failure(task.id.clone(), agent_id.clone(), err.to_string()), FailureKind::AgentExecution)
                }
                Err(_) => {
                    let err = OrchestratorError::Timeout(format!(
                        "agent {} exceeded {}ms",
                        agent_id,
                        self.call_timeout.as_millis()
                    ));
                    (TaskResult::failure(task.id.clone(), agent_id.clone(), err.to_string()), FailureKind::Timeout)
                }
            };

            let result = result.with_execution_time(elapsed);
            let opened = breaker.lock().record_failure(Instant::now());
            if opened {
                warn!(agent = %agent_id, "circuit opened after repeated failures");
            }

            if attempts >= self.policy.max_attempts_for(kind) {
                debug!(agent = %agent_id, task = %task.id, attempts, %kind, "giving up");
                return self.report(result, attempts, Some(kind));
            }
            debug!(agent = %agent_id, task = %task.id, attempts, %kind, "retrying");
            sleep(self.policy.delay_for(attempts)).await;
            last = Some((result, kind));
        }
    }

    fn report(&self, result: TaskResult, attempts: u32, failure: Option<FailureKind>) -> ExecutionReport {
        let mut result = result.with_metadata("attempts", json!(attempts));
        if let Some(kind) = failure {
            result = result.with_metadata("failure_kind", json!(kind.as_str()));
        }
        ExecutionReport {
            result,
            attempts,
            failure,
        }
    }
}
