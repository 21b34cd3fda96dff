#![allow(dead_code)]

use async_trait::async_trait;
use llama_orchestrator::{
    Agent, AgentCapability, Config, OrchestratorError, Result, Specialization, Task, TaskResult,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub mod test_helpers {
    use super::*;

    /// Deterministic config with a small default pool and no retries
    pub fn create_test_config() -> Config {
        let mut config = Config::default();
        config.learning.seed = Some(11);
        config.pool.default_agents = vec![
            Specialization::Research,
            Specialization::Code,
            Specialization::General,
        ];
        config.executor.max_attempts = 1;
        config.executor.timeout_max_attempts = 1;
        config.executor.base_backoff_ms = 1;
        config.executor.call_timeout_ms = 5_000;
        config
    }

    pub fn setup_test_logger() {
        llama_orchestrator::logging::init_for_tests();
    }

    pub fn caps(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }
}

/// Agent that counts invocations and always fails
pub struct FailingAgent {
    id: String,
    capability: String,
    pub calls: AtomicUsize,
}

impl FailingAgent {
    pub fn new(id: &str, capability: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            capability: capability.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for FailingAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Vec<AgentCapability> {
        vec![AgentCapability::new(self.capability.clone(), "always fails", 0.9)]
    }

    async fn process_task(&self, _task: &Task) -> Result<TaskResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(OrchestratorError::agent(self.id.clone(), "backend unavailable"))
    }
}

/// Agent that records the order in which tasks finish
///
/// Tasks described as "blocker" wait for `release` before finishing.
pub struct RecordingAgent {
    id: String,
    capability: String,
    pub finished: Mutex<Vec<String>>,
    pub started: AtomicUsize,
    release: Notify,
}

impl RecordingAgent {
    pub fn new(id: &str, capability: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            capability: capability.to_string(),
            finished: Mutex::new(Vec::new()),
            started: AtomicUsize::new(0),
            release: Notify::new(),
        })
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().clone()
    }
}

#[async_trait]
impl Agent for RecordingAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Vec<AgentCapability> {
        vec![AgentCapability::new(self.capability.clone(), "records order", 0.9)]
    }

    async fn process_task(&self, task: &Task) -> Result<TaskResult> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if task.description == "blocker" {
            self.release.notified().await;
        } else {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.finished.lock().push(task.description.clone());
        Ok(TaskResult::success(task.id.clone(), self.id.clone(), json!({"done": task.description})))
    }
}
