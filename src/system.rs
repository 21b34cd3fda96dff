//! Public entry point composing every component of the engine
//!
//! A [`System`] is a cheap-to-clone handle; tests and embedders build as many
//! independent instances as they like.

use crate::agents::{Agent, AgentPool, WorkerAgent};
use crate::collective::CollectiveIntelligence;
use crate::config::Config;
use crate::coordinator::{CoordinationNode, DistributedCoordinator};
use crate::environment::SharedEnvironment;
use crate::error::{FailureKind, OrchestratorError, Result};
use crate::executor::ResilientExecutor;
use crate::learning::{LearningRegistry, LearningStatistics};
use crate::memory::MemoryManager;
use crate::messaging::MessageBus;
use crate::metrics::MetricsTracker;
use crate::orchestrator::{Orchestrator, OrchestratorParts};
use crate::protocol::{AgentId, AgentState, SystemMetrics, Task, TaskId, TaskResult, TaskStatus};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

const METRICS_FILE: &str = "metrics.json";
const MEMORY_FILE: &str = "memory.json";
const POLICY_DIR: &str = "policies";

/// Multi-agent orchestration engine
#[derive(Clone)]
pub struct System {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    memory: Arc<MemoryManager>,
    pool: Arc<AgentPool>,
    executor: Arc<ResilientExecutor>,
    learning: Arc<LearningRegistry>,
    metrics: Arc<MetricsTracker>,
    bus: Arc<MessageBus>,
    collective: Arc<CollectiveIntelligence>,
    environment: Arc<SharedEnvironment>,
    coordinator: Arc<DistributedCoordinator>,
    orchestrator: Orchestrator,
    /// Tasks currently running
    tasks: DashMap<TaskId, Task>,
    /// Finished tasks and their subtasks
    history: Mutex<LruCache<TaskId, Task>>,
    running: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
    shutdown: Mutex<CancellationToken>,
}

/// Decrements the in-flight count when a submission finishes
struct InFlight<'a>(&'a Inner);

impl<'a> InFlight<'a> {
    fn enter(inner: &'a Inner) -> Self {
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

impl System {
    /// Builds a stopped system from `config`
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let memory = Arc::new(MemoryManager::new(&config.memory));
        let pool = Arc::new(AgentPool::new(config.pool.performance_smoothing));
        let executor = Arc::new(ResilientExecutor::new(
            config.executor.retry_policy(),
            config.executor.breaker_config(),
            config.executor.call_timeout(),
        ));
        let learning = Arc::new(LearningRegistry::new(&config.learning));
        let metrics = Arc::new(MetricsTracker::new());
        let bus = Arc::new(MessageBus::new(&config.messaging));
        let collective = Arc::new(CollectiveIntelligence::default());
        let orchestrator = Orchestrator::new(
            config.orchestrator.clone(),
            config.learning.reward.clone(),
            OrchestratorParts {
                pool: Arc::clone(&pool),
                executor: Arc::clone(&executor),
                learning: Arc::clone(&learning),
                collective: Arc::clone(&collective),
                metrics: Arc::clone(&metrics),
                bus: Arc::clone(&bus),
            },
        );
        let coordinator = Arc::new(DistributedCoordinator::new(&config.coordination));
        let history = NonZeroUsize::new(config.task_history).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                memory,
                pool,
                executor,
                learning,
                metrics,
                bus,
                collective,
                environment: Arc::new(SharedEnvironment::new()),
                coordinator,
                orchestrator,
                tasks: DashMap::new(),
                history: Mutex::new(LruCache::new(history)),
                running: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
                shutdown: Mutex::new(CancellationToken::new()),
            }),
        })
    }

    /// Populates the default pool and restores persisted state
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        inner.config.ensure_directories_exist().await?;
        let created = inner
            .pool
            .populate_defaults(&inner.config.pool.default_agents, &inner.memory)?;
        for id in &created {
            inner.bus.register(id);
        }

        if let Some(dir) = &inner.config.data_dir {
            if inner.memory.load(&dir.join(MEMORY_FILE)).await? {
                info!("restored semantic memory");
            }
            inner.learning.load_all(&dir.join(POLICY_DIR)).await?;
        }

        *inner.shutdown.lock() = CancellationToken::new();
        inner.running.store(true, Ordering::SeqCst);
        info!(agents = inner.pool.len(), mode = %inner.learning.active_kind(), "system started");
        Ok(())
    }

    /// Stops accepting work, drains in-flight tasks and persists state
    ///
    /// Tasks still running after the drain timeout are cancelled and finish
    /// with a failed result.
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let drained = async {
            loop {
                let notified = inner.drained.notified();
                if inner.in_flight.load(Ordering::SeqCst) == 0 {
                    break;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(inner.config.drain_timeout(), drained).await.is_err() {
            warn!(
                in_flight = inner.in_flight.load(Ordering::SeqCst),
                "drain timeout elapsed, cancelling remaining tasks"
            );
            inner.shutdown.lock().cancel();
        }

        if let Some(dir) = &inner.config.data_dir {
            inner
                .metrics
                .persist(&dir.join(METRICS_FILE), inner.pool.len())
                .await?;
            inner.memory.save(&dir.join(MEMORY_FILE)).await?;
            inner.learning.save_all(&dir.join(POLICY_DIR)).await?;
        }
        inner.metrics.registry().report().await;
        info!("system stopped");
        Ok(())
    }

    /// Whether `start` ran and `stop` has not
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Runs a task described by free text and capability tags
    pub async fn execute_task(
        &self,
        description: &str,
        requirements: &[String],
        priority: i32,
    ) -> TaskResult {
        let task = Task::new(description)
            .with_requirements(requirements.iter().cloned())
            .with_priority(priority);
        self.submit(task).await
    }

    /// Runs a fully built task; always yields exactly one result for it
    #[instrument(skip(self, task), fields(task = %task.id))]
    pub async fn submit(&self, mut task: Task) -> TaskResult {
        let inner = &self.inner;
        inner.metrics.record_submitted().await;

        if !self.is_running() {
            let result = TaskResult::failure(
                task.id.clone(),
                inner.config.orchestrator.orchestrator_id.clone(),
                OrchestratorError::NotRunning.to_string(),
            );
            let _ = task.transition(TaskStatus::Cancelled);
            return self.finish(task, Vec::new(), result).await;
        }

        if task.is_expired(Utc::now()) {
            let result = TaskResult::failure(
                task.id.clone(),
                inner.config.orchestrator.orchestrator_id.clone(),
                OrchestratorError::Timeout("deadline passed before dispatch".into()).to_string(),
            )
            .with_metadata("failure_kind", json!(FailureKind::Timeout.as_str()))
            .with_metadata("cancelled", json!(true));
            let _ = task.transition(TaskStatus::Cancelled);
            return self.finish(task, Vec::new(), result).await;
        }

        let _guard = InFlight::enter(inner);
        let shutdown = inner.shutdown.lock().clone();
        let _ = task.transition(TaskStatus::InProgress);
        inner.tasks.insert(task.id.clone(), task.clone());

        tokio::select! {
            outcome = inner.orchestrator.run(&task) => {
                let status = if outcome.result.success {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Failed
                };
                let _ = task.transition(status);
                task.assigned_agent = Some(outcome.result.agent_id.clone());
                self.finish(task, outcome.subtasks, outcome.result).await
            }
            _ = shutdown.cancelled() => {
                let result = TaskResult::failure(
                    task.id.clone(),
                    inner.config.orchestrator.orchestrator_id.clone(),
                    "cancelled during shutdown",
                );
                let _ = task.transition(TaskStatus::Cancelled);
                self.finish(task, Vec::new(), result).await
            }
        }
    }

    async fn finish(&self, mut task: Task, subtasks: Vec<Task>, mut result: TaskResult) -> TaskResult {
        result.task_id = task.id.clone();
        let result = result.normalized();
        task.subtasks = subtasks.iter().map(|s| s.id.clone()).collect();
        self.inner.tasks.remove(&task.id);
        {
            let mut history = self.inner.history.lock();
            for subtask in subtasks {
                history.put(subtask.id.clone(), subtask);
            }
            history.put(task.id.clone(), task);
        }
        self.inner.metrics.record_task(&result).await;
        result
    }

    /// Registers a general worker advertising `capabilities`
    pub fn add_agent(&self, id: &str, capabilities: &[String]) -> Result<AgentId> {
        let memory = Arc::clone(&self.inner.memory);
        let agent = WorkerAgent::with_capabilities(id, capabilities).with_memory(memory);
        self.add_custom_agent(Arc::new(agent))
    }

    /// Registers any `Agent` implementation
    pub fn add_custom_agent(&self, agent: Arc<dyn Agent>) -> Result<AgentId> {
        let id = self.inner.pool.register(agent)?;
        self.inner.bus.register(&id);
        Ok(id)
    }

    /// Unregisters an agent together with its breaker and mailbox
    pub fn remove_agent(&self, id: &str) -> Result<()> {
        self.inner
            .pool
            .remove(id)
            .ok_or_else(|| OrchestratorError::AgentNotFound(id.to_string()))?;
        self.inner.executor.forget(id);
        self.inner.bus.unregister(id);
        self.inner.memory.clear_agent(id);
        Ok(())
    }

    /// System-wide counters
    pub async fn get_metrics(&self) -> SystemMetrics {
        self.inner.metrics.snapshot(self.inner.pool.len()).await
    }

    /// Every agent's state
    pub fn get_agent_states(&self) -> HashMap<AgentId, AgentState> {
        self.inner.pool.states()
    }

    /// A running or recently finished task, including subtasks
    pub fn get_task(&self, id: &str) -> Option<Task> {
        if let Some(task) = self.inner.tasks.get(id) {
            return Some(task.value().clone());
        }
        self.inner.history.lock().get(id).cloned()
    }

    /// Running tasks plus retained finished ones
    pub fn tracked_tasks(&self) -> usize {
        self.inner.tasks.len() + self.inner.history.lock().len()
    }

    /// Writes every learning engine's artifact into `dir`
    pub async fn save_policies(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        self.inner.learning.save_all(dir).await
    }

    /// Restores learning engines from `dir`
    pub async fn load_policies(&self, dir: &Path) -> Result<usize> {
        self.inner.learning.load_all(dir).await
    }

    /// Statistics of every learning engine
    pub fn learning_statistics(&self) -> Vec<LearningStatistics> {
        self.inner.learning.all_statistics()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.inner.memory
    }

    pub fn environment(&self) -> &Arc<SharedEnvironment> {
        &self.inner.environment
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.inner.bus
    }

    /// Coordinator configured from the `coordination` section
    pub fn coordinator(&self) -> &Arc<DistributedCoordinator> {
        &self.inner.coordinator
    }

    pub fn collective(&self) -> &Arc<CollectiveIntelligence> {
        &self.inner.collective
    }

    pub fn learning(&self) -> &Arc<LearningRegistry> {
        &self.inner.learning
    }

    pub fn executor(&self) -> &Arc<ResilientExecutor> {
        &self.inner.executor
    }

    pub fn metrics(&self) -> &Arc<MetricsTracker> {
        &self.inner.metrics
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.inner.orchestrator
    }

    /// Exposes this system as a member of a coordination session
    pub fn as_node(&self, node_id: impl Into<String>) -> Arc<dyn CoordinationNode> {
        Arc::new(SystemNode {
            node_id: node_id.into(),
            system: self.clone(),
        })
    }
}

struct SystemNode {
    node_id: String,
    system: System,
}

#[async_trait]
impl CoordinationNode for SystemNode {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn capabilities(&self) -> Vec<String> {
        let mut capabilities: Vec<String> = self
            .system
            .get_agent_states()
            .into_values()
            .flat_map(|state| state.capabilities)
            .collect();
        capabilities.sort();
        capabilities.dedup();
        capabilities
    }

    fn capacity(&self) -> usize {
        self.system.config().orchestrator.max_concurrent_agents
    }

    async fn execute(&self, task: Task) -> TaskResult {
        self.system.submit(task).await
    }
}
