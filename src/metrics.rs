use crate::error::Result;
use crate::protocol::{AgentId, SystemMetrics, TaskResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Collects and tracks named counters, timers and gauges
#[derive(Default)]
pub struct Metrics {
    counters: Arc<RwLock<HashMap<String, u64>>>,
    timers: Arc<RwLock<HashMap<String, Duration>>>,
    gauges: Arc<RwLock<HashMap<String, f64>>>,
}

impl Metrics {
    /// Creates a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments a counter metric by 1
    pub async fn increment(&self, key: &str) {
        let mut counters = self.counters.write().await;
        let value = counters.entry(key.to_string()).or_insert(0);
        *value += 1;
        debug!("Incremented counter {}: {}", key, value);
    }

    /// Adds `duration` to an accumulating timer
    pub async fn record_time(&self, key: &str, duration: Duration) {
        let mut timers = self.timers.write().await;
        let total = timers.entry(key.to_string()).or_insert(Duration::ZERO);
        *total += duration;
        debug!("Recorded timer {}: {:?}", key, duration);
    }

    /// Adds `delta` to a gauge
    pub async fn add_gauge(&self, key: &str, delta: f64) {
        let mut gauges = self.gauges.write().await;
        *gauges.entry(key.to_string()).or_insert(0.0) += delta;
    }

    /// Gets the current value of a counter metric
    pub async fn get_counter(&self, key: &str) -> u64 {
        self.counters.read().await.get(key).copied().unwrap_or(0)
    }

    /// Gets the accumulated value of a timer metric
    pub async fn get_timer(&self, key: &str) -> Duration {
        self.timers.read().await.get(key).copied().unwrap_or_default()
    }

    /// Gets the current value of a gauge metric
    pub async fn get_gauge(&self, key: &str) -> f64 {
        self.gauges.read().await.get(key).copied().unwrap_or(0.0)
    }

    /// Logs every collected metric
    pub async fn report(&self) {
        info!("=== Metrics Report ===");

        let counters = self.counters.read().await;
        if !counters.is_empty() {
            info!("Counters:");
            for (k, v) in counters.iter() {
                info!("  {}: {}", k, v);
            }
        }

        let timers = self.timers.read().await;
        if !timers.is_empty() {
            info!("Timers:");
            for (k, v) in timers.iter() {
                info!("  {}: {:?}", k, v);
            }
        }

        let gauges = self.gauges.read().await;
        if !gauges.is_empty() {
            info!("Gauges:");
            for (k, v) in gauges.iter() {
                info!("  {}: {}", k, v);
            }
        }
    }
}

/// Per-agent invocation statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentPerformance {
    pub invocations: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_time_secs: f64,
    pub total_quality: f64,
    pub total_reward: f64,
}

impl AgentPerformance {
    pub fn success_rate(&self) -> f64 {
        if self.invocations == 0 {
            0.0
        } else {
            self.successes as f64 / self.invocations as f64
        }
    }

    pub fn average_quality(&self) -> f64 {
        if self.successes == 0 {
            0.0
        } else {
            self.total_quality / self.successes as f64
        }
    }
}

#[derive(Serialize)]
struct MetricsFile<'a> {
    system: &'a SystemMetrics,
    agents: &'a HashMap<AgentId, AgentPerformance>,
}

const TASKS_TOTAL: &str = "tasks_total";
const TASKS_COMPLETED: &str = "tasks_completed";
const TASKS_FAILED: &str = "tasks_failed";
const TASK_TIME: &str = "task_time";
const CUMULATIVE_REWARD: &str = "cumulative_reward";
const SHORT_CIRCUITS: &str = "circuit_short_circuits";

/// Task-level and agent-level bookkeeping behind `SystemMetrics`
#[derive(Default)]
pub struct MetricsTracker {
    metrics: Metrics,
    agents: RwLock<HashMap<AgentId, AgentPerformance>>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Underlying registry
    pub fn registry(&self) -> &Metrics {
        &self.metrics
    }

    /// Counts a submitted root task
    pub async fn record_submitted(&self) {
        self.metrics.increment(TASKS_TOTAL).await;
    }

    /// Counts a root task's terminal result
    pub async fn record_task(&self, result: &TaskResult) {
        let key = if result.success { TASKS_COMPLETED } else { TASKS_FAILED };
        self.metrics.increment(key).await;
        self.metrics.record_time(TASK_TIME, result.execution_time).await;
    }

    /// Records one agent invocation; `reward` is `None` when the agent was
    /// never reached
    pub async fn record_invocation(&self, agent_id: &str, result: &TaskResult, reward: Option<f64>) {
        let Some(reward) = reward else {
            self.metrics.increment(SHORT_CIRCUITS).await;
            return;
        };
        self.metrics.add_gauge(CUMULATIVE_REWARD, reward).await;

        let mut agents = self.agents.write().await;
        let perf = agents.entry(agent_id.to_string()).or_default();
        perf.invocations += 1;
        if result.success {
            perf.successes += 1;
            perf.total_quality += result.quality_score;
        } else {
            perf.failures += 1;
        }
        perf.total_time_secs += result.execution_time.as_secs_f64();
        perf.total_reward += reward;
    }

    pub async fn agent_performance(&self) -> HashMap<AgentId, AgentPerformance> {
        self.agents.read().await.clone()
    }

    /// Invocations the breaker refused
    pub async fn short_circuits(&self) -> u64 {
        self.metrics.get_counter(SHORT_CIRCUITS).await
    }

    /// Builds the system-wide snapshot
    pub async fn snapshot(&self, active_agents: usize) -> SystemMetrics {
        let completed = self.metrics.get_counter(TASKS_COMPLETED).await;
        let failed = self.metrics.get_counter(TASKS_FAILED).await;
        let finished = completed + failed;
        let task_time = self.metrics.get_timer(TASK_TIME).await;
        SystemMetrics {
            total_tasks: self.metrics.get_counter(TASKS_TOTAL).await,
            completed_tasks: completed,
            failed_tasks: failed,
            active_agents,
            average_task_time: if finished == 0 {
                0.0
            } else {
                task_time.as_secs_f64() / finished as f64
            },
            success_rate: if finished == 0 {
                0.0
            } else {
                completed as f64 / finished as f64
            },
            cumulative_reward: self.metrics.get_gauge(CUMULATIVE_REWARD).await,
            timestamp: Utc::now(),
        }
    }

    /// Writes the snapshot and per-agent statistics as JSON
    pub async fn persist(&self, path: &Path, active_agents: usize) -> Result<()> {
        let system = self.snapshot(active_agents).await;
        let agents = self.agent_performance().await;
        let json = serde_json::to_string_pretty(&MetricsFile {
            system: &system,
            agents: &agents,
        })?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, json).await?;
        info!(path = %path.display(), "persisted metrics");
        Ok(())
    }
}
