//! Task decomposition, agent selection and result aggregation
//!
//! A root task either runs atomically on one agent picked by the active
//! learning engine, or is split into capability groups that run in
//! dependency waves. Every agent invocation goes through the priority gate
//! and the resilient executor, and feeds its reward back into learning.

pub mod decompose;
mod gate;

pub use decompose::{infer_capabilities, plan, SubtaskPlan};
pub use gate::{GatePermit, PriorityGate};

use crate::agents::AgentPool;
use crate::collective::{AgentContribution, CollectiveIntelligence};
use crate::config::OrchestratorConfig;
use crate::error::{FailureKind, OrchestratorError};
use crate::executor::ResilientExecutor;
use crate::learning::{task_features, LearningRegistry, RewardConfig};
use crate::messaging::MessageBus;
use crate::metrics::MetricsTracker;
use crate::protocol::{AgentId, Experience, MessageType, Task, TaskResult, TaskStatus};
use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Result of orchestrating one root task
#[derive(Debug, Clone)]
pub struct Orchestration {
    /// Terminal result for the root task
    pub result: TaskResult,
    /// Subtasks created by decomposition, in their terminal state
    pub subtasks: Vec<Task>,
}

/// Shared handles the orchestrator works with
pub struct OrchestratorParts {
    pub pool: Arc<AgentPool>,
    pub executor: Arc<ResilientExecutor>,
    pub learning: Arc<LearningRegistry>,
    pub collective: Arc<CollectiveIntelligence>,
    pub metrics: Arc<MetricsTracker>,
    pub bus: Arc<MessageBus>,
}

/// Decomposes tasks, dispatches subtasks and folds their results
pub struct Orchestrator {
    config: OrchestratorConfig,
    reward: RewardConfig,
    parts: OrchestratorParts,
    gate: Arc<PriorityGate>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, reward: RewardConfig, parts: OrchestratorParts) -> Self {
        let gate = PriorityGate::new(config.max_concurrent_agents);
        parts.bus.register(&config.orchestrator_id);
        Self {
            config,
            reward,
            parts,
            gate,
        }
    }

    /// Concurrency limiter shared by every invocation
    pub fn gate(&self) -> &Arc<PriorityGate> {
        &self.gate
    }

    /// Runs a root task to a terminal result
    #[instrument(skip(self, task), fields(task = %task.id, priority = task.priority))]
    pub async fn run(&self, task: &Task) -> Orchestration {
        let started = Instant::now();
        if task.is_expired(Utc::now()) {
            return Orchestration {
                result: cancelled(task, &self.config.orchestrator_id),
                subtasks: Vec::new(),
            };
        }

        let explicit = !task.requirements.is_empty();
        let requirements = if explicit {
            task.requirements.clone()
        } else if self.config.infer_capabilities {
            infer_capabilities(&task.description)
        } else {
            Vec::new()
        };
        debug!(?requirements, explicit, "resolved requirements");

        // inferred tags that no agent advertises are dropped, never fatal
        let requirements: Vec<String> = if explicit {
            requirements
        } else {
            requirements
                .into_iter()
                .filter(|c| !self.parts.pool.eligible_for(std::slice::from_ref(c)).is_empty())
                .collect()
        };

        let plans = plan(task, &requirements, &self.parts.pool, self.config.merge_shared_capabilities);
        let orchestration = if plans.len() <= 1 {
            let result = self.dispatch(task, &requirements, explicit).await;
            Orchestration {
                result,
                subtasks: Vec::new(),
            }
        } else {
            self.run_composite(task, plans, explicit).await
        };

        let mut result = orchestration.result;
        result.task_id = task.id.clone();
        if result.execution_time.is_zero() {
            result.execution_time = started.elapsed();
        }
        info!(success = result.success, agent = %result.agent_id, "task finished");
        Orchestration {
            result: result.normalized(),
            subtasks: orchestration.subtasks,
        }
    }

    async fn run_composite(&self, root: &Task, plans: Vec<SubtaskPlan>, explicit: bool) -> Orchestration {
        let started = Instant::now();
        let mut subtasks: Vec<Task> = plans
            .iter()
            .map(|p| {
                let mut subtask = Task::new(format!("{} [{}]", root.description, p.capabilities.join("+")))
                    .with_requirements(p.capabilities.clone())
                    .with_priority(root.priority)
                    .with_parent(root.id.clone());
                subtask.deadline = root.deadline;
                subtask.context = root
                    .context
                    .iter()
                    .filter(|(k, _)| !decompose::ORCHESTRATION_KEYS.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                subtask
            })
            .collect();
        info!(subtasks = subtasks.len(), "decomposed task");

        let mut results: Vec<Option<TaskResult>> = vec![None; plans.len()];
        while results.iter().any(Option::is_none) {
            let ready: Vec<usize> = (0..plans.len())
                .filter(|&i| results[i].is_none())
                .filter(|&i| plans[i].prerequisites.iter().all(|&p| results[p].is_some()))
                .collect();

            if ready.is_empty() {
                // whatever is left waits on itself
                for i in 0..plans.len() {
                    if results[i].is_none() {
                        let err = OrchestratorError::Decomposition("dependency cycle between subtasks".into());
                        results[i] = Some(self.abandon(&mut subtasks[i], err.to_string(), FailureKind::Decomposition));
                    }
                }
                break;
            }

            let mut runnable = Vec::new();
            for i in ready {
                let failed: Vec<String> = plans[i]
                    .prerequisites
                    .iter()
                    .filter(|&&p| results[p].as_ref().map_or(false, |r| !r.success))
                    .map(|&p| plans[p].capabilities.join("+"))
                    .collect();
                if !failed.is_empty() {
                    let reason = format!("prerequisite failed: {}", failed.join(", "));
                    results[i] = Some(self.abandon(&mut subtasks[i], reason, FailureKind::Decomposition));
                    continue;
                }
                let upstream: Map<String, Value> = plans[i]
                    .prerequisites
                    .iter()
                    .filter_map(|&p| {
                        results[p]
                            .as_ref()
                            .map(|r| (subtasks[p].id.clone(), r.data.clone()))
                    })
                    .collect();
                if !upstream.is_empty() {
                    subtasks[i]
                        .context
                        .insert("upstream_results".to_string(), Value::Object(upstream));
                }
                runnable.push(i);
            }

            let wave: Vec<_> = runnable
                .iter()
                .map(|&i| {
                    let subtask = subtasks[i].clone();
                    let capabilities = plans[i].capabilities.clone();
                    let diversity = diversity(root);
                    let task_type = task_type(root, &capabilities);
                    async move {
                        let mut subtask = subtask;
                        let result = self
                            .dispatch_subtask(&mut subtask, &capabilities, explicit, diversity, &task_type)
                            .await;
                        (subtask, result)
                    }
                })
                .collect();
            for (i, (subtask, result)) in runnable.into_iter().zip(join_all(wave).await) {
                subtasks[i] = subtask;
                results[i] = Some(result);
            }
        }

        let results: Vec<TaskResult> = results.into_iter().flatten().collect();
        let result = self.aggregate(root, &plans, &subtasks, &results).with_execution_time(started.elapsed());
        Orchestration { result, subtasks }
    }

    async fn dispatch_subtask(
        &self,
        subtask: &mut Task,
        capabilities: &[String],
        explicit: bool,
        diversity: usize,
        task_type: &str,
    ) -> TaskResult {
        if subtask.is_expired(Utc::now()) {
            let _ = subtask.transition(TaskStatus::Cancelled);
            return cancelled(subtask, &self.config.orchestrator_id);
        }
        let _ = subtask.transition(TaskStatus::InProgress);
        let result = if diversity >= 2 {
            match self.eligible(capabilities, explicit) {
                Ok(eligible) => self.run_diverse(subtask, eligible, diversity, task_type).await,
                Err(err) => decomposition_failure(subtask, &self.config.orchestrator_id, err),
            }
        } else {
            self.select_and_invoke(subtask, capabilities, explicit).await
        };
        subtask.assigned_agent = Some(result.agent_id.clone());
        let status = if result.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        let _ = subtask.transition(status);
        result
    }

    /// Atomic path for a root task
    async fn dispatch(&self, task: &Task, capabilities: &[String], explicit: bool) -> TaskResult {
        let n = diversity(task);
        if n >= 2 {
            return match self.eligible(capabilities, explicit) {
                Ok(eligible) => {
                    let task_type = task_type(task, capabilities);
                    self.run_diverse(task, eligible, n, &task_type).await
                }
                Err(err) => decomposition_failure(task, &self.config.orchestrator_id, err),
            };
        }
        self.select_and_invoke(task, capabilities, explicit).await
    }

    /// Agents allowed to serve `capabilities`
    ///
    /// Explicit requirements must be served exactly. Inferred or empty ones
    /// fall back to general-purpose agents, then to the whole pool.
    fn eligible(&self, capabilities: &[String], explicit: bool) -> Result<Vec<AgentId>, OrchestratorError> {
        let pool = &self.parts.pool;
        if !capabilities.is_empty() {
            let eligible = pool.eligible_for(capabilities);
            if !eligible.is_empty() {
                return Ok(eligible);
            }
            if explicit {
                return Err(OrchestratorError::Decomposition(format!(
                    "no agent advertises {}",
                    capabilities.join(" + ")
                )));
            }
        }
        let general = pool.eligible_for(&["general".to_string()]);
        let fallback = if general.is_empty() { pool.ids() } else { general };
        if fallback.is_empty() {
            return Err(OrchestratorError::Decomposition("no agents registered".into()));
        }
        Ok(fallback)
    }

    async fn select_and_invoke(&self, task: &Task, capabilities: &[String], explicit: bool) -> TaskResult {
        let eligible = match self.eligible(capabilities, explicit) {
            Ok(eligible) => eligible,
            Err(err) => return decomposition_failure(task, &self.config.orchestrator_id, err),
        };
        let features = task_features(task);
        match self.parts.learning.select_agent(&features, &eligible) {
            Some(agent_id) => self.invoke(&agent_id, task, &features).await,
            None => decomposition_failure(
                task,
                &self.config.orchestrator_id,
                OrchestratorError::Decomposition("learning engine returned no agent".into()),
            ),
        }
    }

    /// Runs `task` on up to `n` agents and folds their answers
    async fn run_diverse(&self, task: &Task, eligible: Vec<AgentId>, n: usize, task_type: &str) -> TaskResult {
        let features = task_features(task);
        let chosen: Vec<AgentId> = self
            .parts
            .learning
            .rank_agents(&features, &eligible)
            .into_iter()
            .map(|(agent, _)| agent)
            .take(n.min(self.config.max_diversity.max(1)))
            .collect();
        debug!(task = %task.id, agents = ?chosen, "diversity dispatch");

        let results = join_all(chosen.iter().map(|agent| self.invoke(agent, task, &features))).await;
        let contributions: Vec<AgentContribution> = results
            .iter()
            .filter(|r| r.success)
            .map(|r| {
                let answer = r.data.get("answer").cloned().unwrap_or_else(|| r.data.clone());
                AgentContribution::new(r.agent_id.clone(), answer, r.quality_score)
            })
            .collect();

        if contributions.is_empty() {
            let errors: Vec<String> = results
                .iter()
                .map(|r| format!("{}: {}", r.agent_id, r.error.as_deref().unwrap_or("failed")))
                .collect();
            return TaskResult::failure(
                task.id.clone(),
                self.config.orchestrator_id.clone(),
                format!("every contributor failed ({})", errors.join("; ")),
            );
        }

        match self.parts.collective.aggregate(&task.id, task_type, contributions) {
            Ok(knowledge) => {
                let lead = knowledge
                    .contributions
                    .iter()
                    .filter(|c| !knowledge.dissenters.contains(&c.agent_id))
                    .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap_or(std::cmp::Ordering::Equal))
                    .map(|c| c.agent_id.clone())
                    .unwrap_or_else(|| self.config.orchestrator_id.clone());
                let quality = knowledge.confidence;
                let data = serde_json::to_value(&knowledge).unwrap_or(Value::Null);
                TaskResult::success(task.id.clone(), lead, data)
                    .with_quality(quality)
                    .with_metadata("contributors", json!(chosen))
            }
            Err(err) => TaskResult::failure(task.id.clone(), self.config.orchestrator_id.clone(), err.to_string()),
        }
    }

    /// One gated, resilient invocation plus its learning feedback
    async fn invoke(&self, agent_id: &str, task: &Task, features: &[f64]) -> TaskResult {
        let parts = &self.parts;
        let Some(agent) = parts.pool.get(agent_id) else {
            let err = OrchestratorError::AgentNotFound(agent_id.to_string());
            return decomposition_failure(task, &self.config.orchestrator_id, err);
        };

        let assignment = parts.bus.compose(
            &self.config.orchestrator_id,
            agent_id,
            MessageType::TaskAssignment,
            json!({
                "task_id": task.id,
                "description": task.description,
                "requirements": task.requirements,
            }),
        );
        let assignment = assignment.with_priority(task.priority);

        let permit = self.gate.acquire(task.priority).await;
        parts.bus.send(assignment.clone());
        parts.pool.mark_busy(agent_id, &task.id);
        let report = parts.executor.execute(&agent, task).await;
        drop(permit);

        let invoked = report.invoked();
        let result = report.result;
        parts.bus.reply(
            &assignment,
            agent_id,
            json!({
                "task_id": task.id,
                "success": result.success,
                "error": result.error,
                "quality_score": result.quality_score,
            }),
        );

        if !invoked {
            parts.pool.mark_idle(agent_id);
            parts.metrics.record_invocation(agent_id, &result, None).await;
            warn!(agent = agent_id, task = %task.id, "agent skipped: {}", result.error.as_deref().unwrap_or(""));
            return result;
        }

        parts.pool.record_outcome(agent_id, result.success, result.execution_time);
        let reward = self.reward.reward(&result);
        parts.learning.observe(&Experience {
            agent_id: agent_id.to_string(),
            state: features.to_vec(),
            action: agent_id.to_string(),
            reward,
            next_state: features.to_vec(),
            terminal: true,
            timestamp: Utc::now(),
        });
        parts.pool.apply_reward(agent_id, reward);
        parts.metrics.record_invocation(agent_id, &result, Some(reward)).await;
        result
    }

    /// Marks a subtask cancelled and builds its failed result
    fn abandon(&self, subtask: &mut Task, reason: String, kind: FailureKind) -> TaskResult {
        let _ = subtask.transition(TaskStatus::Cancelled);
        debug!(task = %subtask.id, %reason, "subtask abandoned");
        TaskResult::failure(subtask.id.clone(), self.config.orchestrator_id.clone(), reason)
            .with_metadata("failure_kind", json!(kind.as_str()))
    }

    fn aggregate(&self, root: &Task, plans: &[SubtaskPlan], subtasks: &[Task], results: &[TaskResult]) -> TaskResult {
        let outcomes: Vec<Value> = plans
            .iter()
            .zip(subtasks)
            .zip(results)
            .map(|((plan, subtask), result)| {
                json!({
                    "task_id": subtask.id,
                    "capabilities": plan.capabilities,
                    "optional": plan.optional,
                    "status": subtask.status,
                    "success": result.success,
                    "agent_id": result.agent_id,
                    "quality_score": result.quality_score,
                    "error": result.error,
                    "data": result.data,
                })
            })
            .collect();
        let data = json!({
            "subtask_count": results.len(),
            "subtasks": outcomes,
        });

        let required_failures: Vec<String> = plans
            .iter()
            .zip(results)
            .filter(|(plan, result)| !plan.optional && !result.success)
            .map(|(plan, result)| {
                format!(
                    "{}: {}",
                    plan.capabilities.join("+"),
                    result.error.as_deref().unwrap_or("failed")
                )
            })
            .collect();

        let orchestrator_id = self.config.orchestrator_id.clone();
        if required_failures.is_empty() {
            let succeeded: Vec<&TaskResult> = results.iter().filter(|r| r.success).collect();
            let quality = if succeeded.is_empty() {
                0.0
            } else {
                succeeded.iter().map(|r| r.quality_score).sum::<f64>() / succeeded.len() as f64
            };
            TaskResult::success(root.id.clone(), orchestrator_id, data).with_quality(quality)
        } else {
            TaskResult::failure(
                root.id.clone(),
                orchestrator_id,
                format!("{} required subtask(s) failed: {}", required_failures.len(), required_failures.join("; ")),
            )
            .with_data(data)
        }
    }
}

fn diversity(task: &Task) -> usize {
    task.context
        .get("diversity")
        .and_then(Value::as_u64)
        .map_or(1, |n| n as usize)
}

fn task_type(task: &Task, capabilities: &[String]) -> String {
    task.context
        .get("task_type")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| capabilities.first().cloned())
        .unwrap_or_else(|| "general".to_string())
}

fn cancelled(task: &Task, orchestrator_id: &str) -> TaskResult {
    let err = OrchestratorError::Timeout(format!("deadline passed before task {} was dispatched", task.id));
    TaskResult::failure(task.id.clone(), orchestrator_id, err.to_string())
        .with_metadata("failure_kind", json!(FailureKind::Timeout.as_str()))
        .with_metadata("cancelled", json!(true))
}

fn decomposition_failure(task: &Task, orchestrator_id: &str, err: OrchestratorError) -> TaskResult {
    let kind = err.failure_kind().unwrap_or(FailureKind::Decomposition);
    TaskResult::failure(task.id.clone(), orchestrator_id, err.to_string())
        .with_metadata("failure_kind", json!(kind.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{Agent, Specialization, WorkerAgent};
    use crate::config::{Config, LearningConfig, MessagingConfig};
    use crate::executor::{BreakerConfig, RetryPolicy};
    use crate::protocol::AgentCapability;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Broken;

    #[async_trait]
    impl Agent for Broken {
        fn id(&self) -> &str {
            "broken"
        }

        fn capabilities(&self) -> Vec<AgentCapability> {
            vec![AgentCapability::new("research", "", 1.0)]
        }

        async fn process_task(&self, _task: &Task) -> crate::error::Result<TaskResult> {
            Err(OrchestratorError::agent("broken", "always fails"))
        }
    }

    fn orchestrator(agents: Vec<Arc<dyn Agent>>) -> (Orchestrator, Arc<AgentPool>) {
        let config = Config::default();
        let pool = Arc::new(AgentPool::new(0.2));
        for agent in agents {
            pool.register(agent).unwrap();
        }
        let parts = OrchestratorParts {
            pool: Arc::clone(&pool),
            executor: Arc::new(ResilientExecutor::new(
                RetryPolicy::none(),
                BreakerConfig::default(),
                Duration::from_secs(5),
            )),
            learning: Arc::new(LearningRegistry::new(&LearningConfig {
                seed: Some(1),
                exploration_rate: 0.0,
                ..LearningConfig::default()
            })),
            collective: Arc::new(CollectiveIntelligence::default()),
            metrics: Arc::new(MetricsTracker::new()),
            bus: Arc::new(MessageBus::new(&MessagingConfig::default())),
        };
        (Orchestrator::new(config.orchestrator, config.learning.reward, parts), pool)
    }

    fn worker(spec: Specialization) -> Arc<dyn Agent> {
        Arc::new(WorkerAgent::new(format!("{}-agent", spec), spec))
    }

    #[tokio::test]
    async fn test_atomic_task_runs_on_matching_agent() {
        let (orch, pool) = orchestrator(vec![worker(Specialization::Code), worker(Specialization::Research)]);
        let task = Task::new("write a parser").with_requirements(["code"]);
        let outcome = orch.run(&task).await;

        assert!(outcome.result.success);
        assert_eq!(outcome.result.agent_id, "code-agent");
        assert!(outcome.subtasks.is_empty());
        assert_eq!(pool.state("code-agent").unwrap().tasks_completed, 1);
    }

    #[tokio::test]
    async fn test_composite_task_aggregates_subtasks() {
        let (orch, _) = orchestrator(vec![worker(Specialization::Code), worker(Specialization::Research)]);
        let task = Task::new("build it").with_requirements(["research", "code"]);
        let outcome = orch.run(&task).await;

        assert!(outcome.result.success);
        assert_eq!(outcome.result.data["subtask_count"], json!(2));
        assert_eq!(outcome.subtasks.len(), 2);
        assert!(outcome
            .subtasks
            .iter()
            .all(|s| s.parent_task_id.as_deref() == Some(task.id.as_str()) && s.status == TaskStatus::Completed));
    }

    #[tokio::test]
    async fn test_unknown_explicit_capability_is_decomposition_failure() {
        let (orch, _) = orchestrator(vec![worker(Specialization::Code)]);
        let outcome = orch.run(&Task::new("x").with_requirements(["quantum"])).await;
        assert!(!outcome.result.success);
        assert_eq!(outcome.result.metadata["failure_kind"], json!("decomposition"));
    }

    #[tokio::test]
    async fn test_failed_prerequisite_cancels_dependent() {
        let (orch, _) = orchestrator(vec![Arc::new(Broken), worker(Specialization::Code)]);
        let task = Task::new("x")
            .with_requirements(["research", "code"])
            .with_context("dependencies", json!({"code": ["research"]}));
        let outcome = orch.run(&task).await;

        assert!(!outcome.result.success);
        let subtasks = outcome.result.data["subtasks"].as_array().unwrap();
        assert!(subtasks[1]["error"].as_str().unwrap().contains("prerequisite failed"));
        assert_eq!(outcome.subtasks[1].status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_optional_failure_keeps_parent_successful() {
        let (orch, _) = orchestrator(vec![Arc::new(Broken), worker(Specialization::Code)]);
        let task = Task::new("x")
            .with_requirements(["code", "research"])
            .with_context("optional_capabilities", json!(["research"]));
        let outcome = orch.run(&task).await;

        assert!(outcome.result.success);
        assert_eq!(outcome.result.data["subtasks"][1]["success"], json!(false));
    }

    #[tokio::test]
    async fn test_upstream_results_flow_downstream() {
        let (orch, _) = orchestrator(vec![worker(Specialization::Research), worker(Specialization::Code)]);
        let task = Task::new("x")
            .with_requirements(["research", "code"])
            .with_context("sequential", json!(true));
        let outcome = orch.run(&task).await;

        assert!(outcome.result.success);
        let upstream = outcome.subtasks[1].context["upstream_results"].as_object().unwrap();
        assert!(upstream.contains_key(&outcome.subtasks[0].id));
    }

    #[tokio::test]
    async fn test_inferred_requirements_fall_back_to_general_agents() {
        let (orch, _) = orchestrator(vec![worker(Specialization::General), worker(Specialization::Code)]);
        let outcome = orch.run(&Task::new("say hello")).await;
        assert!(outcome.result.success);
        assert_eq!(outcome.result.agent_id, "general-agent");
    }

    #[tokio::test]
    async fn test_diversity_mode_folds_answers() {
        let agents: Vec<Arc<dyn Agent>> = ["a1", "a2", "a3"]
            .iter()
            .map(|id| Arc::new(WorkerAgent::new(*id, Specialization::DataAnalyst)) as Arc<dyn Agent>)
            .collect();
        let (orch, _) = orchestrator(agents);
        let task = Task::new("average")
            .with_requirements(["data_analysis"])
            .with_context("data", json!([2.0, 4.0]))
            .with_context("diversity", json!(3));
        let outcome = orch.run(&task).await;

        assert!(outcome.result.success);
        assert_eq!(outcome.result.data["method"], json!("weighted_average"));
        let answer = outcome.result.data["answer"].as_f64().unwrap();
        assert!((answer - 3.0).abs() < 1e-9, "got {}", answer);
        assert_eq!(outcome.result.data["contributions"].as_array().unwrap().len(), 3);
    }
}
