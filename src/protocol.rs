//! Value objects exchanged between every component of the engine.
//!
//! These are immutable by convention: components pass clones around and only
//! the owner of a record (the facade for tasks, an agent's pool slot for its
//! state) mutates it.

use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Identifier of a task
pub type TaskId = String;
/// Identifier of an agent
pub type AgentId = String;

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dispatch
    Pending,
    /// Dispatched to an agent or being orchestrated
    InProgress,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully
    Failed,
    /// Abandoned before completion (deadline, shutdown, failed prerequisite)
    Cancelled,
}

impl TaskStatus {
    /// Whether no further transitions are allowed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// pending -> in_progress -> {completed, failed, cancelled}; a pending
    /// task may also be cancelled outright.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::Pending, Self::Cancelled)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
                | (Self::InProgress, Self::Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// An abstract unit of work described by capability tags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task id
    pub id: TaskId,
    /// Free-text description
    pub description: String,
    /// Ordered capability names the task requires
    pub requirements: Vec<String>,
    /// Arbitrary caller-supplied context
    pub context: HashMap<String, Value>,
    /// Higher is more urgent
    pub priority: i32,
    /// Optional deadline after which the task is cancelled
    pub deadline: Option<DateTime<Utc>>,
    /// Current lifecycle status
    pub status: TaskStatus,
    /// Agent the task was dispatched to
    pub assigned_agent: Option<AgentId>,
    /// Parent task for subtasks
    pub parent_task_id: Option<TaskId>,
    /// Subtasks created by decomposition
    pub subtasks: Vec<TaskId>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Dispatch time
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal transition time
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Creates a pending task with a fresh id and priority 1
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.into(),
            requirements: Vec::new(),
            context: HashMap::new(),
            priority: 1,
            deadline: None,
            status: TaskStatus::Pending,
            assigned_agent: None,
            parent_task_id: None,
            subtasks: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Sets the required capabilities, dropping duplicates but keeping order
    pub fn with_requirements<I, S>(mut self, requirements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requirements.clear();
        for requirement in requirements {
            let requirement = requirement.into();
            if !requirement.is_empty() && !self.requirements.contains(&requirement) {
                self.requirements.push(requirement);
            }
        }
        self
    }

    /// Sets the priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the deadline
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Adds one context entry
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Marks this task as a subtask of `parent`
    pub fn with_parent(mut self, parent: impl Into<TaskId>) -> Self {
        self.parent_task_id = Some(parent.into());
        self
    }

    /// Whether the deadline, if any, lies before `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map_or(false, |deadline| deadline < now)
    }

    /// Moves the task to `next`, stamping the lifecycle timestamps
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition {
                task_id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        match next {
            TaskStatus::InProgress => self.started_at = Some(now),
            status if status.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Context value as a string list, ignoring non-string entries
    pub fn context_strings(&self, key: &str) -> Vec<String> {
        self.context
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Outcome of exactly one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Task this result belongs to
    pub task_id: TaskId,
    /// Whether the task succeeded
    pub success: bool,
    /// Opaque payload
    pub data: Value,
    /// Error description; always present when `success` is false
    pub error: Option<String>,
    /// Agent that produced the result
    pub agent_id: AgentId,
    /// Wall-clock execution time
    pub execution_time: Duration,
    /// Quality in [0, 1]
    pub quality_score: f64,
    /// Free-form metadata
    pub metadata: HashMap<String, Value>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl TaskResult {
    /// A successful result with full quality
    pub fn success(task_id: impl Into<TaskId>, agent_id: impl Into<AgentId>, data: Value) -> Self {
        Self {
            task_id: task_id.into(),
            success: true,
            data,
            error: None,
            agent_id: agent_id.into(),
            execution_time: Duration::ZERO,
            quality_score: 1.0,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// A failed result; an empty error string is replaced so the result
    /// always explains itself
    pub fn failure(
        task_id: impl Into<TaskId>,
        agent_id: impl Into<AgentId>,
        error: impl Into<String>,
    ) -> Self {
        let mut error = error.into();
        if error.trim().is_empty() {
            error = "unspecified failure".to_string();
        }
        Self {
            task_id: task_id.into(),
            success: false,
            data: Value::Null,
            error: Some(error),
            agent_id: agent_id.into(),
            execution_time: Duration::ZERO,
            quality_score: 0.0,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Sets the quality score, clamped to [0, 1]
    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality_score = if quality.is_finite() {
            quality.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Sets the execution time
    pub fn with_execution_time(mut self, elapsed: Duration) -> Self {
        self.execution_time = elapsed;
        self
    }

    /// Replaces the data payload
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Adds one metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Restores `success=false => error non-empty` on results coming from
    /// agents that did not fill in an error
    pub fn normalized(mut self) -> Self {
        if !self.success && self.error.as_deref().map_or(true, |e| e.trim().is_empty()) {
            self.error = Some("agent reported failure without an error".to_string());
        }
        self.quality_score = if self.quality_score.is_finite() {
            self.quality_score.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }
}

/// Kind of an inter-component message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Task dispatched to an agent
    TaskAssignment,
    /// Agent output
    TaskResult,
    /// Question to another component
    Query,
    /// Answer to a query
    Response,
    /// Fan-out to everyone
    Broadcast,
    /// Receipt
    Acknowledgment,
    /// Error report
    Error,
}

/// Message exchanged over the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id
    pub id: String,
    /// Sender id
    pub sender: String,
    /// Recipient id; empty means broadcast
    pub recipient: String,
    /// Message kind
    pub message_type: MessageType,
    /// Payload
    pub content: Value,
    /// Higher is more urgent
    pub priority: i32,
    /// Whether the sender expects a reply
    pub requires_response: bool,
    /// Correlation id of the message this replies to
    pub in_response_to: Option<String>,
    /// Send time
    pub timestamp: DateTime<Utc>,
    /// Lifetime in seconds
    pub ttl_secs: u64,
}

impl Message {
    /// Direct message with a one-hour TTL
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        message_type: MessageType,
        content: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender: sender.into(),
            recipient: recipient.into(),
            message_type,
            content,
            priority: 1,
            requires_response: false,
            in_response_to: None,
            timestamp: Utc::now(),
            ttl_secs: 3600,
        }
    }

    /// Broadcast message
    pub fn broadcast(sender: impl Into<String>, content: Value) -> Self {
        Self::new(sender, "", MessageType::Broadcast, content)
    }

    /// Sets the TTL
    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    /// Sets the priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Marks the message as expecting a reply
    pub fn expecting_response(mut self) -> Self {
        self.requires_response = true;
        self
    }

    /// Builds a reply correlated to `self`
    pub fn reply(&self, sender: impl Into<String>, message_type: MessageType, content: Value) -> Self {
        let mut reply = Self::new(sender, self.sender.clone(), message_type, content);
        reply.in_response_to = Some(self.id.clone());
        reply.priority = self.priority;
        reply
    }

    /// Whether the recipient is everyone
    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_empty()
    }

    /// Whether the message outlived its TTL at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.timestamp);
        age.num_milliseconds() > i64::try_from(self.ttl_secs).unwrap_or(i64::MAX).saturating_mul(1000)
    }
}

/// A named skill with a proficiency in [0, 1]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCapability {
    /// Capability tag
    pub name: String,
    /// Human readable description
    pub description: String,
    /// Proficiency in [0, 1]
    pub proficiency: f64,
}

impl AgentCapability {
    /// Creates a capability, clamping the proficiency
    pub fn new(name: impl Into<String>, description: impl Into<String>, proficiency: f64) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            proficiency: proficiency.clamp(0.0, 1.0),
        }
    }
}

/// One reinforcement-learning observation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experience {
    /// Agent that acted
    pub agent_id: AgentId,
    /// Feature vector before the action
    pub state: Vec<f64>,
    /// Agent (route) chosen
    pub action: AgentId,
    /// Shaped reward
    pub reward: f64,
    /// Feature vector after the action
    pub next_state: Vec<f64>,
    /// Whether the episode ended
    pub terminal: bool,
    /// Observation time
    pub timestamp: DateTime<Utc>,
}

/// Operational status of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Ready for work
    Idle,
    /// Executing a task
    Busy,
    /// Last invocation failed
    Error,
}

/// Per-agent bookkeeping owned by the agent's pool slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    /// Agent id
    pub agent_id: AgentId,
    /// Current status
    pub status: AgentStatus,
    /// Task most recently started
    pub current_task: Option<TaskId>,
    /// Invocations currently running on this agent
    #[serde(default)]
    pub active_tasks: usize,
    /// Completed task count
    pub tasks_completed: u64,
    /// Failed task count
    pub tasks_failed: u64,
    /// Running average execution time in seconds
    pub average_execution_time: f64,
    /// Last activity time
    pub last_active: DateTime<Utc>,
    /// Advertised capability names
    pub capabilities: Vec<String>,
    /// Learning feedback score in [0, 1]
    pub performance_score: f64,
}

impl AgentState {
    /// Fresh idle state
    pub fn new(agent_id: impl Into<AgentId>, capabilities: Vec<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            status: AgentStatus::Idle,
            current_task: None,
            active_tasks: 0,
            tasks_completed: 0,
            tasks_failed: 0,
            average_execution_time: 0.0,
            last_active: Utc::now(),
            capabilities,
            performance_score: 0.5,
        }
    }

    /// Marks the agent busy with `task_id`
    pub fn begin(&mut self, task_id: &str) {
        self.active_tasks += 1;
        self.status = AgentStatus::Busy;
        self.current_task = Some(task_id.to_string());
        self.last_active = Utc::now();
    }

    /// Ends one invocation without recording an outcome
    pub fn end(&mut self) {
        self.active_tasks = self.active_tasks.saturating_sub(1);
        if self.active_tasks == 0 {
            self.status = AgentStatus::Idle;
            self.current_task = None;
        }
    }

    /// Records the outcome of one invocation; the agent stays busy while
    /// others are still running
    pub fn finish(&mut self, success: bool, elapsed: Duration) {
        let runs = self.tasks_completed + self.tasks_failed;
        self.average_execution_time = (self.average_execution_time * runs as f64
            + elapsed.as_secs_f64())
            / (runs + 1) as f64;
        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
        self.active_tasks = self.active_tasks.saturating_sub(1);
        if self.active_tasks > 0 {
            self.status = AgentStatus::Busy;
        } else {
            self.status = if success { AgentStatus::Idle } else { AgentStatus::Error };
            self.current_task = None;
        }
        self.last_active = Utc::now();
    }

    /// Moves the performance score toward the squashed reward
    pub fn apply_reward(&mut self, reward: f64, smoothing: f64) {
        let target = 1.0 / (1.0 + (-reward).exp());
        self.performance_score =
            ((1.0 - smoothing) * self.performance_score + smoothing * target).clamp(0.0, 1.0);
    }

    /// Completed / total, or 0 when idle so far
    pub fn success_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            0.0
        } else {
            self.tasks_completed as f64 / total as f64
        }
    }
}

/// System-wide counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    /// Tasks submitted
    pub total_tasks: u64,
    /// Tasks completed successfully
    pub completed_tasks: u64,
    /// Tasks that failed or were cancelled
    pub failed_tasks: u64,
    /// Registered agents
    pub active_agents: usize,
    /// Mean task time in seconds
    pub average_task_time: f64,
    /// completed / (completed + failed)
    pub success_rate: f64,
    /// Sum of all rewards fed to the learning engines
    pub cumulative_reward: f64,
    /// Snapshot time
    pub timestamp: DateTime<Utc>,
}

impl Default for SystemMetrics {
    fn default() -> Self {
        Self {
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            active_agents: 0,
            average_task_time: 0.0,
            success_rate: 0.0,
            cumulative_reward: 0.0,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use test_case::test_case;

    #[test_case(TaskStatus::Pending, TaskStatus::InProgress, true ; "pending starts")]
    #[test_case(TaskStatus::Pending, TaskStatus::Cancelled, true ; "pending cancels")]
    #[test_case(TaskStatus::InProgress, TaskStatus::Completed, true ; "running completes")]
    #[test_case(TaskStatus::InProgress, TaskStatus::Failed, true ; "running fails")]
    #[test_case(TaskStatus::Pending, TaskStatus::Completed, false ; "pending cannot complete")]
    #[test_case(TaskStatus::Completed, TaskStatus::InProgress, false ; "terminal is final")]
    #[test_case(TaskStatus::Failed, TaskStatus::Completed, false ; "failed stays failed")]
    fn test_status_transitions(from: TaskStatus, to: TaskStatus, allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn test_task_lifecycle_timestamps() {
        let mut task = Task::new("summarize findings");
        assert!(task.transition(TaskStatus::Completed).is_err());

        task.transition(TaskStatus::InProgress).unwrap();
        assert!(task.started_at.is_some());
        task.transition(TaskStatus::Completed).unwrap();
        assert!(task.completed_at.is_some());
        assert!(task.transition(TaskStatus::Failed).is_err());
    }

    #[test]
    fn test_requirements_are_deduplicated_in_order() {
        let task = Task::new("x").with_requirements(["code", "research", "code", ""]);
        assert_eq!(task.requirements, vec!["code", "research"]);
    }

    #[test]
    fn test_failure_always_carries_error() {
        let result = TaskResult::failure("t1", "a1", "  ");
        assert!(!result.success);
        assert!(!result.error.unwrap().trim().is_empty());

        let mut raw = TaskResult::success("t1", "a1", json!({}));
        raw.success = false;
        let normalized = raw.normalized();
        assert!(normalized.error.is_some());
    }

    #[test]
    fn test_message_ttl_and_reply() {
        let mut msg = Message::new("orchestrator", "code-agent", MessageType::Query, json!("ping"))
            .with_ttl(1);
        assert!(!msg.is_expired(Utc::now()));
        msg.timestamp = Utc::now() - chrono::Duration::seconds(5);
        assert!(msg.is_expired(Utc::now()));

        let reply = msg.reply("code-agent", MessageType::Response, json!("pong"));
        assert_eq!(reply.in_response_to.as_deref(), Some(msg.id.as_str()));
        assert_eq!(reply.recipient, "orchestrator");
        assert!(Message::broadcast("x", json!(null)).is_broadcast());
    }

    #[test_case(u64::MAX ; "max ttl")]
    #[test_case(i64::MAX as u64 + 1 ; "just past signed range")]
    fn test_huge_ttl_never_expires(ttl: u64) {
        let mut msg = Message::new("o", "a", MessageType::Query, json!(null)).with_ttl(ttl);
        msg.timestamp = Utc::now() - chrono::Duration::days(365);
        assert!(!msg.is_expired(Utc::now()));
    }

    #[test]
    fn test_agent_state_stays_busy_while_invocations_overlap() {
        let mut state = AgentState::new("a", vec!["code".into()]);
        state.begin("t1");
        state.begin("t2");
        state.finish(true, Duration::from_secs(1));
        assert_eq!(state.status, AgentStatus::Busy);
        assert_eq!(state.active_tasks, 1);

        state.end();
        assert_eq!(state.status, AgentStatus::Idle);
        assert_eq!(state.active_tasks, 0);
        assert!(state.current_task.is_none());
    }

    #[test]
    fn test_agent_state_running_average() {
        let mut state = AgentState::new("a", vec!["code".into()]);
        state.begin("t1");
        assert_eq!(state.status, AgentStatus::Busy);
        state.finish(true, Duration::from_secs(2));
        state.finish(false, Duration::from_secs(4));
        assert_eq!(state.tasks_completed, 1);
        assert_eq!(state.tasks_failed, 1);
        assert!((state.average_execution_time - 3.0).abs() < 1e-9);
        assert_eq!(state.status, AgentStatus::Error);
        assert!((state.success_rate() - 0.5).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn quality_is_always_clamped(q in proptest::num::f64::ANY) {
            let result = TaskResult::success("t", "a", json!(null)).with_quality(q);
            prop_assert!((0.0..=1.0).contains(&result.quality_score));
        }

        #[test]
        fn performance_score_stays_in_unit_interval(rewards in proptest::collection::vec(-50.0f64..50.0, 1..40)) {
            let mut state = AgentState::new("a", vec![]);
            for r in rewards {
                state.apply_reward(r, 0.2);
                prop_assert!((0.0..=1.0).contains(&state.performance_score));
            }
        }
    }
}
