use super::{Agent, Specialization, WorkerAgent};
use crate::error::{OrchestratorError, Result};
use crate::memory::{MemoryManager, SHARED_PARTITION};
use crate::protocol::{AgentId, AgentState};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Registry of executable agents and their states
///
/// Each agent's `AgentState` lives in its own map slot, so updates for
/// different agents never contend.
pub struct AgentPool {
    agents: DashMap<AgentId, Arc<dyn Agent>>,
    states: DashMap<AgentId, AgentState>,
    smoothing: f64,
}

impl AgentPool {
    /// Creates an empty pool
    pub fn new(performance_smoothing: f64) -> Self {
        Self {
            agents: DashMap::new(),
            states: DashMap::new(),
            smoothing: performance_smoothing.clamp(0.0, 1.0),
        }
    }

    /// Registers one worker per specialization, named `<specialization>-agent`
    pub fn populate_defaults(
        &self,
        specializations: &[Specialization],
        memory: &Arc<MemoryManager>,
    ) -> Result<Vec<AgentId>> {
        let mut ids = Vec::with_capacity(specializations.len());
        for spec in specializations {
            let id = format!("{}-agent", spec.as_str());
            if self.agents.contains_key(&id) {
                continue;
            }
            let agent = WorkerAgent::new(id.clone(), *spec).with_memory(Arc::clone(memory));
            ids.push(self.register(Arc::new(agent))?);
        }
        info!("Initialized {} default agents", ids.len());
        Ok(ids)
    }

    /// Registers an agent; ids must be unique
    pub fn register(&self, agent: Arc<dyn Agent>) -> Result<AgentId> {
        let id = agent.id().to_string();
        if id.is_empty() {
            return Err(OrchestratorError::Config("agent id must not be empty".into()));
        }
        if id == SHARED_PARTITION {
            return Err(OrchestratorError::Config(format!(
                "agent id '{}' is reserved for shared memory",
                id
            )));
        }
        match self.agents.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(OrchestratorError::DuplicateAgent(id));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                self.states
                    .insert(id.clone(), AgentState::new(id.clone(), agent.capability_names()));
                slot.insert(agent);
            }
        }
        info!(agent = %id, "registered agent");
        Ok(id)
    }

    /// Removes an agent and its state
    pub fn remove(&self, id: &str) -> Option<Arc<dyn Agent>> {
        self.states.remove(id);
        self.agents.remove(id).map(|(_, agent)| agent)
    }

    /// Looks up an agent
    pub fn get(&self, id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of registered agents
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether no agent is registered
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// All agent ids, sorted
    pub fn ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.agents.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Agents advertising every tag in `capabilities`, sorted by id; an empty
    /// requirement list matches every agent
    pub fn eligible_for(&self, capabilities: &[String]) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self
            .agents
            .iter()
            .filter(|entry| entry.value().serves_all(capabilities))
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Whether one single agent advertises all of `capabilities`
    pub fn can_serve_together(&self, capabilities: &[String]) -> bool {
        self.agents
            .iter()
            .any(|entry| entry.value().serves_all(capabilities))
    }

    /// Marks an agent busy with a task
    pub fn mark_busy(&self, id: &str, task_id: &str) {
        if let Some(mut state) = self.states.get_mut(id) {
            state.begin(task_id);
        }
    }

    /// Returns an agent to idle without recording an outcome
    pub fn mark_idle(&self, id: &str) {
        if let Some(mut state) = self.states.get_mut(id) {
            state.end();
        }
    }

    /// Records an invocation outcome on the agent's state
    pub fn record_outcome(&self, id: &str, success: bool, elapsed: Duration) {
        if let Some(mut state) = self.states.get_mut(id) {
            state.finish(success, elapsed);
        }
    }

    /// Feeds a learning reward into the agent's performance score
    pub fn apply_reward(&self, id: &str, reward: f64) {
        if let Some(mut state) = self.states.get_mut(id) {
            state.apply_reward(reward, self.smoothing);
        }
    }

    /// Snapshot of one agent's state
    pub fn state(&self, id: &str) -> Option<AgentState> {
        self.states.get(id).map(|s| s.value().clone())
    }

    /// Snapshot of every agent's state
    pub fn states(&self) -> HashMap<AgentId, AgentState> {
        self.states
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}
