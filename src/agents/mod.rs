//! Executable agents and the worker pool
//!
//! Every unit of work flows through the [`Agent`] trait: one method to run a
//! task and one accessor for the advertised capabilities. Specializations
//! differ only in what they advertise and how they read `Task::context`.

use crate::error::Result;
use crate::protocol::{AgentCapability, Task, TaskResult};
use async_trait::async_trait;

pub mod pool;
pub mod worker;

pub use pool::AgentPool;
pub use worker::{Specialization, WorkerAgent};

/// Polymorphic unit of work execution
///
/// Implementations may return `Err` or a result with `success = false`; the
/// resilient executor turns both (and panics) into a failed `TaskResult`.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Unique agent id
    fn id(&self) -> &str;

    /// Capabilities with proficiency scores
    fn capabilities(&self) -> Vec<AgentCapability>;

    /// Executes one task
    async fn process_task(&self, task: &Task) -> Result<TaskResult>;

    /// Advertised capability names
    fn capability_names(&self) -> Vec<String> {
        self.capabilities().into_iter().map(|c| c.name).collect()
    }

    /// Proficiency for `capability`, zero when not advertised
    fn proficiency(&self, capability: &str) -> f64 {
        self.capabilities()
            .iter()
            .find(|c| c.name == capability)
            .map_or(0.0, |c| c.proficiency)
    }

    /// Whether this agent advertises every tag in `capabilities`
    fn serves_all(&self, capabilities: &[String]) -> bool {
        let names = self.capability_names();
        capabilities.iter().all(|c| names.contains(c))
    }
}

/// Mean proficiency of `agent` over `capabilities`
///
/// Tags the agent does not advertise count as 0.3 so a fallback agent still
/// reports a usable but clearly lower quality.
pub fn fitness(agent: &dyn Agent, capabilities: &[String]) -> f64 {
    if capabilities.is_empty() {
        let own = agent.capabilities();
        if own.is_empty() {
            return 0.5;
        }
        return own.iter().map(|c| c.proficiency).sum::<f64>() / own.len() as f64;
    }
    capabilities
        .iter()
        .map(|c| {
            let p = agent.proficiency(c);
            if p > 0.0 {
                p
            } else {
                0.3
            }
        })
        .sum::<f64>()
        / capabilities.len() as f64
}
