use super::{fitness, Agent};
use crate::error::Result;
use crate::memory::MemoryManager;
use crate::protocol::{AgentCapability, Task, TaskResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Worker specializations available to the default pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Specialization {
    /// Information gathering
    Research,
    /// Programming
    Code,
    /// Testing and QA
    Test,
    /// Descriptive statistics over `context.data`
    DataAnalyst,
    /// Catch-all worker
    General,
    /// Modelling over `context.data`
    DataScience,
    /// Interface design
    UiDesign,
    /// Marketing copy and research
    Marketing,
    /// Budgets over `context.amounts`
    Finance,
    /// Aggregates `context.reports`
    Manager,
}

impl Specialization {
    /// Every specialization, in a stable order
    pub const ALL: [Specialization; 10] = [
        Self::Research,
        Self::Code,
        Self::Test,
        Self::DataAnalyst,
        Self::General,
        Self::DataScience,
        Self::UiDesign,
        Self::Marketing,
        Self::Finance,
        Self::Manager,
    ];

    /// Short name used for default agent ids
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Code => "code",
            Self::Test => "test",
            Self::DataAnalyst => "data-analyst",
            Self::General => "general",
            Self::DataScience => "data-science",
            Self::UiDesign => "ui-design",
            Self::Marketing => "marketing",
            Self::Finance => "finance",
            Self::Manager => "manager",
        }
    }

    /// Capabilities advertised by this specialization
    pub fn default_capabilities(&self) -> Vec<AgentCapability> {
        let caps: &[(&str, &str, f64)] = match self {
            Self::Research => &[
                ("research", "Investigate a topic and collect findings", 0.9),
                ("analysis", "Reason about collected material", 0.7),
                ("information_gathering", "Locate and review sources", 0.8),
            ],
            Self::Code => &[
                ("code", "Write and modify code", 0.9),
                ("programming", "General software engineering", 0.85),
                ("debugging", "Locate and fix defects", 0.75),
            ],
            Self::Test => &[
                ("test", "Design and run tests", 0.9),
                ("testing", "Test planning", 0.85),
                ("quality_assurance", "Review output quality", 0.75),
            ],
            Self::DataAnalyst => &[
                ("data_analysis", "Descriptive analysis of datasets", 0.9),
                ("statistics", "Statistical summaries", 0.8),
                ("visualization", "Chart recommendations", 0.6),
            ],
            Self::General => &[
                ("general", "Handle any task at baseline quality", 0.7),
                ("communication", "Summaries and reports", 0.7),
                ("planning", "Break work into steps", 0.6),
            ],
            Self::DataScience => &[
                ("data_science", "Modelling and prediction", 0.9),
                ("machine_learning", "Model selection", 0.8),
                ("statistics", "Statistical summaries", 0.85),
            ],
            Self::UiDesign => &[
                ("ui_design", "Interface layout", 0.9),
                ("ux", "Interaction review", 0.8),
                ("prototyping", "Mockups", 0.7),
            ],
            Self::Marketing => &[
                ("marketing", "Campaign planning", 0.9),
                ("copywriting", "Marketing copy", 0.8),
                ("market_research", "Audience and competitor review", 0.7),
            ],
            Self::Finance => &[
                ("finance", "Financial review", 0.9),
                ("budgeting", "Budget totals", 0.85),
                ("forecasting", "Trend projection", 0.7),
            ],
            Self::Manager => &[
                ("management", "Aggregate team output", 0.9),
                ("coordination", "Sequence work across agents", 0.8),
                ("reporting", "Executive summaries", 0.8),
            ],
        };
        caps.iter()
            .map(|(name, description, proficiency)| {
                AgentCapability::new(*name, *description, *proficiency)
            })
            .collect()
    }

    /// Reads the task context the way this specialization understands it
    fn interpret(&self, task: &Task) -> Value {
        match self {
            Self::Research => {
                let sources = task.context_strings("sources");
                json!({
                    "kind": "research",
                    "summary": format!("Research notes on '{}'", task.description),
                    "sources_reviewed": sources.len(),
                    "key_terms": key_terms(&task.description, 5),
                })
            }
            Self::Code => {
                let language = task
                    .context
                    .get("language")
                    .and_then(Value::as_str)
                    .unwrap_or("rust");
                json!({
                    "kind": "code",
                    "language": language,
                    "artifact": format!("{}.{}", slug(&task.description), extension(language)),
                })
            }
            Self::Test => {
                let targets = task.context_strings("test_targets");
                json!({
                    "kind": "test",
                    "targets": targets,
                    "cases_planned": targets.len().max(1) * 3,
                })
            }
            Self::DataAnalyst | Self::DataScience => {
                let mut stats = describe(&numbers(task.context.get("data")));
                stats["kind"] = json!(self.as_str());
                stats
            }
            Self::Finance => {
                let amounts = numbers(task.context.get("amounts"));
                json!({
                    "kind": "finance",
                    "entries": amounts.len(),
                    "total": amounts.iter().sum::<f64>(),
                    "inflow": amounts.iter().filter(|a| **a > 0.0).sum::<f64>(),
                    "outflow": amounts.iter().filter(|a| **a < 0.0).sum::<f64>(),
                })
            }
            Self::Manager => {
                let reports = task
                    .context
                    .get("reports")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                json!({
                    "kind": "management",
                    "reports_reviewed": reports.len(),
                    "summary": format!("Consolidated {} report(s) for '{}'", reports.len(), task.description),
                })
            }
            Self::General | Self::UiDesign | Self::Marketing => json!({
                "kind": self.as_str(),
                "summary": format!("{} handled '{}'", self.as_str(), task.description),
                "key_terms": key_terms(&task.description, 3),
            }),
        }
    }
}

impl fmt::Display for Specialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Built-in agent implementation backing every specialization
pub struct WorkerAgent {
    id: String,
    specialization: Specialization,
    capabilities: Vec<AgentCapability>,
    memory: Option<Arc<MemoryManager>>,
}

impl WorkerAgent {
    /// Creates a worker advertising the specialization's default capabilities
    pub fn new(id: impl Into<String>, specialization: Specialization) -> Self {
        Self {
            id: id.into(),
            specialization,
            capabilities: specialization.default_capabilities(),
            memory: None,
        }
    }

    /// Creates a general-purpose worker advertising custom capability names
    pub fn with_capabilities(id: impl Into<String>, names: &[String]) -> Self {
        let capabilities = names
            .iter()
            .map(|name| AgentCapability::new(name.clone(), format!("Custom capability '{}'", name), 0.8))
            .collect();
        Self {
            id: id.into(),
            specialization: Specialization::General,
            capabilities,
            memory: None,
        }
    }

    /// Attaches semantic memory used to carry context across tasks
    pub fn with_memory(mut self, memory: Arc<MemoryManager>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// This worker's specialization
    pub fn specialization(&self) -> Specialization {
        self.specialization
    }
}

#[async_trait]
impl Agent for WorkerAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Vec<AgentCapability> {
        self.capabilities.clone()
    }

    async fn process_task(&self, task: &Task) -> Result<TaskResult> {
        let started = Instant::now();
        if let Some(ms) = task.context.get("work_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        let recalled: Vec<String> = self
            .memory
            .as_ref()
            .map(|memory| {
                memory
                    .search(&self.id, &task.description, 3)
                    .into_iter()
                    .map(|m| m.entry.key)
                    .collect()
            })
            .unwrap_or_default();

        let mut data = self.specialization.interpret(task);
        data["recalled"] = json!(recalled);
        let quality = fitness(self, &task.requirements);

        if let Some(memory) = &self.memory {
            memory.store(
                &self.id,
                &task.id,
                &task.description,
                json!({ "specialization": self.specialization, "quality": quality }),
            );
        }

        debug!(agent = %self.id, task = %task.id, quality, "worker finished task");
        Ok(TaskResult::success(task.id.clone(), self.id.clone(), data)
            .with_quality(quality)
            .with_execution_time(started.elapsed()))
    }
}

fn numbers(value: Option<&Value>) -> Vec<f64> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default()
}

fn describe(values: &[f64]) -> Value {
    if values.is_empty() {
        return json!({ "count": 0 });
    }
    let count = values.len() as f64;
    let mean = values.iter().sum::<f64>() / count;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    json!({
        "count": values.len(),
        "mean": mean,
        "min": min,
        "max": max,
        "std_dev": variance.sqrt(),
        "answer": mean,
    })
}

fn key_terms(text: &str, limit: usize) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.len() > 3)
    {
        if !terms.contains(&word) {
            terms.push(word);
        }
        if terms.len() == limit {
            break;
        }
    }
    terms
}

fn slug(text: &str) -> String {
    let slug = key_terms(text, 4).join("_");
    if slug.is_empty() {
        "module".to_string()
    } else {
        slug
    }
}

fn extension(language: &str) -> &'static str {
    match language.to_lowercase().as_str() {
        "python" => "py",
        "typescript" => "ts",
        "javascript" => "js",
        "go" => "go",
        _ => "rs",
    }
}
