use crate::agents::AgentPool;
use crate::protocol::Task;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

/// Context keys the orchestrator consumes; they are not forwarded to subtasks
pub const ORCHESTRATION_KEYS: [&str; 5] = [
    "dependencies",
    "sequential",
    "optional_capabilities",
    "diversity",
    "task_type",
];

static CAPABILITY_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"(?i)\b(research|investigate|survey|literature|sources?)\b", "research"),
        (r"(?i)\b(code|implement|program|refactor|function|api|bug|compile)\b", "code"),
        (r"(?i)\b(tests?|verify|validate|qa|regression)\b", "test"),
        (r"(?i)\b(analy[sz]e|analysis|dataset|data|metrics|trend)\b", "data_analysis"),
        (r"(?i)\b(model|predict|forecast|machine learning|ml)\b", "data_science"),
        (r"(?i)\b(ui|ux|interface|layout|mockup|design)\b", "ui_design"),
        (r"(?i)\b(marketing|campaign|audience|brand)\b", "marketing"),
        (r"(?i)\b(budget|finance|financial|revenue|cost|invoice)\b", "finance"),
        (r"(?i)\b(report|summary|consolidate|executive)\b", "reporting"),
    ]
    .into_iter()
    .filter_map(|(pattern, capability)| Regex::new(pattern).ok().map(|re| (re, capability)))
    .collect()
});

/// Capability tags suggested by a free-text description, in table order
pub fn infer_capabilities(description: &str) -> Vec<String> {
    CAPABILITY_PATTERNS
        .iter()
        .filter(|(re, _)| re.is_match(description))
        .map(|(_, capability)| capability.to_string())
        .collect()
}

/// One planned subtask
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtaskPlan {
    /// Tags served together by this subtask
    pub capabilities: Vec<String>,
    /// Whether failure of this subtask leaves the parent intact
    pub optional: bool,
    /// Indices of plans that must finish first
    pub prerequisites: Vec<usize>,
}

/// Splits `task` into capability groups with their ordering constraints
///
/// Tags are taken in declared order. With `merge` set, a tag joins the first
/// group that some single agent can serve together with it, provided both
/// share optionality and no ordering edge runs between them.
pub fn plan(task: &Task, requirements: &[String], pool: &AgentPool, merge: bool) -> Vec<SubtaskPlan> {
    let optional = task.context_strings("optional_capabilities");
    let dependencies = dependency_map(task);
    let depends = |a: &str, b: &str| {
        dependencies.get(a).map_or(false, |pre| pre.iter().any(|p| p == b))
            || dependencies.get(b).map_or(false, |pre| pre.iter().any(|p| p == a))
    };
    let sequential = task
        .context
        .get("sequential")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut plans: Vec<SubtaskPlan> = Vec::new();
    for capability in requirements {
        let is_optional = optional.contains(capability);
        let target = if merge && !sequential {
            plans.iter().position(|group| {
                if group.optional != is_optional
                    || group.capabilities.iter().any(|c| depends(c, capability))
                {
                    return false;
                }
                let mut combined = group.capabilities.clone();
                combined.push(capability.clone());
                pool.can_serve_together(&combined)
            })
        } else {
            None
        };
        match target {
            Some(index) => plans[index].capabilities.push(capability.clone()),
            None => plans.push(SubtaskPlan {
                capabilities: vec![capability.clone()],
                optional: is_optional,
                prerequisites: Vec::new(),
            }),
        }
    }

    let group_of = |capability: &str| plans.iter().position(|p| p.capabilities.iter().any(|c| c == capability));
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); plans.len()];
    for (index, group) in plans.iter().enumerate() {
        if sequential && index > 0 {
            edges[index].push(index - 1);
        }
        for capability in &group.capabilities {
            for prerequisite in dependencies.get(capability).into_iter().flatten() {
                if let Some(pre) = group_of(prerequisite) {
                    if pre != index && !edges[index].contains(&pre) {
                        edges[index].push(pre);
                    }
                }
            }
        }
    }
    for (group, prerequisites) in plans.iter_mut().zip(edges) {
        group.prerequisites = prerequisites;
    }
    plans
}

fn dependency_map(task: &Task) -> HashMap<String, Vec<String>> {
    task.context
        .get("dependencies")
        .and_then(Value::as_object)
        .map(|deps| {
            deps.iter()
                .map(|(capability, prerequisites)| {
                    let list = prerequisites
                        .as_array()
                        .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                        .unwrap_or_default();
                    (capability.clone(), list)
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{Specialization, WorkerAgent};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn pool() -> AgentPool {
        let pool = AgentPool::new(0.2);
        for spec in [Specialization::Research, Specialization::Code, Specialization::Test] {
            pool.register(Arc::new(WorkerAgent::new(format!("{}-agent", spec), spec)))
                .unwrap();
        }
        pool
    }

    fn caps(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_infer_capabilities() {
        assert_eq!(infer_capabilities("Implement and test the parser"), caps(&["code", "test"]));
        assert_eq!(infer_capabilities("Research async runtimes"), caps(&["research"]));
        assert!(infer_capabilities("Test task").contains(&"test".to_string()));
        assert!(infer_capabilities("hello there").is_empty());
    }

    #[test]
    fn test_distinct_agents_get_distinct_subtasks() {
        let task = Task::new("x");
        let plans = plan(&task, &caps(&["research", "code"]), &pool(), true);
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].capabilities, caps(&["research"]));
        assert!(plans.iter().all(|p| p.prerequisites.is_empty()));
    }

    #[test]
    fn test_tags_served_by_one_agent_are_merged() {
        let task = Task::new("x");
        let requirements = caps(&["code", "research", "debugging"]);

        let merged = plan(&task, &requirements, &pool(), true);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].capabilities, caps(&["code", "debugging"]));

        let split = plan(&task, &requirements, &pool(), false);
        assert_eq!(split.len(), 3);
    }

    #[test]
    fn test_dependencies_and_optional_tags() {
        let task = Task::new("x")
            .with_context("dependencies", json!({"test": ["code"]}))
            .with_context("optional_capabilities", json!(["research"]));
        let plans = plan(&task, &caps(&["code", "test", "research"]), &pool(), true);

        assert_eq!(plans.len(), 3);
        assert_eq!(plans[1].capabilities, caps(&["test"]));
        assert_eq!(plans[1].prerequisites, vec![0]);
        assert!(plans[2].optional);
    }

    #[test]
    fn test_sequential_chains_every_group() {
        let task = Task::new("x").with_context("sequential", json!(true));
        let plans = plan(&task, &caps(&["code", "debugging", "test"]), &pool(), true);
        assert_eq!(plans.len(), 3);
        assert_eq!(plans[2].prerequisites, vec![1]);
    }
}
