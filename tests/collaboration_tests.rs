use llama_orchestrator::{
    AccessMode, AgentContribution, AggregationMethod, CollectiveIntelligence, CoordinationStrategy,
    EnvironmentEvent, NodeRole, SessionState, System, Task, WorkerAgent,
    Specialization,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

mod common;
use common::test_helpers::*;

#[test]
fn test_majority_survives_low_confidence_dissent() {
    let collective = CollectiveIntelligence::new(AggregationMethod::MajorityVote);
    let knowledge = collective
        .aggregate(
            "question",
            "approval",
            vec![
                AgentContribution::new("a", json!(true), 0.9),
                AgentContribution::new("b", json!(true), 0.8),
                AgentContribution::new("c", json!(false), 0.2),
            ],
        )
        .unwrap();

    assert_eq!(knowledge.answer, json!(true));
    assert_eq!(knowledge.dissenters, vec!["c".to_string()]);
}

#[tokio::test]
async fn test_diversity_mode_through_the_facade() {
    let system = System::new(create_test_config()).unwrap();
    system.start().await.unwrap();
    for id in ["analyst-1", "analyst-2", "analyst-3"] {
        system
            .add_custom_agent(Arc::new(WorkerAgent::new(id, Specialization::DataAnalyst)))
            .unwrap();
    }

    let task = Task::new("Average the samples")
        .with_requirements(["data_analysis"])
        .with_context("data", json!([1.0, 2.0, 6.0]))
        .with_context("diversity", json!(3));
    let result = system.submit(task).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.data["method"], "weighted_average");
    let answer = result.data["answer"].as_f64().unwrap();
    assert!((answer - 3.0).abs() < 1e-9, "answer {}", answer);
    assert_eq!(result.data["dissenters"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_agents_coordinate_through_the_environment() {
    let system = System::new(create_test_config()).unwrap();
    let env = Arc::clone(system.environment());
    env.register_resource("spec", "document", json!(null));
    let mut events = env.subscribe(Some("spec"));

    let reader = {
        let env = Arc::clone(&env);
        tokio::spawn(async move { env.await_version("spec", 1).await })
    };

    let mut writer = env.acquire("spec", "research-agent", AccessMode::Exclusive).await.unwrap();
    assert!(env.try_acquire("spec", "code-agent", AccessMode::Shared).unwrap().is_none());
    writer.publish(json!({"endpoints": 3})).unwrap();
    writer.release();

    let published = tokio::time::timeout(Duration::from_secs(1), reader).await.unwrap().unwrap().unwrap();
    assert_eq!(published["endpoints"], 3);

    let mut seen = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(50), events.recv()).await {
        seen.push(event);
    }
    assert!(seen.iter().any(|e| matches!(e, EnvironmentEvent::Published { version: 1, .. })));
    assert!(matches!(seen.last(), Some(EnvironmentEvent::Released { .. })));
}

#[tokio::test]
async fn test_systems_cooperate_as_coordination_nodes() {
    let mut research_config = create_test_config();
    research_config.pool.default_agents = vec![Specialization::Research];
    research_config.coordination.quorum = 2;
    let research = System::new(research_config).unwrap();
    research.start().await.unwrap();

    let mut code_config = create_test_config();
    code_config.pool.default_agents = vec![Specialization::Code];
    let code = System::new(code_config).unwrap();
    code.start().await.unwrap();

    let coordinator = research.coordinator();
    let session = coordinator.create_session(Some(CoordinationStrategy::CapabilityWeighted));
    coordinator.join(&session, research.as_node("node-research")).unwrap();
    assert!(coordinator.elect(&session).is_err());
    coordinator.join(&session, code.as_node("node-code")).unwrap();
    let info = coordinator.elect(&session).unwrap();
    assert_eq!(info.state, SessionState::Active);
    assert!(info.roles.values().any(|role| *role == NodeRole::Leader));

    let task = Task::new("Write the parser").with_requirements(["code"]);
    let result = coordinator.dispatch(&session, task.clone()).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.task_id, task.id);
    assert_eq!(result.metadata["node_id"], "node-code");
    assert_eq!(code.get_metrics().await.total_tasks, 1);
    assert_eq!(research.get_metrics().await.total_tasks, 0);

    let orphaned = coordinator.leave(&session, "node-code").unwrap();
    assert!(orphaned.is_empty());
    let result = coordinator
        .dispatch(&session, Task::new("Write more").with_requirements(["code"]))
        .await;
    assert!(!result.success);
    assert_eq!(result.metadata["failure_kind"], "coordination");
}
