use chrono::Utc;
use llama_orchestrator::config::LearningConfig;
use llama_orchestrator::learning::{task_features, PolicyArtifact};
use llama_orchestrator::{EngineKind, Experience, LearningEngine, System, Task};
use tempfile::TempDir;
use test_case::test_case;

mod common;
use common::test_helpers::*;

fn agents() -> Vec<String> {
    caps(&["alpha", "beta", "gamma"])
}

fn trained(kind: EngineKind) -> LearningEngine {
    let config = LearningConfig {
        exploration_rate: 0.4,
        seed: Some(5),
        ..LearningConfig::default()
    };
    let mut engine = LearningEngine::new(kind, &config, 5);
    let task = Task::new("analyze").with_requirements(["data_analysis"]).with_priority(3);
    let state = task_features(&task);
    for round in 0..30 {
        let action = agents()[round % 3].clone();
        let reward = if action == "beta" { 1.2 } else { -0.5 };
        engine.update(&Experience {
            agent_id: action.clone(),
            state: state.clone(),
            action,
            reward,
            next_state: state.clone(),
            terminal: true,
            timestamp: Utc::now(),
        });
    }
    engine
}

#[test_case(EngineKind::QLearning ; "q learning")]
#[test_case(EngineKind::PolicyGradient ; "policy gradient")]
fn test_saved_policy_reproduces_selections(kind: EngineKind) {
    let mut original = trained(kind);
    let artifact = original.save("dispatch").unwrap();
    let json = serde_json::to_string(&artifact).unwrap();
    let restored: PolicyArtifact = serde_json::from_str(&json).unwrap();
    let mut restored = LearningEngine::load(restored).unwrap();

    assert_eq!(restored.kind(), kind);
    assert_eq!(restored.statistics(), original.statistics());

    let state = task_features(&Task::new("analyze").with_requirements(["data_analysis"]).with_priority(3));
    for _ in 0..25 {
        assert_eq!(
            original.select_agent(&state, &agents()),
            restored.select_agent(&state, &agents())
        );
    }
}

#[test_case(EngineKind::QLearning ; "q learning")]
#[test_case(EngineKind::PolicyGradient ; "policy gradient")]
fn test_rewarded_agent_ranks_first(kind: EngineKind) {
    let engine = trained(kind);
    let state = task_features(&Task::new("analyze").with_requirements(["data_analysis"]).with_priority(3));
    let ranking = engine.rank_agents(&state, &agents());
    assert_eq!(ranking[0].0, "beta");
    assert_eq!(engine.statistics().update_count, 30);
}

#[tokio::test]
async fn test_system_policy_round_trip() {
    let dir = TempDir::new().unwrap();
    let system = System::new(create_test_config()).unwrap();
    system.start().await.unwrap();
    for _ in 0..4 {
        system.execute_task("Write code", &caps(&["code"]), 1).await;
    }
    let written = system.save_policies(dir.path()).await.unwrap();
    assert_eq!(written.len(), 2);

    let fresh = System::new(create_test_config()).unwrap();
    assert_eq!(fresh.load_policies(dir.path()).await.unwrap(), 2);
    assert_eq!(fresh.learning_statistics(), system.learning_statistics());
}

#[tokio::test]
async fn test_mismatched_artifact_is_rejected() {
    let dir = TempDir::new().unwrap();
    let system = System::new(create_test_config()).unwrap();
    system.save_policies(dir.path()).await.unwrap();
    std::fs::copy(
        dir.path().join("policy_gradient.policy.json"),
        dir.path().join("q_learning.policy.json"),
    )
    .unwrap();

    assert!(system.load_policies(dir.path()).await.is_err());
}
