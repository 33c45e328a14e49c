//! Multi-agent strategies through the spawned runtime.

use serde_json::json;

use conductor::core::task::{
    CollaborationSpec, CollaborationStrategy, Quorum, StatusKind, TaskSpec,
};
use conductor::events::OrchestratorEvent;
use conductor::state::TaskFilter;

use crate::fixtures::{test_config, RuntimeHarness, Step};

/// Test: Parallel collaboration with quorum
/// Given three agents and a parallel task with majority quorum
/// When two participants succeed and one fails
/// Then the task completes with both results and the failure recorded
#[tokio::test]
async fn test_parallel_three_agents_majority_quorum() {
    let mut h = RuntimeHarness::new(test_config());
    for name in ["a", "b", "c"] {
        h.agent(name, 1).await;
    }
    h.executor.script(
        "survey",
        vec![
            Step::success(json!("left")),
            Step::error("crashed"),
            Step::success(json!("right")),
        ],
    );

    let sub = h
        .handle
        .submit(
            TaskSpec::new("survey")
                .with_collaboration(CollaborationSpec::new(CollaborationStrategy::Parallel, 3)),
        )
        .await
        .unwrap();
    let id = sub.task.id;

    match h.wait_named(id, "session:opened").await {
        OrchestratorEvent::SessionOpened { participants, .. } => {
            assert_eq!(participants.len(), 3)
        }
        other => panic!("unexpected event: {:?}", other),
    }
    match h.wait_named(id, "task:completed").await {
        OrchestratorEvent::TaskCompleted { result, .. } => {
            assert_eq!(result["succeeded"], 2);
            assert_eq!(result["failed"], 1);
            assert_eq!(result["results"].as_object().unwrap().len(), 2);
            assert_eq!(result["errors"].as_object().unwrap().len(), 1);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    assert_eq!(h.executor.calls().len(), 3);
    let report = h.handle.capacity().await.unwrap();
    assert_eq!(report.used_capacity, 0, "every participant slot released");
}

/// Test: Quorum not met fails the task
#[tokio::test]
async fn test_parallel_quorum_failure() {
    let mut config = test_config();
    config.scheduler.max_retries = 0;
    let mut h = RuntimeHarness::new(config);
    h.agent("a", 1).await;
    h.agent("b", 1).await;
    h.executor.script(
        "strict",
        vec![Step::success(json!("ok")), Step::error("nope")],
    );

    let spec = TaskSpec::new("strict").with_collaboration(
        CollaborationSpec::new(CollaborationStrategy::Parallel, 2).with_quorum(Quorum::All),
    );
    let id = h.handle.submit(spec).await.unwrap().task.id;

    match h.wait_named(id, "session:closed").await {
        OrchestratorEvent::SessionClosed { success, .. } => assert!(!success),
        other => panic!("unexpected event: {:?}", other),
    }
    match h.wait_named(id, "task:failed").await {
        OrchestratorEvent::TaskFailed {
            error, will_retry, ..
        } => {
            assert!(!will_retry);
            assert!(error.contains("quorum"), "error was {}", error);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

/// Test: Consensus reaches agreement in one round
/// Given three voters answering rest, rest, grpc
/// When the majority policy evaluates the round
/// Then the decision is rest with two thirds agreement
#[tokio::test]
async fn test_consensus_majority_decision() {
    let mut h = RuntimeHarness::new(test_config());
    for name in ["a", "b", "c"] {
        h.agent(name, 1).await;
    }
    h.executor.script(
        "protocol",
        vec![
            Step::success(json!({ "answer": "rest" })),
            Step::success(json!({ "answer": "grpc" })),
            Step::success(json!({ "answer": "rest" })),
        ],
    );

    let spec = TaskSpec::new("protocol")
        .with_collaboration(CollaborationSpec::new(CollaborationStrategy::Consensus, 3));
    let id = h.handle.submit(spec).await.unwrap().task.id;

    match h.wait_named(id, "task:completed").await {
        OrchestratorEvent::TaskCompleted { result, .. } => {
            assert_eq!(result["decision"]["answer"], "rest");
            assert_eq!(result["rounds"], 1);
            let agreement = result["agreement"].as_f64().unwrap();
            assert!((agreement - 2.0 / 3.0).abs() < 1e-9);
        }
        other => panic!("unexpected event: {:?}", other),
    }
    let report = h.handle.capacity().await.unwrap();
    assert_eq!(report.used_capacity, 0, "held slots released after decision");
}

/// Test: Hierarchical collaboration spawns and aggregates children
/// Given a coordinator and two workers
/// When the plan has no explicit split
/// Then each worker runs one child and the coordinator aggregates
#[tokio::test]
async fn test_hierarchical_children_then_aggregate() {
    let mut h = RuntimeHarness::new(test_config());
    for name in ["lead", "w1", "w2"] {
        h.agent(name, 1).await;
    }
    h.executor.script(
        "feature",
        vec![
            Step::success(json!(null)),
            Step::success(json!({ "merged": true })),
        ],
    );

    let spec = TaskSpec::new("feature")
        .with_prompt("ship the feature")
        .with_collaboration(CollaborationSpec::new(
            CollaborationStrategy::Hierarchical,
            3,
        ));
    let id = h.handle.submit(spec).await.unwrap().task.id;

    match h.wait_named(id, "task:completed").await {
        OrchestratorEvent::TaskCompleted { result, .. } => {
            assert_eq!(result, json!({ "merged": true }))
        }
        other => panic!("unexpected event: {:?}", other),
    }

    let children = h
        .handle
        .tasks(TaskFilter::all().with_parent(id))
        .await
        .unwrap();
    assert_eq!(children.len(), 2);
    assert!(children
        .iter()
        .all(|c| c.status.kind() == StatusKind::Completed && c.prompt == "ship the feature"));
    let workers: std::collections::HashSet<_> =
        children.iter().filter_map(|c| c.assigned_agent).collect();
    assert_eq!(workers.len(), 2, "one child per worker");
}

/// Test: Sequential collaboration hands outputs down the chain
#[tokio::test]
async fn test_sequential_passes_previous_outputs() {
    let mut h = RuntimeHarness::new(test_config());
    h.agent("drafter", 1).await;
    h.agent("editor", 1).await;
    h.executor.script(
        "essay",
        vec![Step::success(json!("draft")), Step::success(json!("final"))],
    );

    let spec = TaskSpec::new("essay")
        .with_collaboration(CollaborationSpec::new(CollaborationStrategy::Sequential, 2));
    let id = h.handle.submit(spec).await.unwrap().task.id;

    match h.wait_named(id, "task:completed").await {
        OrchestratorEvent::TaskCompleted { result, .. } => assert_eq!(result, json!("final")),
        other => panic!("unexpected event: {:?}", other),
    }
    let calls = h.executor.calls();
    assert_eq!(calls.len(), 2);
    assert_ne!(calls[0].1, calls[1].1, "each agent takes one step");
}
