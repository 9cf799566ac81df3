//! Full workflow execution tests.

use crate::fixtures::*;
use relay::core::{OperationRef, PhaseDefinition, WorkflowDefinition};
use relay::error::Error;
use relay::orchestration::WorkflowEvent;
use relay::workflow::WorkflowStatus;

#[tokio::test]
async fn test_chain_executes_phases_in_dependency_order() {
    let runner = RecordingRunner::new();
    let harness = TestHarness::new(runner.clone());

    let result = harness
        .orchestrator
        .execute(&chain_definition())
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(runner.phases_run(), vec!["research", "specify", "plan"]);
}

#[tokio::test]
async fn test_chain_emits_three_singleton_batches() {
    let harness = TestHarness::new(RecordingRunner::new());
    harness
        .orchestrator
        .execute(&chain_definition())
        .await
        .unwrap();

    // Events arrive over a channel; give the sink task a beat to drain
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let batches: Vec<Vec<String>> = harness
        .recorded_events()
        .iter()
        .filter_map(|e| match e {
            WorkflowEvent::BatchStarted { phases, .. } => {
                Some(phases.iter().map(|p| p.to_string()).collect())
            }
            _ => None,
        })
        .collect();

    assert_eq!(
        batches,
        vec![
            vec!["research".to_string()],
            vec!["specify".to_string()],
            vec!["plan".to_string()],
        ]
    );
}

#[tokio::test]
async fn test_event_stream_covers_full_lifecycle() {
    let harness = TestHarness::new(RecordingRunner::new());
    let result = harness
        .orchestrator
        .execute(&chain_definition())
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let events = harness.recorded_events();

    assert!(matches!(
        events.first(),
        Some(WorkflowEvent::WorkflowStarted {
            total_phases: 3,
            ..
        })
    ));
    let completed = events
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::PhaseCompleted { .. }))
        .count();
    assert_eq!(completed, 3);
    assert!(matches!(
        events.last(),
        Some(WorkflowEvent::WorkflowCompleted { workflow_id, .. })
            if *workflow_id == result.workflow_id
    ));
}

#[tokio::test]
async fn test_failure_propagates_to_dependents_only() {
    let runner = SelectiveFailRunner::failing(&["left"]);
    let harness = TestHarness::new(runner.clone());

    let result = harness
        .orchestrator
        .execute(&diamond_definition())
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Failed);
    // root succeeded, right is independent of left and also succeeded
    assert_eq!(result.completed_phases.len(), 2);
    assert_eq!(result.failed_phases, vec!["left".into()]);
    assert_eq!(result.skipped_phases, vec!["merge".into()]);
    // merge never reached the runner
    assert_eq!(runner.call_count(), 3);
}

#[tokio::test]
async fn test_skip_events_emitted_for_dependents() {
    let harness = TestHarness::new(SelectiveFailRunner::failing(&["research"]));
    harness
        .orchestrator
        .execute(&chain_definition())
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let skipped: Vec<String> = harness
        .recorded_events()
        .iter()
        .filter_map(|e| match e {
            WorkflowEvent::PhaseSkipped { phase_id, .. } => Some(phase_id.to_string()),
            _ => None,
        })
        .collect();

    // Skipped dependents are recorded in sorted order
    assert_eq!(skipped, vec!["plan".to_string(), "specify".to_string()]);
}

#[tokio::test]
async fn test_cycle_is_rejected_before_any_execution() {
    let runner = RecordingRunner::new();
    let harness = TestHarness::new(runner.clone());

    let definition = WorkflowDefinition::new("cyclic")
        .with_phase(phase("a", &["b"]))
        .with_phase(phase("b", &["a"]));
    let err = harness.orchestrator.execute(&definition).await.unwrap_err();

    match err {
        Error::Cycle { phases } => {
            assert!(phases.contains(&"a".to_string()));
            assert!(phases.contains(&"b".to_string()));
        }
        other => panic!("Expected Cycle, got {:?}", other),
    }
    assert!(runner.phases_run().is_empty());
    assert!(harness.orchestrator.list().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_operation_class_rejected_before_execution() {
    let harness = TestHarness::new(RecordingRunner::new());
    let definition = WorkflowDefinition::new("bad")
        .with_phase(PhaseDefinition::new("a", OperationRef::new("teleport")));

    let err = harness.orchestrator.execute(&definition).await.unwrap_err();
    assert!(matches!(err, Error::UnknownOperationClass { ref class } if class == "teleport"));
}

#[tokio::test]
async fn test_status_and_list_after_run() {
    let harness = TestHarness::new(RecordingRunner::new());
    let result = harness
        .orchestrator
        .execute(&fan_in_definition())
        .await
        .unwrap();

    let report = harness.orchestrator.status(result.workflow_id).unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
    assert_eq!(report.completed, 3);
    assert_eq!(report.definition_name, "fan-in");

    let listed = harness.orchestrator.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].workflow_id, result.workflow_id);
}

#[tokio::test]
async fn test_delete_removes_run() {
    let harness = TestHarness::new(RecordingRunner::new());
    let result = harness
        .orchestrator
        .execute(&chain_definition())
        .await
        .unwrap();

    harness.orchestrator.delete(result.workflow_id).unwrap();
    assert!(matches!(
        harness.orchestrator.status(result.workflow_id),
        Err(Error::NotFound { .. })
    ));
    assert!(harness.orchestrator.list().unwrap().is_empty());
}

#[tokio::test]
async fn test_definition_loaded_from_toml() {
    let toml_src = r#"
name = "release"

[[phases]]
id = "build"

[[phases.operations]]
class = "op"
params = { target = "dist" }

[[phases]]
id = "publish"
depends_on = ["build"]
timeout_secs = 30

[[phases.operations]]
class = "op"
"#;

    let definition: WorkflowDefinition = toml::from_str(toml_src).unwrap();
    definition.validate().unwrap();

    let runner = RecordingRunner::new();
    let harness = TestHarness::new(runner.clone());
    let result = harness.orchestrator.execute(&definition).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(runner.phases_run(), vec!["build", "publish"]);
}
