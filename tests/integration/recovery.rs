//! Checkpoint persistence, resume, and corruption handling.

use crate::fixtures::*;
use async_trait::async_trait;
use relay::core::PhaseId;
use relay::error::{Error, Result};
use relay::orchestration::{OperationContext, OperationRunner};
use relay::workflow::{WorkflowId, WorkflowStatus};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Fast for most phases, stalls on the named phase until cancelled.
struct StallRunner {
    stall_phase: String,
}

#[async_trait]
impl OperationRunner for StallRunner {
    async fn run(&self, ctx: OperationContext) -> Result<Value> {
        if ctx.phase_id.as_str() == self.stall_phase {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Ok(json!({"phase": ctx.phase_id.as_str()}))
    }
}

/// Drive the chain definition through batch 1, cancel during batch 2, and
/// return the paused workflow's id.
async fn pause_after_first_batch(harness: &TestHarness) -> WorkflowId {
    let store = harness.reopen_store();
    let definition = chain_definition();

    let orchestrator = &harness.orchestrator;
    let run = orchestrator.execute(&definition);
    tokio::pin!(run);

    // Poll until batch 1's checkpoint is durable, then cancel
    let workflow_id = loop {
        tokio::select! {
            _ = &mut run => panic!("run finished before cancellation"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {
                if let Some(id) = orchestrator.active_runs().first().copied() {
                    if let Ok(state) = store.load(id) {
                        if state.is_phase_completed(&PhaseId::new("research")) {
                            break id;
                        }
                    }
                }
            }
        }
    };
    orchestrator.cancel(workflow_id).unwrap();

    let result = run.await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Paused);
    workflow_id
}

#[tokio::test]
async fn test_resume_executes_only_remaining_batches() {
    let harness = TestHarness::new(Arc::new(StallRunner {
        stall_phase: "specify".to_string(),
    }));
    let workflow_id = pause_after_first_batch(&harness).await;

    // A fresh harness over the same state directory, as after a restart
    let runner = RecordingRunner::new();
    let resumed = TestHarness::over(harness.temp_dir, runner.clone());
    let result = resumed
        .orchestrator
        .resume(workflow_id, &chain_definition())
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.completed_phases.len(), 3);
    // Batch 1 must not rerun
    assert_eq!(runner.phases_run(), vec!["specify", "plan"]);
}

#[tokio::test]
async fn test_resume_preserves_earlier_payloads() {
    let harness = TestHarness::new(Arc::new(StallRunner {
        stall_phase: "specify".to_string(),
    }));
    let workflow_id = pause_after_first_batch(&harness).await;

    let resumed = TestHarness::over(harness.temp_dir, RecordingRunner::new());
    resumed
        .orchestrator
        .resume(workflow_id, &chain_definition())
        .await
        .unwrap();

    let state = resumed.reopen_store().load(workflow_id).unwrap();
    // Payload written before the pause survives resume untouched
    assert_eq!(
        state.phase_payload(&PhaseId::new("research")),
        Some(&json!({"phase": "research"}))
    );
    assert_eq!(state.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn test_resume_twice_is_idempotent() {
    let harness = TestHarness::new(Arc::new(StallRunner {
        stall_phase: "specify".to_string(),
    }));
    let workflow_id = pause_after_first_batch(&harness).await;

    let runner = RecordingRunner::new();
    let resumed = TestHarness::over(harness.temp_dir, runner.clone());
    resumed
        .orchestrator
        .resume(workflow_id, &chain_definition())
        .await
        .unwrap();
    let second = resumed
        .orchestrator
        .resume(workflow_id, &chain_definition())
        .await
        .unwrap();

    assert_eq!(second.status, WorkflowStatus::Completed);
    // The second resume ran nothing
    assert_eq!(runner.phases_run(), vec!["specify", "plan"]);
}

#[tokio::test]
async fn test_crashed_running_state_is_resumable() {
    // Simulate a process that died mid-run: state on disk still says
    // Running, with batch 1 checkpointed.
    let harness = TestHarness::new(RecordingRunner::new());
    let store = harness.reopen_store();

    let workflow_id = WorkflowId::new();
    let mut state = relay::workflow::WorkflowState::new(workflow_id, "chain");
    state.record_checkpoint(relay::workflow::Checkpoint::success(
        PhaseId::new("research"),
        json!({"phase": "research"}),
        5,
    ));
    let lock = store.lock(workflow_id).unwrap();
    store.save(&state, &lock).unwrap();
    drop(lock);

    let runner = RecordingRunner::new();
    let resumed = TestHarness::over(harness.temp_dir, runner.clone());
    let result = resumed
        .orchestrator
        .resume(workflow_id, &chain_definition())
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(runner.phases_run(), vec!["specify", "plan"]);
}

#[tokio::test]
async fn test_tampered_state_file_surfaces_corruption() {
    let harness = TestHarness::new(RecordingRunner::new());
    let result = harness
        .orchestrator
        .execute(&chain_definition())
        .await
        .unwrap();

    let path = harness
        .temp_dir
        .path()
        .join(format!("{}.json", result.workflow_id));
    let tampered = std::fs::read_to_string(&path)
        .unwrap()
        .replace("research", "resaerch");
    std::fs::write(&path, tampered).unwrap();

    let err = harness
        .orchestrator
        .resume(result.workflow_id, &chain_definition())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Corruption { .. }));
}

#[tokio::test]
async fn test_held_lock_blocks_concurrent_resume() {
    let harness = TestHarness::new(Arc::new(StallRunner {
        stall_phase: "specify".to_string(),
    }));
    let workflow_id = pause_after_first_batch(&harness).await;

    // Hold the lock as a concurrent writer would
    let store = harness.reopen_store();
    let _lock = store.lock(workflow_id).unwrap();

    let err = harness
        .orchestrator
        .resume(workflow_id, &chain_definition())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));
}

#[tokio::test]
async fn test_resume_reclaims_lock_left_by_dead_process() {
    // A SIGKILLed run never drops its StateLock; resuming afterwards
    // must not be fenced out by the leftover file.
    let harness = TestHarness::new(Arc::new(StallRunner {
        stall_phase: "specify".to_string(),
    }));
    let workflow_id = pause_after_first_batch(&harness).await;

    let dead_pid = std::process::Command::new("true")
        .spawn()
        .and_then(|mut child| {
            let pid = child.id();
            child.wait()?;
            Ok(pid)
        })
        .unwrap();
    std::fs::write(
        harness
            .temp_dir
            .path()
            .join(format!("{}.lock", workflow_id)),
        format!("{}\n", dead_pid),
    )
    .unwrap();

    let runner = RecordingRunner::new();
    let resumed = TestHarness::over(harness.temp_dir, runner.clone());
    let result = resumed
        .orchestrator
        .resume(workflow_id, &chain_definition())
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(runner.phases_run(), vec!["specify", "plan"]);
}

#[tokio::test]
async fn test_resume_unknown_workflow_is_not_found() {
    let harness = TestHarness::new(RecordingRunner::new());
    let err = harness
        .orchestrator
        .resume(WorkflowId::new(), &chain_definition())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn test_paused_run_reports_paused_status() {
    let harness = TestHarness::new(Arc::new(StallRunner {
        stall_phase: "specify".to_string(),
    }));
    let workflow_id = pause_after_first_batch(&harness).await;

    let report = harness.orchestrator.status(workflow_id).unwrap();
    assert_eq!(report.status, WorkflowStatus::Paused);
    assert_eq!(report.completed, 1);
}
