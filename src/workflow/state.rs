//! Workflow run state with status transition validation.
//!
//! This module provides `WorkflowState`, the persisted record of a workflow
//! run: its lifecycle status plus one checkpoint per phase that has reached
//! a terminal outcome. The checkpoint map is a `BTreeMap` so serialized
//! state is byte-stable for a given run, which the integrity checksum
//! depends on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::core::PhaseId;
use crate::error::{Error, Result};

use super::types::{OperationStatus, WorkflowId, WorkflowStatus};

/// Version written into every state file. Bumped on incompatible layout
/// changes so old files can be recognized.
pub const STATE_VERSION: u32 = 1;

/// Outcome of a single operation execution, as returned by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    /// The phase this operation belonged to.
    pub phase_id: PhaseId,
    /// Terminal outcome of the operation.
    pub status: OperationStatus,
    /// Output payload on success.
    pub payload: Option<Value>,
    /// Error description on failure.
    pub error: Option<String>,
    /// Wall-clock execution time in milliseconds.
    pub duration_ms: u64,
}

impl OperationResult {
    /// Build a success result carrying the operation's payload.
    pub fn success(phase_id: PhaseId, payload: Value, duration_ms: u64) -> Self {
        Self {
            phase_id,
            status: OperationStatus::Success,
            payload: Some(payload),
            error: None,
            duration_ms,
        }
    }

    /// Build a failure result carrying the error description.
    pub fn failure(phase_id: PhaseId, error: String, duration_ms: u64) -> Self {
        Self {
            phase_id,
            status: OperationStatus::Failed,
            payload: None,
            error: Some(error),
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OperationStatus::Success
    }
}

/// Durable record of one phase's terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The phase this checkpoint records.
    pub phase_id: PhaseId,
    /// Terminal outcome of the phase.
    pub status: OperationStatus,
    /// Combined output payload on success. A phase with a single operation
    /// stores that operation's payload directly; a multi-operation phase
    /// stores an array of payloads in operation order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Error description on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock execution time in milliseconds. Zero for skipped phases.
    pub duration_ms: u64,
    /// When the checkpoint was recorded.
    pub completed_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Record a successful phase with its payload.
    pub fn success(phase_id: PhaseId, payload: Value, duration_ms: u64) -> Self {
        Self {
            phase_id,
            status: OperationStatus::Success,
            payload: Some(payload),
            error: None,
            duration_ms,
            completed_at: Utc::now(),
        }
    }

    /// Record a failed phase with its error description.
    pub fn failure(phase_id: PhaseId, error: String, duration_ms: u64) -> Self {
        Self {
            phase_id,
            status: OperationStatus::Failed,
            payload: None,
            error: Some(error),
            duration_ms,
            completed_at: Utc::now(),
        }
    }

    /// Record a phase that never ran because an upstream dependency failed.
    pub fn skipped(phase_id: PhaseId, cause: &PhaseId) -> Self {
        Self {
            phase_id,
            status: OperationStatus::Skipped,
            payload: None,
            error: Some(format!("Upstream phase '{}' failed", cause)),
            duration_ms: 0,
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OperationStatus::Success
    }
}

/// Persisted state of a workflow run.
///
/// One state file per run. The `checksum` field holds a SHA-256 hex digest
/// of the serialized state with `checksum` itself set to the empty string;
/// the store recomputes and verifies it on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    /// State file layout version.
    pub version: u32,
    /// Unique id of this run.
    pub workflow_id: WorkflowId,
    /// Name of the definition this run was started from.
    pub definition_name: String,
    /// Current lifecycle status.
    pub status: WorkflowStatus,
    /// One checkpoint per phase that has reached a terminal outcome.
    pub checkpoints: BTreeMap<PhaseId, Checkpoint>,
    /// When the run was started.
    pub started_at: DateTime<Utc>,
    /// When the state was last written.
    pub last_updated_at: DateTime<Utc>,
    /// SHA-256 hex digest for corruption detection. Empty while in memory.
    #[serde(default)]
    pub checksum: String,
}

impl WorkflowState {
    /// Create fresh state for a new run, already in `Running` status.
    pub fn new(workflow_id: WorkflowId, definition_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            workflow_id,
            definition_name: definition_name.into(),
            status: WorkflowStatus::Running,
            checkpoints: BTreeMap::new(),
            started_at: now,
            last_updated_at: now,
            checksum: String::new(),
        }
    }

    /// Check if a transition to the target status is valid from the current one.
    ///
    /// Valid transitions:
    /// - Running -> Paused, Completed, or Failed
    /// - Paused -> Running (resume)
    ///
    /// Completed and Failed are terminal.
    pub fn can_transition(&self, target: WorkflowStatus) -> bool {
        matches!(
            (self.status, target),
            (WorkflowStatus::Running, WorkflowStatus::Paused)
                | (WorkflowStatus::Running, WorkflowStatus::Completed)
                | (WorkflowStatus::Running, WorkflowStatus::Failed)
                | (WorkflowStatus::Paused, WorkflowStatus::Running)
        )
    }

    /// Attempt to transition the run to a new status.
    ///
    /// Returns an error if the transition is not valid according to
    /// the lifecycle rules.
    pub fn transition(&mut self, target: WorkflowStatus) -> Result<()> {
        if !self.can_transition(target) {
            return Err(Error::InvalidStatusTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }

        self.status = target;
        self.last_updated_at = Utc::now();
        Ok(())
    }

    /// Record a phase checkpoint, replacing any previous record for that phase.
    pub fn record_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.checkpoints
            .insert(checkpoint.phase_id.clone(), checkpoint);
        self.last_updated_at = Utc::now();
    }

    /// Whether a phase already has a successful checkpoint.
    pub fn is_phase_completed(&self, phase_id: &PhaseId) -> bool {
        self.checkpoints
            .get(phase_id)
            .is_some_and(|c| c.is_success())
    }

    /// Persisted payload of a successfully completed phase, if any.
    pub fn phase_payload(&self, phase_id: &PhaseId) -> Option<&Value> {
        self.checkpoints
            .get(phase_id)
            .filter(|c| c.is_success())
            .and_then(|c| c.payload.as_ref())
    }

    /// Whether the run is in a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            WorkflowStatus::Completed | WorkflowStatus::Failed
        )
    }

    /// Count of checkpoints with the given status.
    pub fn count_with_status(&self, status: OperationStatus) -> usize {
        self.checkpoints
            .values()
            .filter(|c| c.status == status)
            .count()
    }
}

/// Summary of a finished (or paused) run, returned by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    /// Id of the run.
    pub workflow_id: WorkflowId,
    /// Final status of the run.
    pub status: WorkflowStatus,
    /// Phases that completed successfully, in completion order.
    pub completed_phases: Vec<PhaseId>,
    /// Phases that failed.
    pub failed_phases: Vec<PhaseId>,
    /// Phases skipped due to upstream failures.
    pub skipped_phases: Vec<PhaseId>,
    /// Total wall-clock time of this invocation in milliseconds.
    pub duration_ms: u64,
}

impl WorkflowResult {
    /// Build a result summary from the final persisted state.
    pub fn from_state(state: &WorkflowState, duration_ms: u64) -> Self {
        let mut completed_phases = Vec::new();
        let mut failed_phases = Vec::new();
        let mut skipped_phases = Vec::new();

        for (id, checkpoint) in &state.checkpoints {
            match checkpoint.status {
                OperationStatus::Success => completed_phases.push(id.clone()),
                OperationStatus::Failed => failed_phases.push(id.clone()),
                OperationStatus::Skipped => skipped_phases.push(id.clone()),
            }
        }

        Self {
            workflow_id: state.workflow_id,
            status: state.status,
            completed_phases,
            failed_phases,
            skipped_phases,
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }
}
