//! The workflow orchestrator.
//!
//! Ties everything together: builds the dependency graph for a definition,
//! walks its batches through the parallel executor, records checkpoints
//! into durable state after every batch, and emits progress events over an
//! mpsc channel so a front end can follow along without polling.
//!
//! Failure policy: a failed phase whose dependents have not yet run makes
//! the workflow fatal; each transitive dependent gets a `skipped`
//! checkpoint and execution stops after the current batch. A failed phase
//! with nothing downstream of it does not stop the run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::{DependencyGraph, PhaseId, WorkflowDefinition};
use crate::error::{Error, Result};
use crate::orchestration::breaker::BreakerRegistry;
use crate::orchestration::executor::{ParallelExecutor, PhaseExecution};
use crate::orchestration::registry::WorkflowRegistry;
use crate::orchestration::runner::OperationRegistry;
use crate::state::{StateLock, StateStore};
use crate::workflow::{
    Checkpoint, OperationStatus, WorkflowId, WorkflowResult, WorkflowState, WorkflowStatus,
};
use crate::{rlog, rlog_warn};

/// Progress events emitted during a run.
///
/// These events allow external components (like the CLI front end) to
/// react to workflow progress without polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowEvent {
    /// A run has started or resumed.
    WorkflowStarted {
        workflow_id: WorkflowId,
        definition_name: String,
        total_phases: usize,
    },
    /// A batch of independent phases is about to execute.
    BatchStarted {
        workflow_id: WorkflowId,
        batch_index: usize,
        phases: Vec<PhaseId>,
    },
    /// A phase completed successfully.
    PhaseCompleted {
        workflow_id: WorkflowId,
        phase_id: PhaseId,
        duration_ms: u64,
    },
    /// A phase failed.
    PhaseFailed {
        workflow_id: WorkflowId,
        phase_id: PhaseId,
        error: String,
    },
    /// A phase was skipped because an upstream dependency failed.
    PhaseSkipped {
        workflow_id: WorkflowId,
        phase_id: PhaseId,
    },
    /// The run finished with every phase successful.
    WorkflowCompleted {
        workflow_id: WorkflowId,
        duration_ms: u64,
    },
    /// The run finished with at least one failed phase.
    WorkflowFailed { workflow_id: WorkflowId },
    /// The run was cancelled and its state persisted for resume.
    WorkflowPaused { workflow_id: WorkflowId },
}

/// Point-in-time view of a run, servable for both live and finished runs.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub workflow_id: WorkflowId,
    pub definition_name: String,
    pub status: WorkflowStatus,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Drives workflow definitions to completion.
pub struct WorkflowOrchestrator {
    store: StateStore,
    executor: ParallelExecutor,
    runs: Arc<WorkflowRegistry>,
    operations: Arc<OperationRegistry>,
    event_tx: mpsc::Sender<WorkflowEvent>,
}

impl WorkflowOrchestrator {
    /// Create an orchestrator.
    ///
    /// # Arguments
    ///
    /// * `store` - Durable state storage for checkpoints
    /// * `operations` - Registry of executable operation classes
    /// * `breakers` - Per-class circuit breakers
    /// * `concurrency_limit` - Maximum operations in flight at once
    /// * `event_tx` - Channel for emitting progress events
    pub fn new(
        store: StateStore,
        operations: Arc<OperationRegistry>,
        breakers: Arc<BreakerRegistry>,
        concurrency_limit: usize,
        event_tx: mpsc::Sender<WorkflowEvent>,
    ) -> Self {
        let executor =
            ParallelExecutor::new(Arc::clone(&operations), breakers, concurrency_limit);
        Self {
            store,
            executor,
            runs: Arc::new(WorkflowRegistry::new()),
            operations,
            event_tx,
        }
    }

    async fn emit(&self, event: WorkflowEvent) {
        let _ = self.event_tx.send(event).await;
    }

    /// Start a fresh run of a definition and drive it to a terminal status
    /// (or to Paused if cancelled).
    pub async fn execute(&self, definition: &WorkflowDefinition) -> Result<WorkflowResult> {
        let graph = DependencyGraph::build(definition)?;
        self.operations.validate_definition(definition)?;

        let workflow_id = WorkflowId::new();
        let mut state = WorkflowState::new(workflow_id, &definition.name);
        let lock = self.store.lock(workflow_id)?;
        self.store.save(&state, &lock)?;

        rlog!(
            "Workflow {} started definition={} phases={}",
            workflow_id.short(),
            definition.name,
            definition.phase_count()
        );

        self.drive(definition, &graph, &mut state, &lock).await
    }

    /// Resume an interrupted run, executing only phases without a
    /// successful checkpoint. Completed runs are a no-op.
    pub async fn resume(
        &self,
        workflow_id: WorkflowId,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowResult> {
        let graph = DependencyGraph::build(definition)?;
        self.operations.validate_definition(definition)?;

        let mut state = self.store.load(workflow_id)?;
        match state.status {
            WorkflowStatus::Completed => {
                return Ok(WorkflowResult::from_state(&state, 0));
            }
            WorkflowStatus::Failed => {
                return Err(Error::InvalidStatusTransition {
                    from: state.status.to_string(),
                    to: WorkflowStatus::Running.to_string(),
                });
            }
            WorkflowStatus::Paused => {
                state.transition(WorkflowStatus::Running)?;
            }
            // A state file left in Running means the previous process died
            // mid-run; continue from its checkpoints.
            WorkflowStatus::Running => {}
        }

        // Failed checkpoints from a best-effort continue get retried
        state
            .checkpoints
            .retain(|_, checkpoint| checkpoint.is_success());

        let lock = self.store.lock(workflow_id)?;
        self.store.save(&state, &lock)?;

        rlog!(
            "Workflow {} resumed with {} completed phases",
            workflow_id.short(),
            state.count_with_status(OperationStatus::Success)
        );

        self.drive(definition, &graph, &mut state, &lock).await
    }

    /// The shared batch loop behind both `execute` and `resume`.
    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        graph: &DependencyGraph,
        state: &mut WorkflowState,
        lock: &StateLock,
    ) -> Result<WorkflowResult> {
        let workflow_id = state.workflow_id;
        let started = Instant::now();
        let cancel = self.runs.register(workflow_id);

        self.emit(WorkflowEvent::WorkflowStarted {
            workflow_id,
            definition_name: definition.name.clone(),
            total_phases: definition.phase_count(),
        })
        .await;

        let outcome = self
            .run_batches(definition, graph, state, lock, &cancel, started)
            .await;
        self.runs.remove(workflow_id);
        outcome?;

        Ok(WorkflowResult::from_state(state, elapsed_ms(started)))
    }

    async fn run_batches(
        &self,
        definition: &WorkflowDefinition,
        graph: &DependencyGraph,
        state: &mut WorkflowState,
        lock: &StateLock,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<()> {
        let workflow_id = state.workflow_id;
        let mut fatal_failure: Option<PhaseId> = None;

        for (batch_index, batch) in graph.batches().into_iter().enumerate() {
            let pending: Vec<PhaseId> = batch
                .into_iter()
                .filter(|id| !state.is_phase_completed(id))
                .collect();
            if pending.is_empty() {
                continue;
            }

            if cancel.is_cancelled() {
                return self.pause(state, lock).await;
            }

            self.emit(WorkflowEvent::BatchStarted {
                workflow_id,
                batch_index,
                phases: pending.clone(),
            })
            .await;

            let executions = self.prepare_batch(definition, graph, state, &pending)?;
            let result = self.executor.run_batch(executions, cancel).await;

            for checkpoint in result.checkpoints {
                match checkpoint.status {
                    OperationStatus::Success => {
                        self.emit(WorkflowEvent::PhaseCompleted {
                            workflow_id,
                            phase_id: checkpoint.phase_id.clone(),
                            duration_ms: checkpoint.duration_ms,
                        })
                        .await;
                    }
                    _ => {
                        self.emit(WorkflowEvent::PhaseFailed {
                            workflow_id,
                            phase_id: checkpoint.phase_id.clone(),
                            error: checkpoint.error.clone().unwrap_or_default(),
                        })
                        .await;

                        let has_pending_dependents = graph
                            .transitive_dependents(&checkpoint.phase_id)
                            .iter()
                            .any(|id| !state.is_phase_completed(id));
                        if has_pending_dependents && fatal_failure.is_none() {
                            fatal_failure = Some(checkpoint.phase_id.clone());
                        }
                    }
                }
                state.record_checkpoint(checkpoint);
            }

            if result.cancelled {
                self.store.save(state, lock)?;
                return self.pause(state, lock).await;
            }

            if let Some(failed_phase) = &fatal_failure {
                self.mark_skipped(graph, state, failed_phase).await;
                self.store.save(state, lock)?;
                break;
            }

            self.store.save(state, lock)?;
        }

        let failed = fatal_failure.is_some()
            || state.count_with_status(OperationStatus::Failed) > 0;
        if failed {
            state.transition(WorkflowStatus::Failed)?;
            self.store.save(state, lock)?;
            rlog_warn!("Workflow {} failed", workflow_id.short());
            self.emit(WorkflowEvent::WorkflowFailed { workflow_id }).await;
        } else {
            state.transition(WorkflowStatus::Completed)?;
            self.store.save(state, lock)?;
            rlog!("Workflow {} completed", workflow_id.short());
            self.emit(WorkflowEvent::WorkflowCompleted {
                workflow_id,
                duration_ms: elapsed_ms(started),
            })
            .await;
        }

        Ok(())
    }

    /// Build executions for the pending phases of a batch, wiring each
    /// phase's inputs from its dependencies' persisted payloads.
    fn prepare_batch(
        &self,
        definition: &WorkflowDefinition,
        graph: &DependencyGraph,
        state: &WorkflowState,
        pending: &[PhaseId],
    ) -> Result<Vec<PhaseExecution>> {
        pending
            .iter()
            .map(|id| {
                let phase = definition.phase(id).ok_or_else(|| {
                    Error::Validation(format!("Phase '{}' missing from definition", id))
                })?;

                let mut inputs = HashMap::new();
                for dep in graph.dependencies_of(id) {
                    if let Some(payload) = state.phase_payload(&dep) {
                        inputs.insert(dep, payload.clone());
                    }
                }

                Ok(PhaseExecution {
                    definition: phase.clone(),
                    inputs,
                })
            })
            .collect()
    }

    /// Record skipped checkpoints for every not-yet-finished transitive
    /// dependent of a failed phase.
    async fn mark_skipped(
        &self,
        graph: &DependencyGraph,
        state: &mut WorkflowState,
        failed_phase: &PhaseId,
    ) {
        let mut downstream: Vec<PhaseId> =
            graph.transitive_dependents(failed_phase).into_iter().collect();
        downstream.sort_unstable();

        for phase_id in downstream {
            if state.checkpoints.contains_key(&phase_id) {
                continue;
            }
            self.emit(WorkflowEvent::PhaseSkipped {
                workflow_id: state.workflow_id,
                phase_id: phase_id.clone(),
            })
            .await;
            state.record_checkpoint(Checkpoint::skipped(phase_id, failed_phase));
        }
    }

    async fn pause(&self, state: &mut WorkflowState, lock: &StateLock) -> Result<()> {
        state.transition(WorkflowStatus::Paused)?;
        self.store.save(state, lock)?;
        rlog!("Workflow {} paused", state.workflow_id.short());
        self.emit(WorkflowEvent::WorkflowPaused {
            workflow_id: state.workflow_id,
        })
        .await;
        Ok(())
    }

    /// Request cooperative cancellation of a running workflow.
    pub fn cancel(&self, workflow_id: WorkflowId) -> Result<()> {
        self.runs.cancel(workflow_id)
    }

    /// Ids of runs currently executing in this process.
    pub fn active_runs(&self) -> Vec<WorkflowId> {
        self.runs.active()
    }

    /// Status of a run. A run registered in this process is running by
    /// definition; otherwise durable state is authoritative.
    pub fn status(&self, workflow_id: WorkflowId) -> Result<StatusReport> {
        let state = self.store.load(workflow_id)?;
        let status = if self.runs.contains(workflow_id) {
            WorkflowStatus::Running
        } else {
            state.status
        };

        Ok(StatusReport {
            workflow_id,
            definition_name: state.definition_name.clone(),
            status,
            completed: state.count_with_status(OperationStatus::Success),
            failed: state.count_with_status(OperationStatus::Failed),
            skipped: state.count_with_status(OperationStatus::Skipped),
        })
    }

    /// Status reports for every persisted run. Unreadable state files are
    /// logged and skipped rather than failing the whole listing.
    pub fn list(&self) -> Result<Vec<StatusReport>> {
        let mut reports = Vec::new();
        for id in self.store.list()? {
            match self.status(id) {
                Ok(report) => reports.push(report),
                Err(e) => rlog_warn!("Skipping unreadable state for {}: {}", id.short(), e),
            }
        }
        reports.sort_by_key(|r| r.workflow_id.to_string());
        Ok(reports)
    }

    /// Delete a finished run's persisted state.
    pub fn delete(&self, workflow_id: WorkflowId) -> Result<()> {
        if self.runs.contains(workflow_id) {
            return Err(Error::Conflict { workflow_id });
        }
        self.store.delete(workflow_id)
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
