//! Bounded parallel execution of phase batches.
//!
//! All operations of all phases in a batch run concurrently under a single
//! semaphore, so the concurrency limit is global to the run rather than
//! per phase. Failures are isolated: one operation failing never tears
//! down its siblings; every phase in the batch reaches its own outcome.

use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::core::{PhaseDefinition, PhaseId};
use crate::error::{Error, Result};
use crate::orchestration::breaker::BreakerRegistry;
use crate::orchestration::runner::{OperationContext, OperationRegistry};
use crate::rlog_debug;
use crate::workflow::{Checkpoint, OperationResult};

/// One phase scheduled into a batch, together with the payloads of its
/// already-completed dependencies.
#[derive(Debug, Clone)]
pub struct PhaseExecution {
    pub definition: PhaseDefinition,
    pub inputs: HashMap<PhaseId, Value>,
}

/// Outcome of running one batch.
#[derive(Debug)]
pub struct BatchResult {
    /// Checkpoints for phases that reached a terminal outcome.
    pub checkpoints: Vec<Checkpoint>,
    /// True if the run was cancelled mid-batch. Phases interrupted by the
    /// cancellation contribute no checkpoint and rerun on resume.
    pub cancelled: bool,
}

/// Executes batches of phases with bounded concurrency.
pub struct ParallelExecutor {
    operations: Arc<OperationRegistry>,
    breakers: Arc<BreakerRegistry>,
    semaphore: Arc<Semaphore>,
}

impl ParallelExecutor {
    pub fn new(
        operations: Arc<OperationRegistry>,
        breakers: Arc<BreakerRegistry>,
        concurrency_limit: usize,
    ) -> Self {
        Self {
            operations,
            breakers,
            semaphore: Arc::new(Semaphore::new(concurrency_limit.max(1))),
        }
    }

    /// Run every phase in the batch to completion and return one checkpoint
    /// per phase, in the batch's phase order.
    pub async fn run_batch(
        &self,
        batch: Vec<PhaseExecution>,
        cancel: &CancellationToken,
    ) -> BatchResult {
        let phase_futures = batch
            .into_iter()
            .map(|execution| self.run_phase(execution, cancel.clone()));

        let outcomes = join_all(phase_futures).await;

        let mut checkpoints = Vec::new();
        let mut cancelled = false;
        for outcome in outcomes {
            match outcome {
                Some(checkpoint) => checkpoints.push(checkpoint),
                None => cancelled = true,
            }
        }
        BatchResult {
            checkpoints,
            cancelled,
        }
    }

    /// Run all operations of one phase concurrently and fold their results
    /// into a single checkpoint. Returns `None` if the phase was
    /// interrupted by cancellation.
    async fn run_phase(
        &self,
        execution: PhaseExecution,
        cancel: CancellationToken,
    ) -> Option<Checkpoint> {
        let phase = execution.definition;
        let phase_id = phase.id.clone();
        let inputs = Arc::new(execution.inputs);

        let op_futures = phase.operations.iter().map(|op| {
            let ctx = OperationContext {
                phase_id: phase_id.clone(),
                class: op.class.clone(),
                params: op.params.clone(),
                inputs: (*inputs).clone(),
                cancel: cancel.clone(),
            };
            self.run_operation(ctx, phase.timeout())
        });

        let results = join_all(op_futures).await;

        let mut interrupted = false;
        let mut op_results: Vec<OperationResult> = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Some(r) => op_results.push(r),
                None => interrupted = true,
            }
        }
        if interrupted {
            rlog_debug!("Phase '{}' interrupted by cancellation", phase_id);
            return None;
        }

        let duration_ms = op_results.iter().map(|r| r.duration_ms).max().unwrap_or(0);
        if op_results.iter().all(OperationResult::is_success) {
            let payload = fold_payloads(&mut op_results);
            Some(Checkpoint::success(phase_id, payload, duration_ms))
        } else {
            let errors: Vec<String> = op_results
                .iter()
                .filter_map(|r| r.error.clone())
                .collect();
            Some(Checkpoint::failure(phase_id, errors.join("; "), duration_ms))
        }
    }

    /// Run one operation under a semaphore permit, breaker protection, and
    /// the phase timeout. Returns `None` on cancellation.
    async fn run_operation(
        &self,
        ctx: OperationContext,
        timeout: Option<std::time::Duration>,
    ) -> Option<OperationResult> {
        let phase_id = ctx.phase_id.clone();
        let class = ctx.class.clone();
        let start = Instant::now();

        let permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => permit,
            _ = ctx.cancel.cancelled() => return None,
        };
        // Semaphore is never closed while the executor is alive
        let _permit = permit.ok()?;

        let runner = match self.operations.resolve(&class) {
            Ok(runner) => runner,
            Err(e) => {
                return Some(OperationResult::failure(
                    phase_id,
                    e.to_string(),
                    elapsed_ms(start),
                ));
            }
        };

        let breaker = self.breakers.breaker_for(&class);
        let cancel = ctx.cancel.clone();
        let fallback_ctx = ctx.clone();

        let guarded = breaker.call(|| async {
            let work = runner.run(ctx);
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, work).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout(limit)),
                },
                None => work.await,
            }
        });

        let result = tokio::select! {
            result = guarded => result,
            _ = cancel.cancelled() => return None,
        };

        let duration_ms = elapsed_ms(start);
        match result {
            Ok(payload) => Some(OperationResult::success(phase_id, payload, duration_ms)),
            Err(Error::Cancelled) => None,
            Err(Error::CircuitOpen { class }) => {
                // Degraded mode: substitute the registered fallback payload
                if let Some(provider) = self.operations.fallback_for(&class) {
                    if let Some(payload) = provider.fallback(&fallback_ctx) {
                        rlog_debug!(
                            "Phase '{}' using fallback payload for open circuit '{}'",
                            phase_id,
                            class
                        );
                        return Some(OperationResult::success(
                            phase_id, payload, duration_ms,
                        ));
                    }
                }
                Some(OperationResult::failure(
                    phase_id,
                    Error::CircuitOpen { class }.to_string(),
                    duration_ms,
                ))
            }
            Err(e) => Some(OperationResult::failure(
                phase_id,
                e.to_string(),
                duration_ms,
            )),
        }
    }
}

impl std::fmt::Debug for ParallelExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelExecutor")
            .field("available_permits", &self.semaphore.available_permits())
            .finish()
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// A single-operation phase keeps its payload as-is; multi-operation
/// phases store an array in operation order.
fn fold_payloads(results: &mut [OperationResult]) -> Value {
    if results.len() == 1 {
        results[0].payload.take().unwrap_or(Value::Null)
    } else {
        Value::Array(
            results
                .iter_mut()
                .map(|r| r.payload.take().unwrap_or(Value::Null))
                .collect(),
        )
    }
}
