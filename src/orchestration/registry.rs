//! In-memory registry of live workflow runs.
//!
//! Execution state on disk covers crash recovery; this registry covers the
//! happy path inside one process: knowing which workflows are mid-flight
//! and delivering cancellation to them. An entry exists exactly while its
//! run is executing, so presence means running.

use std::collections::HashMap;
use std::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::rlog;
use crate::workflow::WorkflowId;

/// Tracks workflows currently executing in this process.
#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    runs: RwLock<HashMap<WorkflowId, CancellationToken>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn write_guard(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<WorkflowId, CancellationToken>> {
        match self.runs.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn read_guard(&self) -> std::sync::RwLockReadGuard<'_, HashMap<WorkflowId, CancellationToken>> {
        match self.runs.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a run and get its cancellation token.
    pub fn register(&self, id: WorkflowId) -> CancellationToken {
        let token = CancellationToken::new();
        self.write_guard().insert(id, token.clone());
        token
    }

    /// Whether the run is executing in this process.
    pub fn contains(&self, id: WorkflowId) -> bool {
        self.read_guard().contains_key(&id)
    }

    /// Request cooperative cancellation of a running workflow.
    pub fn cancel(&self, id: WorkflowId) -> Result<()> {
        let guard = self.read_guard();
        let token = guard
            .get(&id)
            .ok_or(Error::NotFound { workflow_id: id })?;
        rlog!("Cancellation requested for workflow {}", id.short());
        token.cancel();
        Ok(())
    }

    /// Drop a run's handle once it has finished.
    pub fn remove(&self, id: WorkflowId) {
        self.write_guard().remove(&id);
    }

    /// Ids of every run executing in this process.
    pub fn active(&self) -> Vec<WorkflowId> {
        self.read_guard().keys().copied().collect()
    }
}
