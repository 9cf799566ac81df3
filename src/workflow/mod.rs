//! Workflow run state: identifiers, lifecycle statuses, and checkpoints.

pub mod state;
pub mod types;

pub use state::{Checkpoint, OperationResult, WorkflowResult, WorkflowState, STATE_VERSION};
pub use types::{OperationStatus, WorkflowId, WorkflowStatus};
