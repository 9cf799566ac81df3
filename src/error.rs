use thiserror::Error;

use crate::workflow::types::WorkflowId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Workflow definition has no phases")]
    EmptyDefinition,

    #[error("Phase {phase} depends on undeclared phase {dependency}")]
    UndeclaredDependency { phase: String, dependency: String },

    #[error("Dependency cycle involving phases: {}", phases.join(", "))]
    Cycle { phases: Vec<String> },

    #[error("Circuit open for operation class: {class}")]
    CircuitOpen { class: String },

    #[error("Operation class not registered: {class}")]
    UnknownOperationClass { class: String },

    #[error("Operation '{class}' failed: {message}")]
    Operation { class: String, message: String },

    #[error("Workflow state not found: {workflow_id}")]
    NotFound { workflow_id: WorkflowId },

    #[error("Workflow state corrupted (checksum mismatch): {workflow_id}")]
    Corruption { workflow_id: WorkflowId },

    #[error("Workflow {workflow_id} is locked by another run")]
    Conflict { workflow_id: WorkflowId },

    #[error("Workflow cancelled")]
    Cancelled,

    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

pub type Result<T> = std::result::Result<T, Error>;
