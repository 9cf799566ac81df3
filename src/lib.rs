pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod state;
pub mod workflow;

pub use config::Config;
pub use core::{DependencyGraph, OperationRef, PhaseDefinition, PhaseId, WorkflowDefinition};
pub use error::{Error, Result};
pub use orchestration::{
    BreakerConfig, BreakerRegistry, OperationRegistry, ShellRunner, WorkflowEvent,
    WorkflowOrchestrator,
};
pub use state::StateStore;
pub use workflow::{WorkflowId, WorkflowResult, WorkflowState, WorkflowStatus};
