//! Core domain types: workflow definitions and the dependency graph.

pub mod definition;
pub mod graph;

pub use definition::{OperationRef, PhaseDefinition, PhaseId, WorkflowDefinition};
pub use graph::DependencyGraph;
