//! Workflow execution: runners, circuit breakers, the parallel batch
//! executor, and the orchestrator that drives them.

pub mod breaker;
pub mod executor;
pub mod orchestrator;
pub mod registry;
pub mod runner;

pub use breaker::{BreakerConfig, BreakerRegistry, CircuitBreaker, CircuitState};
pub use executor::{BatchResult, ParallelExecutor, PhaseExecution};
pub use orchestrator::{StatusReport, WorkflowEvent, WorkflowOrchestrator};
pub use registry::WorkflowRegistry;
pub use runner::{
    FallbackProvider, OperationContext, OperationRegistry, OperationRunner, ShellRunner,
};
