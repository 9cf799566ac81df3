//! Workflow definition data model.
//!
//! A `WorkflowDefinition` is the caller's description of a workflow: named
//! phases, the operations each phase runs, and the dependency edges between
//! phases. Definitions are validated once (by `DependencyGraph::build`) and
//! treated as immutable afterwards.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;

use crate::error::{Error, Result};

/// Identifier for a phase, unique within one workflow definition.
///
/// Phase ids are declared by the caller (e.g. "research", "specify") and
/// referenced by `depends_on` edges, so they are strings rather than
/// generated UUIDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhaseId(pub String);

impl PhaseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PhaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PhaseId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Reference to one operation executed by a phase.
///
/// The `class` names an entry in the `OperationRegistry`; `params` is an
/// opaque payload handed to the resolved `OperationRunner`. The orchestrator
/// never inspects `params`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRef {
    /// Operation class identifier (e.g. "shell", "external-research-api").
    pub class: String,
    /// Opaque parameters for the operation runner.
    #[serde(default)]
    pub params: Value,
}

impl OperationRef {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            params: Value::Null,
        }
    }

    pub fn with_params(class: impl Into<String>, params: Value) -> Self {
        Self {
            class: class.into(),
            params,
        }
    }
}

/// A single phase in a workflow definition.
///
/// A phase with multiple operations executes them in parallel internally;
/// the phase completes when all of its operations have settled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseDefinition {
    /// Unique id within the definition.
    pub id: PhaseId,
    /// One or more operations this phase runs.
    pub operations: Vec<OperationRef>,
    /// Ids of phases that must complete before this phase starts.
    #[serde(default)]
    pub depends_on: Vec<PhaseId>,
    /// Per-operation timeout in seconds; a timed-out operation fails the phase.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl PhaseDefinition {
    /// Create a phase running a single operation with no dependencies.
    pub fn new(id: impl Into<PhaseId>, operation: OperationRef) -> Self {
        Self {
            id: id.into(),
            operations: vec![operation],
            depends_on: Vec::new(),
            timeout_secs: None,
        }
    }

    /// Add a dependency edge to this phase.
    pub fn depends_on(mut self, id: impl Into<PhaseId>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    /// Set the per-operation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    /// Add another parallel operation to this phase.
    pub fn with_operation(mut self, operation: OperationRef) -> Self {
        self.operations.push(operation);
        self
    }

    /// The timeout as a `Duration`, if one was declared.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// A complete workflow definition: named, ordered collection of phases.
///
/// Declaration order matters only for determinism: phases that are otherwise
/// unordered are scheduled in declaration order so repeated runs of the same
/// definition produce identical batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Human-readable workflow name.
    pub name: String,
    /// The phases of this workflow, in declaration order.
    pub phases: Vec<PhaseDefinition>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phases: Vec::new(),
        }
    }

    /// Add a phase to the definition.
    pub fn with_phase(mut self, phase: PhaseDefinition) -> Self {
        self.phases.push(phase);
        self
    }

    /// Look up a phase by id.
    pub fn phase(&self, id: &PhaseId) -> Option<&PhaseDefinition> {
        self.phases.iter().find(|p| &p.id == id)
    }

    /// Number of phases in the definition.
    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }

    /// Structural validation, independent of graph shape.
    ///
    /// Rejects empty definitions, duplicate phase ids, phases without
    /// operations, self-dependencies, and `depends_on` references to
    /// undeclared ids. Cycle detection is the graph's job, not the
    /// definition's.
    pub fn validate(&self) -> Result<()> {
        if self.phases.is_empty() {
            return Err(Error::EmptyDefinition);
        }

        let mut seen: HashSet<&PhaseId> = HashSet::new();
        for phase in &self.phases {
            if !seen.insert(&phase.id) {
                return Err(Error::Validation(format!(
                    "Duplicate phase id: {}",
                    phase.id
                )));
            }
            if phase.operations.is_empty() {
                return Err(Error::Validation(format!(
                    "Phase {} declares no operations",
                    phase.id
                )));
            }
        }

        for phase in &self.phases {
            for dep in &phase.depends_on {
                if dep == &phase.id {
                    return Err(Error::Validation(format!(
                        "Phase {} depends on itself",
                        phase.id
                    )));
                }
                if !seen.contains(dep) {
                    return Err(Error::UndeclaredDependency {
                        phase: phase.id.to_string(),
                        dependency: dep.to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}
