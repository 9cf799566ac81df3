//! Dependency graph (DAG) for workflow phase ordering.
//!
//! This module provides the DependencyGraph structure that represents phase
//! dependencies as a directed acyclic graph, and groups phases into batches
//! that can execute in parallel.

use crate::core::definition::{PhaseId, WorkflowDefinition};
use crate::error::{Error, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet, VecDeque};

/// The phase dependency graph.
///
/// DependencyGraph uses petgraph's DiGraph to represent dependencies.
/// Nodes are phase ids; an edge from A to B means B depends on A. Nodes are
/// inserted in declaration order, which is what makes batch output
/// deterministic for a given definition.
pub struct DependencyGraph {
    /// The underlying directed graph.
    graph: DiGraph<PhaseId, ()>,
    /// Index mapping from PhaseId to NodeIndex for fast lookups.
    phase_index: HashMap<PhaseId, NodeIndex>,
}

impl DependencyGraph {
    /// Build a validated graph from a workflow definition.
    ///
    /// Runs the definition's structural validation first (empty definition,
    /// duplicate ids, undeclared or self dependencies), then verifies the
    /// graph is acyclic. Cycles are reported with the ids of every phase
    /// that could not be scheduled, so the caller gets an actionable
    /// diagnostic rather than just "cycle found".
    pub fn build(definition: &WorkflowDefinition) -> Result<Self> {
        definition.validate()?;

        let mut graph = DiGraph::new();
        let mut phase_index = HashMap::new();

        // Insertion order mirrors declaration order; batch tie-breaking
        // depends on it.
        for phase in &definition.phases {
            let index = graph.add_node(phase.id.clone());
            phase_index.insert(phase.id.clone(), index);
        }

        for phase in &definition.phases {
            let to = phase_index[&phase.id];
            for dep in &phase.depends_on {
                let from = phase_index[dep];
                graph.add_edge(from, to, ());
            }
        }

        let built = Self { graph, phase_index };

        // Kahn shortfall check: if the batch sweep emits fewer phases than
        // declared, the remainder forms at least one cycle.
        let scheduled: HashSet<PhaseId> =
            built.batches().into_iter().flatten().collect();
        if scheduled.len() < built.phase_count() {
            let stuck: Vec<String> = definition
                .phases
                .iter()
                .filter(|p| !scheduled.contains(&p.id))
                .map(|p| p.id.to_string())
                .collect();
            return Err(Error::Cycle { phases: stuck });
        }

        Ok(built)
    }

    /// Group phases into executable batches via Kahn's algorithm.
    ///
    /// Each batch contains only phases whose dependencies are all satisfied
    /// by strictly earlier batches, so phases within a batch have no
    /// dependency relationship, directly or transitively. Ties within a
    /// batch are broken by declaration order. O(V+E).
    ///
    /// On a cyclic graph this emits fewer phases than exist; `build`
    /// rejects that case before a graph ever reaches callers.
    pub fn batches(&self) -> Vec<Vec<PhaseId>> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|ix| {
                (
                    ix,
                    self.graph
                        .neighbors_directed(ix, petgraph::Direction::Incoming)
                        .count(),
                )
            })
            .collect();

        // node_indices() iterates in insertion order, i.e. declaration order
        let mut ready: VecDeque<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|ix| in_degree[ix] == 0)
            .collect();

        let mut batches = Vec::new();
        while !ready.is_empty() {
            let batch: Vec<NodeIndex> = ready.drain(..).collect();
            let mut next: Vec<NodeIndex> = Vec::new();

            for &ix in &batch {
                for dependent in self
                    .graph
                    .neighbors_directed(ix, petgraph::Direction::Outgoing)
                {
                    if let Some(degree) = in_degree.get_mut(&dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(dependent);
                        }
                    }
                }
            }

            // Restore declaration order for the next batch
            next.sort_unstable_by_key(|ix| ix.index());
            ready.extend(next);

            batches.push(
                batch
                    .into_iter()
                    .map(|ix| self.graph[ix].clone())
                    .collect(),
            );
        }

        batches
    }

    /// Direct dependencies of a phase (phases it waits on), in declaration order.
    pub fn dependencies_of(&self, id: &PhaseId) -> Vec<PhaseId> {
        let mut deps: Vec<NodeIndex> = match self.phase_index.get(id) {
            Some(&ix) => self
                .graph
                .neighbors_directed(ix, petgraph::Direction::Incoming)
                .collect(),
            None => Vec::new(),
        };
        deps.sort_unstable_by_key(|ix| ix.index());
        deps.into_iter().map(|ix| self.graph[ix].clone()).collect()
    }

    /// Direct dependents of a phase (phases waiting on it).
    pub fn dependents_of(&self, id: &PhaseId) -> Vec<PhaseId> {
        match self.phase_index.get(id) {
            Some(&ix) => self
                .graph
                .neighbors_directed(ix, petgraph::Direction::Outgoing)
                .map(|ix| self.graph[ix].clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// All phases reachable from `id` along dependency edges.
    ///
    /// Used for failure propagation: when a phase fails, its transitive
    /// dependents can never run.
    pub fn transitive_dependents(&self, id: &PhaseId) -> HashSet<PhaseId> {
        let mut reached = HashSet::new();
        let Some(&start) = self.phase_index.get(id) else {
            return reached;
        };

        let mut queue = VecDeque::from([start]);
        while let Some(ix) = queue.pop_front() {
            for dependent in self
                .graph
                .neighbors_directed(ix, petgraph::Direction::Outgoing)
            {
                if reached.insert(self.graph[dependent].clone()) {
                    queue.push_back(dependent);
                }
            }
        }
        reached
    }

    /// Whether the graph contains a phase.
    pub fn contains(&self, id: &PhaseId) -> bool {
        self.phase_index.contains_key(id)
    }

    /// Number of phases in the graph.
    pub fn phase_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of dependency edges in the graph.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("phases", &self.phase_count())
            .field("edges", &self.edge_count())
            .finish()
    }
}
