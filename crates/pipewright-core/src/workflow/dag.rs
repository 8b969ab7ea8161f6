//! Dependency graph construction, deterministic ordering, and cycle detection.
//!
//! Step ids are interned to node indices in declaration order, so a node's
//! index doubles as its tie-break rank. Ordering is Kahn's algorithm with a
//! min-heap over those ranks: whenever several steps are ready at once, the
//! one declared first runs first.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use pipewright_types::state::{StepStatus, WorkflowState};
use pipewright_types::workflow::{StepDefinition, WorkflowDefinition};

use super::definition::{validate_definition, WorkflowError};

// ---------------------------------------------------------------------------
// Step graph
// ---------------------------------------------------------------------------

/// Interned dependency graph over a workflow's steps.
///
/// Edges run from a dependency to its dependent.
#[derive(Debug)]
pub struct StepGraph<'a> {
    steps: &'a [StepDefinition],
    graph: DiGraph<&'a str, ()>,
    index: HashMap<&'a str, NodeIndex>,
}

impl<'a> StepGraph<'a> {
    /// Intern step ids and build edges from `depends_on`.
    pub fn build(def: &'a WorkflowDefinition) -> Result<Self, WorkflowError> {
        let steps = def.steps.as_slice();
        let mut graph = DiGraph::<&str, ()>::with_capacity(steps.len(), steps.len());
        let mut index = HashMap::with_capacity(steps.len());

        for step in steps {
            let node = graph.add_node(step.id.as_str());
            if index.insert(step.id.as_str(), node).is_some() {
                return Err(WorkflowError::ValidationError(format!(
                    "duplicate step ID: '{}'",
                    step.id
                )));
            }
        }

        for step in steps {
            let to = index[step.id.as_str()];
            for dep in &step.depends_on {
                let from = index.get(dep.as_str()).ok_or_else(|| {
                    WorkflowError::UnknownDependency(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    ))
                })?;
                graph.add_edge(*from, to, ());
            }
        }

        Ok(Self {
            steps,
            graph,
            index,
        })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Deterministic topological order, or the steps caught in a cycle.
    pub fn execution_order(&self) -> Result<Vec<&'a str>, WorkflowError> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|n| self.graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(Reverse(i)) = ready.pop() {
            let node = NodeIndex::new(i);
            order.push(self.graph[node]);
            for dependent in self.graph.neighbors_directed(node, Direction::Outgoing) {
                let d = &mut in_degree[dependent.index()];
                *d -= 1;
                if *d == 0 {
                    ready.push(Reverse(dependent.index()));
                }
            }
        }

        if order.len() < self.len() {
            return Err(WorkflowError::CycleDetected {
                steps: self.cycle_members(&in_degree),
            });
        }
        Ok(order)
    }

    /// Members of non-trivial strongly connected components among the
    /// unresolved nodes, in declaration order. Falls back to every
    /// unresolved node.
    fn cycle_members(&self, in_degree: &[usize]) -> Vec<String> {
        let unresolved = |n: &NodeIndex| in_degree[n.index()] > 0;

        let mut members: Vec<NodeIndex> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
            .flatten()
            .filter(unresolved)
            .collect();
        if members.is_empty() {
            members = self.graph.node_indices().filter(unresolved).collect();
        }
        members.sort();
        members
            .into_iter()
            .map(|n| self.graph[n].to_string())
            .collect()
    }

    /// Direct dependencies of `step_id`, in declaration order.
    pub fn dependencies(&self, step_id: &str) -> Vec<&'a str> {
        let Some(&node) = self.index.get(step_id) else {
            return Vec::new();
        };
        let mut deps: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .collect();
        deps.sort();
        deps.dedup();
        deps.into_iter().map(|n| self.graph[n]).collect()
    }

    /// Steps that are not `Completed` and whose dependencies all are, in
    /// declaration order.
    ///
    /// The sequential orchestrator only ever takes the first entry; a
    /// parallel scheduler would drain the whole set.
    pub fn ready_set(&self, state: &WorkflowState) -> Vec<&'a str> {
        let completed = |id: &str| state.step_status(id) == Some(StepStatus::Completed);
        self.steps
            .iter()
            .map(|s| s.id.as_str())
            .filter(|id| !completed(*id))
            .filter(|id| self.dependencies(*id).into_iter().all(completed))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

/// Validate that steps form a DAG (all references exist, no cycles).
pub fn validate_dag(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    StepGraph::build(def)?.execution_order().map(|_| ())
}

/// Validate `def` and compute its execution order.
///
/// The same definition always yields the same order.
pub fn resolve_execution_order(def: &WorkflowDefinition) -> Result<Vec<String>, WorkflowError> {
    validate_definition(def)?;
    let graph = StepGraph::build(def)?;
    Ok(graph
        .execution_order()?
        .into_iter()
        .map(String::from)
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
