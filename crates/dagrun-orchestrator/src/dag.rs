//! Directed Acyclic Graph (DAG) of workflow steps

use crate::definition::StepDefinition;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DagValidationError {
    #[error("Cycle detected in workflow: {0}")]
    CycleDetected(String),

    #[error("Missing dependency: step {step} depends on {dependency} which does not exist")]
    MissingDependency { step: String, dependency: String },

    #[error("Empty workflow: no steps defined")]
    EmptyWorkflow,

    #[error("Duplicate step name: {0}")]
    DuplicateStep(String),

    #[error("Invalid step configuration: {0}")]
    InvalidStep(String),
}

/// Step graph of a workflow; edges point from a dependency to its dependent
#[derive(Debug, Clone)]
pub struct WorkflowDag {
    graph: DiGraph<String, ()>,
    step_to_node: HashMap<String, NodeIndex>,
}

impl WorkflowDag {
    /// Build and validate the graph for a set of steps
    pub fn new(steps: &[StepDefinition]) -> Result<Self, DagValidationError> {
        if steps.is_empty() {
            return Err(DagValidationError::EmptyWorkflow);
        }

        let mut graph = DiGraph::new();
        let mut step_to_node = HashMap::new();

        for step in steps {
            if step.name.trim().is_empty() {
                return Err(DagValidationError::InvalidStep(
                    "step name must not be empty".to_string(),
                ));
            }
            if step_to_node.contains_key(&step.name) {
                return Err(DagValidationError::DuplicateStep(step.name.clone()));
            }
            let node = graph.add_node(step.name.clone());
            step_to_node.insert(step.name.clone(), node);
        }

        for step in steps {
            let to_node = step_to_node[&step.name];

            for dep in &step.depends {
                let from_node = step_to_node.get(dep).ok_or_else(|| {
                    DagValidationError::MissingDependency {
                        step: step.name.clone(),
                        dependency: dep.clone(),
                    }
                })?;

                graph.add_edge(*from_node, to_node, ());
            }
        }

        let dag = Self { graph, step_to_node };
        dag.validate()?;

        Ok(dag)
    }

    /// Validate the DAG for cycles
    pub fn validate(&self) -> Result<(), DagValidationError> {
        if petgraph::algo::is_cyclic_directed(&self.graph) {
            return Err(DagValidationError::CycleDetected(self.find_cycle()));
        }

        Ok(())
    }

    fn find_cycle(&self) -> String {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();

        for node in self.graph.node_indices() {
            if let Some(mut cycle) = self.find_cycle_util(node, &mut visited, &mut rec_stack) {
                cycle.reverse();
                return cycle
                    .iter()
                    .map(|n| self.graph[*n].clone())
                    .collect::<Vec<_>>()
                    .join(" -> ");
            }
        }

        "unknown".to_string()
    }

    fn find_cycle_util(
        &self,
        node: NodeIndex,
        visited: &mut HashSet<NodeIndex>,
        rec_stack: &mut HashSet<NodeIndex>,
    ) -> Option<Vec<NodeIndex>> {
        if rec_stack.contains(&node) {
            return Some(vec![node]);
        }

        if !visited.insert(node) {
            return None;
        }
        rec_stack.insert(node);

        for neighbor in self.graph.neighbors_directed(node, Direction::Outgoing) {
            if let Some(mut cycle) = self.find_cycle_util(neighbor, visited, rec_stack) {
                cycle.push(node);
                return Some(cycle);
            }
        }

        rec_stack.remove(&node);
        None
    }

    /// Step names in execution order (dependencies before dependents)
    pub fn topological_sort(&self) -> Vec<String> {
        petgraph::algo::toposort(&self.graph, None)
            .map(|nodes| nodes.into_iter().map(|n| self.graph[n].clone()).collect())
            .unwrap_or_default()
    }

    /// Every step reachable downstream of `step`, in execution order
    pub fn descendants(&self, step: &str) -> Vec<String> {
        let Some(&start) = self.step_to_node.get(step) else {
            return Vec::new();
        };

        let mut reachable = HashSet::new();
        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(node) = dfs.next(&self.graph) {
            if node != start {
                reachable.insert(self.graph[node].clone());
            }
        }

        self.topological_sort()
            .into_iter()
            .filter(|name| reachable.contains(name))
            .collect()
    }

    pub fn contains(&self, step: &str) -> bool {
        self.step_to_node.contains_key(step)
    }

    pub fn len(&self) -> usize {
        self.step_to_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.step_to_node.is_empty()
    }
}
