//! Dependency Graph Builder
//!
//! Turns a flat list of tasks with declared dependencies into a validated DAG,
//! then derives the execution plan:
//!
//! * **phases**: topological layering. Phase *k* holds every task whose
//!   dependencies all sit in phases `< k`, so each phase is the largest set of
//!   tasks that can safely run in parallel at that point.
//! * **critical path**: the most expensive chain of dependent tasks, weighted
//!   by `estimated_cost`. Used for ETA reporting only.
//!
//! Cycles are found with a three-color depth-first traversal before anything
//! is scheduled and reported as [`BulwarkError::CyclicDependency`].

use crate::core::errors::{BulwarkError, Result};
use crate::task::{Task, TaskId};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// A set of tasks with no dependency edges among them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub index: usize,
    pub tasks: Vec<TaskId>,
    /// Cost of the slowest task in the phase
    pub estimated_cost: f64,
}

impl Phase {
    pub fn is_parallel(&self) -> bool {
        self.tasks.len() > 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalPath {
    /// Entry task first, exit task last
    pub tasks: Vec<TaskId>,
    pub total_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub phases: Vec<Phase>,
    pub critical_path: CriticalPath,
    /// Sum over phases of the slowest task in each
    pub estimated_duration: f64,
    /// `min(1, 0.1 * tasks + 0.05 * edges)`
    pub complexity: f64,
    pub task_count: usize,
    pub edge_count: usize,
}

impl ExecutionPlan {
    pub fn phase_of(&self, task_id: &str) -> Option<usize> {
        self.phases
            .iter()
            .position(|p| p.tasks.iter().any(|t| t == task_id))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Validated task DAG. Edges point from a task to each of its dependencies.
#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
    costs: HashMap<TaskId, f64>,
    /// Dependencies before dependents
    topo_order: Vec<NodeIndex>,
}

impl DependencyGraph {
    pub fn build(tasks: &[Task]) -> Result<Self> {
        if tasks.is_empty() {
            return Err(BulwarkError::validation("workflow must contain at least one task"));
        }

        let mut graph = DiGraph::with_capacity(tasks.len(), tasks.len());
        let mut index = HashMap::with_capacity(tasks.len());
        let mut costs = HashMap::with_capacity(tasks.len());

        for task in tasks {
            if task.id.trim().is_empty() {
                return Err(BulwarkError::validation_field("task id cannot be empty", "id"));
            }
            if !task.estimated_cost.is_finite() || task.estimated_cost < 0.0 {
                return Err(BulwarkError::validation_field(
                    format!("task {} has invalid estimated cost {}", task.id, task.estimated_cost),
                    "estimated_cost",
                ));
            }
            if index.contains_key(&task.id) {
                return Err(BulwarkError::validation_field(
                    format!("duplicate task id {}", task.id),
                    "id",
                ));
            }
            let node = graph.add_node(task.id.clone());
            index.insert(task.id.clone(), node);
            costs.insert(task.id.clone(), task.estimated_cost);
        }

        for task in tasks {
            let from = index[&task.id];
            for dep in &task.dependencies {
                let to = index.get(dep).ok_or_else(|| {
                    BulwarkError::validation_field(
                        format!("task {} depends on unknown task {}", task.id, dep),
                        "dependencies",
                    )
                })?;
                graph.add_edge(from, *to, ());
            }
        }

        let mut dag = Self {
            graph,
            index,
            costs,
            topo_order: Vec::new(),
        };
        dag.topo_order = dag.check_acyclic()?;
        debug!(
            tasks = dag.graph.node_count(),
            edges = dag.graph.edge_count(),
            "Dependency graph validated"
        );
        Ok(dag)
    }

    fn sorted(&self, mut nodes: Vec<NodeIndex>) -> Vec<NodeIndex> {
        nodes.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
        nodes
    }

    fn dependencies_of(&self, node: NodeIndex) -> Vec<NodeIndex> {
        self.sorted(self.graph.neighbors_directed(node, Direction::Outgoing).collect())
    }

    /// Iterative three-color DFS. Returns nodes in post-order, which puts every
    /// dependency before its dependents.
    fn check_acyclic(&self) -> Result<Vec<NodeIndex>> {
        let mut color = vec![Color::White; self.graph.node_count()];
        let mut order = Vec::with_capacity(self.graph.node_count());
        let roots = self.sorted(self.graph.node_indices().collect());

        for root in roots {
            if color[root.index()] != Color::White {
                continue;
            }
            // (node, its dependencies, next dependency to visit)
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>, usize)> =
                vec![(root, self.dependencies_of(root), 0)];
            color[root.index()] = Color::Gray;

            while let Some((node, deps, next)) = stack.last_mut() {
                if *next == deps.len() {
                    color[node.index()] = Color::Black;
                    order.push(*node);
                    stack.pop();
                    continue;
                }
                let dep = deps[*next];
                *next += 1;
                match color[dep.index()] {
                    Color::White => {
                        color[dep.index()] = Color::Gray;
                        let dep_deps = self.dependencies_of(dep);
                        stack.push((dep, dep_deps, 0));
                    }
                    Color::Gray => {
                        let start = stack.iter().position(|(n, _, _)| *n == dep).unwrap_or(0);
                        let mut cycle: Vec<TaskId> = stack[start..]
                            .iter()
                            .map(|(n, _, _)| self.graph[*n].clone())
                            .collect();
                        cycle.push(self.graph[dep].clone());
                        return Err(BulwarkError::cyclic_dependency(
                            self.graph[dep].clone(),
                            cycle,
                        ));
                    }
                    Color::Black => {}
                }
            }
        }
        Ok(order)
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.index.contains_key(task_id)
    }

    /// Tasks that declare a dependency on `task_id`
    pub fn dependents(&self, task_id: &str) -> Vec<TaskId> {
        let Some(node) = self.index.get(task_id) else {
            return Vec::new();
        };
        self.sorted(self.graph.neighbors_directed(*node, Direction::Incoming).collect())
            .into_iter()
            .map(|n| self.graph[n].clone())
            .collect()
    }

    /// Topological layering into maximal parallel phases
    pub fn phases(&self) -> Vec<Phase> {
        let mut level: HashMap<NodeIndex, usize> = HashMap::with_capacity(self.topo_order.len());
        for node in &self.topo_order {
            let lvl = self
                .graph
                .neighbors_directed(*node, Direction::Outgoing)
                .map(|dep| level.get(&dep).copied().unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);
            level.insert(*node, lvl);
        }

        let depth = level.values().copied().max().map(|m| m + 1).unwrap_or(0);
        let mut buckets: Vec<Vec<TaskId>> = vec![Vec::new(); depth];
        for (node, lvl) in &level {
            buckets[*lvl].push(self.graph[*node].clone());
        }

        buckets
            .into_iter()
            .enumerate()
            .map(|(index, mut tasks)| {
                tasks.sort();
                let estimated_cost = tasks
                    .iter()
                    .map(|t| self.costs.get(t).copied().unwrap_or(0.0))
                    .fold(0.0, f64::max);
                Phase {
                    index,
                    tasks,
                    estimated_cost,
                }
            })
            .collect()
    }

    /// Longest cost-weighted chain from an entry task to an exit task.
    /// Ties prefer the lexicographically smaller task id.
    pub fn critical_path(&self) -> CriticalPath {
        let mut best: HashMap<NodeIndex, (f64, Option<NodeIndex>)> = HashMap::new();
        for node in &self.topo_order {
            let own = self.costs.get(&self.graph[*node]).copied().unwrap_or(0.0);
            let mut chosen: Option<(f64, NodeIndex)> = None;
            for dep in self.dependencies_of(*node) {
                let dist = best.get(&dep).map(|(d, _)| *d).unwrap_or(0.0);
                if chosen.map(|(d, _)| dist > d).unwrap_or(true) {
                    chosen = Some((dist, dep));
                }
            }
            let total = own + chosen.map(|(d, _)| d).unwrap_or(0.0);
            best.insert(*node, (total, chosen.map(|(_, n)| n)));
        }

        let mut end: Option<(f64, NodeIndex)> = None;
        for node in self.sorted(self.graph.node_indices().collect()) {
            let dist = best.get(&node).map(|(d, _)| *d).unwrap_or(0.0);
            if end.map(|(d, _)| dist > d).unwrap_or(true) {
                end = Some((dist, node));
            }
        }

        let Some((total_cost, last)) = end else {
            return CriticalPath {
                tasks: Vec::new(),
                total_cost: 0.0,
            };
        };
        let mut tasks = vec![self.graph[last].clone()];
        let mut cursor = best.get(&last).and_then(|(_, prev)| *prev);
        while let Some(node) = cursor {
            tasks.push(self.graph[node].clone());
            cursor = best.get(&node).and_then(|(_, prev)| *prev);
        }
        tasks.reverse();
        CriticalPath { tasks, total_cost }
    }

    pub fn plan(&self) -> ExecutionPlan {
        let phases = self.phases();
        let estimated_duration = phases.iter().map(|p| p.estimated_cost).sum();
        let task_count = self.task_count();
        let edge_count = self.edge_count();
        ExecutionPlan {
            critical_path: self.critical_path(),
            estimated_duration,
            complexity: (task_count as f64 * 0.1 + edge_count as f64 * 0.05).min(1.0),
            task_count,
            edge_count,
            phases,
        }
    }
}

/// Validate `tasks` and compute their execution plan in one step
pub fn build_plan(tasks: &[Task]) -> Result<ExecutionPlan> {
    Ok(DependencyGraph::build(tasks)?.plan())
}
