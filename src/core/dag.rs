//! Dependency graph for cycle detection at task creation.
//!
//! Nodes are task ids and an edge `a → b` means `b` depends on `a`.
//! Dependencies may name tasks that have not been created yet; those ids
//! get a placeholder node so that a later task closing the loop is still
//! caught.

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};

pub struct DependencyGraph {
    graph: DiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
    /// Ids that belong to created tasks (as opposed to forward references).
    created: HashSet<TaskId>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
            created: HashSet::new(),
        }
    }

    /// Rebuild a graph from already-validated `(id, dependencies)` pairs.
    pub fn from_tasks<'a, I>(tasks: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a TaskId, &'a [TaskId])>,
    {
        let mut dag = Self::new();
        for (id, deps) in tasks {
            dag.insert(id, deps)?;
        }
        Ok(dag)
    }

    fn node(&mut self, id: &TaskId) -> NodeIndex {
        if let Some(&idx) = self.index.get(id) {
            return idx;
        }
        let idx = self.graph.add_node(id.clone());
        self.index.insert(id.clone(), idx);
        idx
    }

    /// Add a task and its dependency edges.
    ///
    /// # Errors
    /// Returns `Error::Cycle` if `id` depends on itself, directly or through
    /// other tasks. The graph is left unchanged in that case.
    pub fn insert(&mut self, id: &TaskId, deps: &[TaskId]) -> Result<()> {
        if deps.contains(id) {
            return Err(Error::Cycle {
                id: id.clone(),
                path: format!("{} -> {}", id, id),
            });
        }

        let to = self.node(id);
        let mut added = Vec::with_capacity(deps.len());
        for dep in deps {
            let from = self.node(dep);
            if self.graph.find_edge(from, to).is_none() {
                added.push(self.graph.add_edge(from, to, ()));
            }
        }

        if is_cyclic_directed(&self.graph) {
            // Remove in reverse so edge indices stay valid.
            for edge in added.into_iter().rev() {
                self.graph.remove_edge(edge);
            }
            let path = deps
                .iter()
                .find_map(|dep| self.path(id, dep))
                .map(|p| {
                    p.iter()
                        .map(|t| t.to_string())
                        .collect::<Vec<_>>()
                        .join(" -> ")
                })
                .unwrap_or_else(|| id.to_string());
            return Err(Error::Cycle {
                id: id.clone(),
                path: format!("{} -> {}", path, id),
            });
        }

        self.created.insert(id.clone());
        Ok(())
    }

    /// Breadth-first path of dependents from `from` to `to`, inclusive.
    fn path(&self, from: &TaskId, to: &TaskId) -> Option<Vec<TaskId>> {
        let start = *self.index.get(from)?;
        let goal = *self.index.get(to)?;
        let mut prev: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        let mut seen = HashSet::from([start]);
        while let Some(node) = queue.pop_front() {
            if node == goal {
                let mut path = vec![self.graph[node].clone()];
                let mut cur = node;
                while let Some(&p) = prev.get(&cur) {
                    path.push(self.graph[p].clone());
                    cur = p;
                }
                path.reverse();
                return Some(path);
            }
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if seen.insert(next) {
                    prev.insert(next, node);
                    queue.push_back(next);
                }
            }
        }
        None
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.created.contains(id)
    }

    /// Tasks that list `id` as a dependency.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        match self.index.get(id) {
            Some(&idx) => self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .map(|n| self.graph[n].clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Dependency ids that do not belong to any created task yet.
    pub fn unresolved_references(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .index
            .keys()
            .filter(|id| !self.created.contains(*id))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Created tasks in an order where each comes after its dependencies.
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            Error::Validation(format!(
                "Cycle detected at task: {}",
                self.graph[cycle.node_id()]
            ))
        })?;
        Ok(sorted
            .into_iter()
            .map(|idx| self.graph[idx].clone())
            .filter(|id| self.created.contains(id))
            .collect())
    }

    pub fn task_count(&self) -> usize {
        self.created.len()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
