//! QF-006: Task graph assembly and topological ordering.
//!
//! Builds a DAG from explicit `depends_on` edges and computes a topological
//! order using Kahn's algorithm. Among ready tasks the one declared first in
//! `pipeline.yaml` goes first, so the order is stable across runs.

use super::error::GraphError;
use super::types::TaskDef;
use indexmap::IndexMap;
use std::collections::{BTreeSet, HashSet};

/// A task and its position in the declaration order.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub name: String,
    pub index: usize,
    pub def: TaskDef,
}

impl TaskNode {
    pub fn predecessors(&self) -> &[String] {
        &self.def.depends_on
    }
}

/// Validated, acyclic task graph.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    nodes: IndexMap<String, TaskNode>,
    successors: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl TaskGraph {
    /// Assemble a graph, rejecting unknown predecessors and cycles.
    pub fn build(tasks: &IndexMap<String, TaskDef>) -> Result<Self, GraphError> {
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); tasks.len()];
        let mut in_degree: Vec<usize> = vec![0; tasks.len()];

        for (index, (name, def)) in tasks.iter().enumerate() {
            for dep in &def.depends_on {
                let dep_index =
                    tasks
                        .get_index_of(dep)
                        .ok_or_else(|| GraphError::UnknownPredecessor {
                            task: name.clone(),
                            dependency: dep.clone(),
                        })?;
                successors[dep_index].push(index);
                in_degree[index] += 1;
            }
        }

        // Kahn's algorithm; the ready set yields the lowest declaration index first.
        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(tasks.len());
        while let Some(current) = ready.pop_first() {
            order.push(current);
            for &next in &successors[current] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() != tasks.len() {
            let ordered: HashSet<usize> = order.iter().copied().collect();
            let cycle_members = tasks
                .keys()
                .enumerate()
                .filter(|(i, _)| !ordered.contains(i))
                .map(|(_, name)| name.clone())
                .collect();
            return Err(GraphError::Cycle(cycle_members));
        }

        let nodes = tasks
            .iter()
            .enumerate()
            .map(|(index, (name, def))| {
                (
                    name.clone(),
                    TaskNode {
                        name: name.clone(),
                        index,
                        def: def.clone(),
                    },
                )
            })
            .collect();

        Ok(Self {
            nodes,
            successors,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, name: &str) -> Option<&TaskNode> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Task names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Every task in topological order.
    pub fn order(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter_map(|&i| self.nodes.get_index(i).map(|(name, _)| name.as_str()))
            .collect()
    }

    /// Direct successors of `name`, in declaration order.
    pub fn successors(&self, name: &str) -> Vec<&str> {
        let Some(index) = self.nodes.get_index_of(name) else {
            return Vec::new();
        };
        let mut next = self.successors[index].clone();
        next.sort_unstable();
        next.iter()
            .filter_map(|&i| self.nodes.get_index(i).map(|(n, _)| n.as_str()))
            .collect()
    }

    /// `target` and all of its ancestors, in topological order.
    pub fn schedule_for(&self, target: &str) -> Result<Vec<&TaskNode>, GraphError> {
        let start = self
            .nodes
            .get_index_of(target)
            .ok_or_else(|| GraphError::UnknownTask(target.to_string()))?;

        let mut wanted: HashSet<usize> = HashSet::new();
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            if !wanted.insert(current) {
                continue;
            }
            if let Some((_, node)) = self.nodes.get_index(current) {
                for dep in node.predecessors() {
                    if let Some(i) = self.nodes.get_index_of(dep) {
                        stack.push(i);
                    }
                }
            }
        }

        Ok(self
            .order
            .iter()
            .filter(|i| wanted.contains(*i))
            .filter_map(|&i| self.nodes.get_index(i).map(|(_, node)| node))
            .collect())
    }
}
