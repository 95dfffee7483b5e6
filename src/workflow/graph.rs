//! Step dependency graph.
//!
//! Derived from a workflow's steps and connections, never stored. Adjacency
//! lists keep declaration order so that every traversal (and therefore every
//! plan) is deterministic.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{Endpoint, GraphError, InvalidConnection};

use super::types::{Connection, Step};

/// Parent/child adjacency keyed by step id.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    ids: Vec<String>,
    children: HashMap<String, Vec<String>>,
    parents: HashMap<String, Vec<String>>,
}

impl Graph {
    /// Build the graph, rejecting connections whose endpoints are unknown.
    ///
    /// All invalid connections are reported together, not just the first.
    pub fn build(steps: &[Step], connections: &[Connection]) -> Result<Self, GraphError> {
        let ids = steps.iter().map(|s| s.id.clone()).collect::<Vec<_>>();
        Self::from_edges(
            ids,
            connections.iter().map(|c| {
                (
                    c.id.as_str(),
                    c.source_step_id.as_str(),
                    c.target_step_id.as_str(),
                )
            }),
        )
    }

    /// Build from bare ids and `(connection_id, source, target)` triples.
    pub fn from_edges<'a>(
        ids: Vec<String>,
        edges: impl IntoIterator<Item = (&'a str, &'a str, &'a str)>,
    ) -> Result<Self, GraphError> {
        let mut graph = Graph {
            children: HashMap::with_capacity(ids.len()),
            parents: HashMap::with_capacity(ids.len()),
            ids: Vec::with_capacity(ids.len()),
        };

        for id in ids {
            if graph.children.contains_key(&id) {
                return Err(GraphError::DuplicateStep(id));
            }
            graph.children.insert(id.clone(), Vec::new());
            graph.parents.insert(id.clone(), Vec::new());
            graph.ids.push(id);
        }

        let mut invalid = Vec::new();
        for (conn_id, source, target) in edges {
            let mut ok = true;
            if !graph.contains(source) {
                invalid.push(InvalidConnection {
                    connection_id: conn_id.to_string(),
                    endpoint: Endpoint::Source,
                    step_id: source.to_string(),
                });
                ok = false;
            }
            if !graph.contains(target) {
                invalid.push(InvalidConnection {
                    connection_id: conn_id.to_string(),
                    endpoint: Endpoint::Target,
                    step_id: target.to_string(),
                });
                ok = false;
            }
            if ok {
                graph.link(source, target);
            }
        }

        if !invalid.is_empty() {
            return Err(GraphError::InvalidConnections(invalid));
        }

        Ok(graph)
    }

    fn link(&mut self, source: &str, target: &str) {
        if let Some(children) = self.children.get_mut(source) {
            if !children.iter().any(|c| c == target) {
                children.push(target.to_string());
            }
        }
        if let Some(parents) = self.parents.get_mut(target) {
            if !parents.iter().any(|p| p == source) {
                parents.push(source.to_string());
            }
        }
    }

    /// Step ids in declaration order.
    pub fn step_ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.children.contains_key(id)
    }

    /// Direct parents, deduplicated, in connection order.
    pub fn parents(&self, id: &str) -> &[String] {
        self.parents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct children, deduplicated, in connection order.
    pub fn children(&self, id: &str) -> &[String] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Steps without parents.
    pub fn roots(&self) -> Vec<&str> {
        self.ids
            .iter()
            .filter(|id| self.parents(id).is_empty())
            .map(String::as_str)
            .collect()
    }

    /// Steps without children.
    pub fn sinks(&self) -> Vec<&str> {
        self.ids
            .iter()
            .filter(|id| self.children(id).is_empty())
            .map(String::as_str)
            .collect()
    }

    /// Kahn's algorithm.
    ///
    /// On failure the error lists the steps that sit on a cycle: steps that
    /// are only blocked behind a cycle (downstream of it) are pruned from the
    /// report.
    pub fn topological_sort(&self) -> Result<Vec<String>, GraphError> {
        let mut in_degree: HashMap<&str, usize> = self
            .ids
            .iter()
            .map(|id| (id.as_str(), self.parents(id).len()))
            .collect();

        let mut queue: VecDeque<&str> = self
            .ids
            .iter()
            .filter(|id| in_degree[id.as_str()] == 0)
            .map(String::as_str)
            .collect();

        let mut order = Vec::with_capacity(self.ids.len());
        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            for child in self.children(id) {
                if let Some(deg) = in_degree.get_mut(child.as_str()) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(child.as_str());
                    }
                }
            }
        }

        if order.len() == self.ids.len() {
            return Ok(order);
        }

        let mut remaining: HashSet<&str> = in_degree
            .into_iter()
            .filter(|(_, deg)| *deg > 0)
            .map(|(id, _)| id)
            .collect();

        // Peel off steps with no children left in the blocked set.
        loop {
            let leaves: Vec<&str> = remaining
                .iter()
                .copied()
                .filter(|id| !self.children(id).iter().any(|c| remaining.contains(c.as_str())))
                .collect();
            if leaves.is_empty() {
                break;
            }
            for leaf in leaves {
                remaining.remove(leaf);
            }
        }

        let cycle = self
            .ids
            .iter()
            .filter(|id| remaining.contains(id.as_str()))
            .cloned()
            .collect();
        Err(GraphError::CycleDetected(cycle))
    }

    /// Every step `id` transitively depends on (excluding `id`).
    pub fn upstream(&self, id: &str) -> HashSet<String> {
        self.reach(id, |g, n| g.parents(n))
    }

    /// Every step transitively depending on `id` (excluding `id`).
    pub fn downstream(&self, id: &str) -> HashSet<String> {
        self.reach(id, |g, n| g.children(n))
    }

    fn reach<'a, F>(&'a self, id: &str, next: F) -> HashSet<String>
    where
        F: Fn(&'a Graph, &str) -> &'a [String],
    {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = next(self, id).iter().map(String::as_str).collect();
        while let Some(n) = queue.pop_front() {
            if seen.insert(n.to_string()) {
                queue.extend(next(self, n).iter().map(String::as_str));
            }
        }
        seen
    }

    /// Would adding `source -> target` close a cycle?
    pub fn would_create_cycle(&self, source: &str, target: &str) -> bool {
        source == target || self.upstream(source).contains(target)
    }
}
