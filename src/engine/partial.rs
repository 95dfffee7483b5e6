//! Partial execution planning.
//!
//! A partial run executes only what a set of target steps needs. Steps with
//! a pinned output are not executed; they stay in the plan as data sources
//! feeding the steps that still run.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, GraphError, Result};
use crate::workflow::{Connection, Graph, Step};

/// Request for a partial run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialRun {
    /// Steps whose output is wanted
    pub targets: Vec<String>,
    /// Externally supplied outputs, keyed by step id
    #[serde(default)]
    pub pinned: HashMap<String, Value>,
}

impl PartialRun {
    pub fn new(targets: Vec<String>) -> Self {
        Self {
            targets,
            pinned: HashMap::new(),
        }
    }

    pub fn pin(mut self, step_id: impl Into<String>, output: Value) -> Self {
        self.pinned.insert(step_id.into(), output);
        self
    }

    pub fn pinned_ids(&self) -> HashSet<String> {
        self.pinned.keys().cloned().collect()
    }
}

/// Steps that must execute for `targets`, in topological order.
///
/// The union of every target and its upstream closure, minus pinned ids.
pub fn plan_subset(
    targets: &[String],
    steps: &[Step],
    connections: &[Connection],
    pinned: &HashSet<String>,
) -> Result<Vec<String>> {
    let graph = Graph::build(steps, connections)?;
    let order = graph.topological_sort()?;

    let mut wanted: HashSet<String> = HashSet::new();
    for target in targets {
        if !graph.contains(target) {
            return Err(GraphError::UnknownStep(target.clone()).into());
        }
        wanted.insert(target.clone());
        wanted.extend(graph.upstream(target));
    }

    Ok(order
        .into_iter()
        .filter(|id| wanted.contains(id) && !pinned.contains(id))
        .collect())
}

/// `from_id` and everything downstream of it, in topological order.
///
/// Re-running from a step only makes sense when that step's output is
/// supplied, so `from_id` must be pinned.
pub fn build_downstream(
    from_id: &str,
    steps: &[Step],
    connections: &[Connection],
    pinned: &HashSet<String>,
) -> Result<Vec<String>> {
    if !pinned.contains(from_id) {
        return Err(Error::NodeNotPinned(from_id.to_string()));
    }

    let graph = Graph::build(steps, connections)?;
    if !graph.contains(from_id) {
        return Err(GraphError::UnknownStep(from_id.to_string()).into());
    }
    let order = graph.topological_sort()?;

    let mut reach = graph.downstream(from_id);
    reach.insert(from_id.to_string());

    Ok(order.into_iter().filter(|id| reach.contains(id)).collect())
}

/// Connections that survive into a partial run: the target executes and the
/// source either executes or is pinned.
pub fn filter_connections(
    connections: &[Connection],
    execution_set: &HashSet<String>,
    pinned: &HashSet<String>,
) -> Vec<Connection> {
    connections
        .iter()
        .filter(|c| {
            execution_set.contains(&c.target_step_id)
                && (execution_set.contains(&c.source_step_id)
                    || pinned.contains(&c.source_step_id))
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> (Vec<Step>, Vec<Connection>) {
        let steps = ["a", "b", "c", "d"]
            .iter()
            .map(|id| Step::new(*id, "identity"))
            .collect();
        let connections = vec![
            Connection::new("a", "b"),
            Connection::new("a", "c"),
            Connection::new("b", "d"),
            Connection::new("c", "d"),
        ];
        (steps, connections)
    }

    fn set(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plan_subset_diamond() {
        let (steps, connections) = diamond();
        let plan = plan_subset(&["d".into()], &steps, &connections, &HashSet::new()).unwrap();
        assert_eq!(plan, vec!["a", "b", "c", "d"]);

        let plan = plan_subset(&["d".into()], &steps, &connections, &set(&["a"])).unwrap();
        assert_eq!(plan, vec!["b", "c", "d"]);
    }

    #[test]
    fn test_plan_subset_branch_only() {
        let (steps, connections) = diamond();
        let plan = plan_subset(&["b".into()], &steps, &connections, &HashSet::new()).unwrap();
        assert_eq!(plan, vec!["a", "b"]);
    }

    #[test]
    fn test_plan_subset_unknown_target() {
        let (steps, connections) = diamond();
        let err = plan_subset(&["zz".into()], &steps, &connections, &HashSet::new()).unwrap_err();
        assert!(matches!(err, Error::Graph(GraphError::UnknownStep(_))));
    }

    #[test]
    fn test_build_downstream_requires_pin() {
        let (steps, connections) = diamond();
        let err = build_downstream("b", &steps, &connections, &HashSet::new()).unwrap_err();
        assert!(matches!(err, Error::NodeNotPinned(ref id) if id == "b"));

        let ids = build_downstream("b", &steps, &connections, &set(&["b"])).unwrap();
        assert_eq!(ids, vec!["b", "d"]);
    }

    #[test]
    fn test_filter_connections_keeps_pinned_sources() {
        let (_, connections) = diamond();
        let kept = filter_connections(&connections, &set(&["b", "c", "d"]), &set(&["a"]));
        assert_eq!(kept.len(), 4);

        let kept = filter_connections(&connections, &set(&["d"]), &set(&["b"]));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].source_step_id, "b");
    }
}
