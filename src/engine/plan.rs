//! Plan compiler.
//!
//! Turns a validated step graph into an executable plan: every step gets a
//! node shape, multi-parent steps get a synthesized join (per item when the
//! join sits inside a fan-out), and predecessor/successor wiring is fixed. Shapes are computed once here
//! and read by the scheduler and the production counter for the rest of the
//! execution; nothing reclassifies a node mid-run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use super::partial::filter_connections;
use crate::error::{BuildError, Result};
use crate::nodes::{StepKind, StepRegistry};
use crate::workflow::{Connection, Graph, Step, Workflow};

/// How an aggregator receives its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceMode {
    /// Input arrives as one already collected list.
    Collected,
    /// Input arrives once per fanned-out item and is folded as it comes.
    Accumulating,
}

/// Structural role of a plan node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "shape", content = "mode")]
pub enum NodeShape {
    Regular,
    Condition,
    FanOut,
    Reduce(ReduceMode),
    /// Synthesized synchronization point in front of a multi-parent step.
    Join,
}

impl NodeShape {
    pub fn is_reduce(self) -> bool {
        matches!(self, NodeShape::Reduce(_))
    }
}

impl std::fmt::Display for NodeShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeShape::Regular => f.write_str("regular"),
            NodeShape::Condition => f.write_str("condition"),
            NodeShape::FanOut => f.write_str("fan_out"),
            NodeShape::Reduce(ReduceMode::Collected) => f.write_str("reduce(collected)"),
            NodeShape::Reduce(ReduceMode::Accumulating) => f.write_str("reduce(accumulating)"),
            NodeShape::Join => f.write_str("join"),
        }
    }
}

/// Outgoing wire of a plan node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub connection_id: String,
    /// Output port; only meaningful for condition sources
    pub port: String,
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct PlanNode {
    pub id: String,
    /// `None` for synthesized joins
    pub step: Option<Arc<Step>>,
    pub shape: NodeShape,
    pub predecessors: Vec<String>,
    pub successors: Vec<Edge>,
    /// Number of open fan-out levels around this node's input
    pub fan_out_depth: usize,
    /// Output is supplied externally; the step is not executed
    pub pinned: bool,
}

impl PlanNode {
    pub fn in_fan_out(&self) -> bool {
        self.fan_out_depth > 0
    }

    /// Number of open fan-out levels on the tokens this node sends.
    pub fn depth_out(&self) -> usize {
        match self.shape {
            NodeShape::FanOut => self.fan_out_depth + 1,
            NodeShape::Reduce(ReduceMode::Accumulating) => self.fan_out_depth.saturating_sub(1),
            _ => self.fan_out_depth,
        }
    }

    /// Does this node emit one production per fanned-out item?
    pub fn emits_items(&self) -> bool {
        self.shape == NodeShape::FanOut || (self.in_fan_out() && !self.shape.is_reduce())
    }
}

/// Executable plan for one execution.
#[derive(Debug, Clone)]
pub struct Plan {
    pub workflow_name: String,
    nodes: HashMap<String, PlanNode>,
    order: Vec<String>,
    sinks: Vec<String>,
}

/// Id of the join synthesized in front of `step_id`.
pub fn join_id(step_id: &str) -> String {
    format!("{}::join", step_id)
}

impl Plan {
    /// Compile a whole workflow.
    pub fn compile(workflow: &Workflow, registry: &StepRegistry) -> Result<Self> {
        let steps: Vec<&Step> = workflow.steps.iter().collect();
        let connections: Vec<Connection> = workflow.connections.clone();
        let none = HashSet::new();
        compile_nodes(&workflow.name, steps, connections, registry, &none, &none)
    }

    /// Compile the subgraph of a partial run.
    ///
    /// `execution_set` are the steps that will run; `pinned` steps stay in the
    /// plan as sources whose output is supplied externally.
    pub fn compile_partial(
        workflow: &Workflow,
        registry: &StepRegistry,
        execution_set: &HashSet<String>,
        pinned: &HashSet<String>,
    ) -> Result<Self> {
        let connections = filter_connections(&workflow.connections, execution_set, pinned);
        let feeding: HashSet<&str> = connections
            .iter()
            .map(|c| c.source_step_id.as_str())
            .collect();

        let steps: Vec<&Step> = workflow
            .steps
            .iter()
            .filter(|s| {
                execution_set.contains(&s.id)
                    || (pinned.contains(&s.id) && feeding.contains(s.id.as_str()))
            })
            .collect();

        // A step whose workflow output goes to a pinned or running step is
        // an intermediate even when no edge of this plan leaves it.
        let feeds: HashSet<String> = workflow
            .connections
            .iter()
            .filter(|c| {
                execution_set.contains(&c.target_step_id) || pinned.contains(&c.target_step_id)
            })
            .map(|c| c.source_step_id.clone())
            .collect();

        compile_nodes(&workflow.name, steps, connections, registry, pinned, &feeds)
    }

    pub fn node(&self, id: &str) -> Option<&PlanNode> {
        self.nodes.get(id)
    }

    pub fn shape(&self, id: &str) -> Option<NodeShape> {
        self.nodes.get(id).map(|n| n.shape)
    }

    /// All node ids (joins included) in a topological order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Step ids that will actually execute, in topological order.
    pub fn executable_steps(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(|n| n.step.is_some() && !n.pinned)
            .map(|n| n.id.as_str())
            .collect()
    }

    /// Nodes without predecessors.
    pub fn roots(&self) -> Vec<&PlanNode> {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(|n| n.predecessors.is_empty())
            .collect()
    }

    /// Step nodes whose productions make up the execution output.
    pub fn sinks(&self) -> Vec<&str> {
        self.sinks.iter().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Summary for display.
    pub fn describe(&self) -> Value {
        let nodes: Vec<Value> = self
            .order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .map(|n| {
                json!({
                    "id": n.id,
                    "type": n.step.as_ref().map(|s| s.type_id.clone()),
                    "shape": n.shape.to_string(),
                    "predecessors": n.predecessors,
                    "successors": n.successors.iter().map(|e| &e.target).collect::<Vec<_>>(),
                    "fan_out_depth": n.fan_out_depth,
                    "pinned": n.pinned,
                })
            })
            .collect();
        json!({ "workflow": self.workflow_name, "nodes": nodes })
    }
}

fn compile_nodes(
    workflow_name: &str,
    steps: Vec<&Step>,
    connections: Vec<Connection>,
    registry: &StepRegistry,
    pinned: &HashSet<String>,
    feeds: &HashSet<String>,
) -> Result<Plan> {
    let graph = Graph::from_edges(
        steps.iter().map(|s| s.id.clone()).collect(),
        connections.iter().map(|c| {
            (
                c.id.as_str(),
                c.source_step_id.as_str(),
                c.target_step_id.as_str(),
            )
        }),
    )?;
    let topo = graph.topological_sort()?;
    let by_id: HashMap<&str, &Step> = steps.iter().map(|s| (s.id.as_str(), *s)).collect();

    let mut shapes: HashMap<&str, NodeShape> = HashMap::with_capacity(topo.len());
    let mut depth_in: HashMap<&str, usize> = HashMap::with_capacity(topo.len());
    let mut depth_out: HashMap<&str, usize> = HashMap::with_capacity(topo.len());

    for id in &topo {
        let step = by_id[id.as_str()];
        let is_pinned = pinned.contains(id);
        let kind = match registry.kind(&step.type_id) {
            Some(kind) => kind,
            None if is_pinned => StepKind::Regular,
            None => {
                return Err(BuildError::StepResolutionFailed {
                    step_id: step.id.clone(),
                    type_id: step.type_id.clone(),
                }
                .into())
            }
        };

        // Open fan-out levels reaching this step through any ancestor.
        let depth = graph
            .parents(id)
            .iter()
            .map(|p| depth_out.get(p.as_str()).copied().unwrap_or(0))
            .max()
            .unwrap_or(0);

        let shape = match kind {
            StepKind::Regular => NodeShape::Regular,
            StepKind::Condition => NodeShape::Condition,
            StepKind::FanOut => NodeShape::FanOut,
            StepKind::Reduce if depth > 0 => NodeShape::Reduce(ReduceMode::Accumulating),
            StepKind::Reduce => NodeShape::Reduce(ReduceMode::Collected),
        };

        let out = match shape {
            NodeShape::FanOut => depth + 1,
            NodeShape::Reduce(ReduceMode::Accumulating) => depth.saturating_sub(1),
            _ => depth,
        };

        shapes.insert(id.as_str(), shape);
        depth_in.insert(id.as_str(), depth);
        depth_out.insert(id.as_str(), out);
    }

    let mut nodes: HashMap<String, PlanNode> = HashMap::with_capacity(topo.len());
    let mut order = Vec::with_capacity(topo.len());
    let mut joined: HashSet<&str> = HashSet::new();

    for id in &topo {
        let parents = graph.parents(id);
        // Accumulating reduces barrier on their parents themselves.
        let needs_join = parents.len() > 1
            && shapes[id.as_str()] != NodeShape::Reduce(ReduceMode::Accumulating);

        let mut predecessors = parents.to_vec();
        if needs_join {
            let jid = join_id(id);
            debug!(step_id = %id, join = %jid, "Synthesizing join");
            nodes.insert(
                jid.clone(),
                PlanNode {
                    id: jid.clone(),
                    step: None,
                    shape: NodeShape::Join,
                    predecessors: parents.to_vec(),
                    successors: vec![Edge {
                        connection_id: jid.clone(),
                        port: crate::workflow::DEFAULT_PORT.to_string(),
                        target: id.clone(),
                    }],
                    fan_out_depth: depth_in[id.as_str()],
                    pinned: false,
                },
            );
            order.push(jid.clone());
            predecessors = vec![jid];
            joined.insert(id.as_str());
        }

        nodes.insert(
            id.clone(),
            PlanNode {
                id: id.clone(),
                step: Some(Arc::new(by_id[id.as_str()].clone())),
                shape: shapes[id.as_str()],
                predecessors,
                successors: Vec::new(),
                fan_out_depth: depth_in[id.as_str()],
                pinned: pinned.contains(id),
            },
        );
        order.push(id.clone());
    }

    for conn in &connections {
        let target = if joined.contains(conn.target_step_id.as_str()) {
            join_id(&conn.target_step_id)
        } else {
            conn.target_step_id.clone()
        };
        if let Some(source) = nodes.get_mut(&conn.source_step_id) {
            let edge = Edge {
                connection_id: conn.id.clone(),
                port: conn.source_output.clone(),
                target,
            };
            let duplicate = source
                .successors
                .iter()
                .any(|e| e.target == edge.target && e.port == edge.port);
            if !duplicate {
                source.successors.push(edge);
            }
        }
    }

    let sinks = order
        .iter()
        .filter_map(|id| nodes.get(id))
        .filter(|n| n.step.is_some() && n.successors.is_empty() && !feeds.contains(&n.id))
        .map(|n| n.id.clone())
        .collect();

    Ok(Plan {
        workflow_name: workflow_name.to_string(),
        nodes,
        order,
        sinks,
    })
}
