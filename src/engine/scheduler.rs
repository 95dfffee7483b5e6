//! Token routing over a compiled plan.
//!
//! The scheduler is plain state owned by an execution's coordinator task. It
//! never runs a step: the coordinator hands it each finished activation and
//! gets back the work that became ready. Joins and accumulating reduces are
//! resolved here, so every barrier in a run lives in one place.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, trace};

use super::map_executor::MapResult;
use super::plan::{NodeShape, Plan, PlanNode, ReduceMode};
use super::reduce::Accumulator;
use super::token::{map_inputs, FanOutPosition, FanOutStack, Item, Token};
use crate::workflow::DEFAULT_PORT;

/// One ready execution of a step.
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
    pub node_id: String,
    pub input: Value,
    /// Bundle handed on by a map-mode parent
    pub items: Vec<Item>,
    pub fan_out: FanOutStack,
    pub lineage: Vec<String>,
}

impl Activation {
    pub fn position(&self) -> Option<FanOutPosition> {
        self.fan_out.last().copied()
    }

    /// Items to run over when the step executes in map mode.
    pub fn map_items(&self) -> Vec<Item> {
        map_inputs(&self.items, &self.input)
    }
}

/// What the coordinator must do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Work {
    /// Execute the step.
    Run(Activation),
    /// No token reached the step on this path; record it as skipped.
    Skip {
        node_id: String,
        fan_out: FanOutStack,
        lineage: Vec<String>,
    },
    /// The step's output is already known (pinned, or a finished reduce);
    /// record it without executing.
    Emit {
        node_id: String,
        value: Value,
        fan_out: FanOutStack,
        lineage: Vec<String>,
    },
}

impl Work {
    pub fn node_id(&self) -> &str {
        match self {
            Work::Run(a) => &a.node_id,
            Work::Skip { node_id, .. } | Work::Emit { node_id, .. } => node_id,
        }
    }
}

/// How an activation ended, as far as routing is concerned.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Produced { value: Value, route: Option<String> },
    /// A map-mode step's bundle; its successes are the produced value.
    Mapped(MapResult),
    Skipped,
}

#[derive(Debug, Clone)]
enum Delivery {
    Token(Token),
    Skipped {
        fan_out: FanOutStack,
        lineage: Vec<String>,
    },
}

impl Delivery {
    fn fan_out(&self) -> &FanOutStack {
        match self {
            Delivery::Token(t) => &t.fan_out,
            Delivery::Skipped { fan_out, .. } => fan_out,
        }
    }

    fn lineage(&self) -> &[String] {
        match self {
            Delivery::Token(t) => &t.lineage,
            Delivery::Skipped { lineage, .. } => lineage,
        }
    }
}

#[derive(Debug, Default)]
struct JoinState {
    /// `None` for a parent that was skipped
    received: HashMap<String, Option<Value>>,
    lineage: Vec<String>,
}

#[derive(Debug)]
struct AccumulatorState {
    acc: Accumulator,
    expected: usize,
    received: usize,
    lineage: Vec<String>,
}

impl AccumulatorState {
    fn take(&mut self, order: Vec<usize>, value: Option<Value>, lineage: &[String]) {
        extend_lineage(&mut self.lineage, lineage);
        if let Some(value) = value {
            self.acc.fold(order, value);
        }
        self.received += 1;
    }
}

/// Input from a parent with fewer open fan-out levels than the barrier it
/// feeds. It stands for every item under its stack.
#[derive(Debug, Clone)]
struct Broadcast {
    value: Option<Value>,
    lineage: Vec<String>,
}

impl From<Delivery> for Broadcast {
    fn from(delivery: Delivery) -> Self {
        match delivery {
            Delivery::Token(token) => Self {
                value: Some(token.data),
                lineage: token.lineage,
            },
            Delivery::Skipped { lineage, .. } => Self {
                value: None,
                lineage,
            },
        }
    }
}

type BarrierKey = (String, FanOutStack);

/// `(barrier node, parent, parent's stack)`
type BroadcastKey = (String, String, FanOutStack);

/// Routing state for one execution.
#[derive(Debug)]
pub struct Scheduler {
    plan: Arc<Plan>,
    joins: HashMap<BarrierKey, JoinState>,
    accumulators: HashMap<BarrierKey, AccumulatorState>,
    finished_accumulators: HashSet<BarrierKey>,
    broadcasts: HashMap<BroadcastKey, Broadcast>,
}

impl Scheduler {
    pub fn new(plan: Arc<Plan>) -> Self {
        Self {
            plan,
            joins: HashMap::new(),
            accumulators: HashMap::new(),
            finished_accumulators: HashSet::new(),
            broadcasts: HashMap::new(),
        }
    }

    /// Initial work: roots run on the trigger data, pinned steps emit their
    /// supplied output.
    pub fn start(&mut self, trigger: &Value, pinned: &HashMap<String, Value>) -> Vec<Work> {
        self.plan
            .roots()
            .into_iter()
            .map(|node| {
                if node.pinned {
                    Work::Emit {
                        node_id: node.id.clone(),
                        value: pinned.get(&node.id).cloned().unwrap_or(Value::Null),
                        fan_out: Vec::new(),
                        lineage: Vec::new(),
                    }
                } else {
                    Work::Run(Activation {
                        node_id: node.id.clone(),
                        input: trigger.clone(),
                        items: Vec::new(),
                        fan_out: Vec::new(),
                        lineage: Vec::new(),
                    })
                }
            })
            .collect()
    }

    /// Route the result of one finished activation and return whatever
    /// became ready.
    pub fn complete(
        &mut self,
        node_id: &str,
        fan_out: &FanOutStack,
        lineage: &[String],
        completion: Completion,
    ) -> Vec<Work> {
        let Some(node) = self.plan.node(node_id).cloned() else {
            return Vec::new();
        };

        let mut out_lineage = lineage.to_vec();
        out_lineage.push(node_id.to_string());

        let mut work = Vec::new();
        for (target, delivery) in route(&node, fan_out, out_lineage, completion) {
            work.extend(self.deliver(&target, node_id, delivery));
        }
        work
    }

    /// Joins and accumulators still waiting for inputs.
    pub fn pending_barriers(&self) -> usize {
        self.joins.len() + self.accumulators.len()
    }

    /// Ids of the nodes behind [`Self::pending_barriers`].
    pub fn pending_barrier_nodes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .joins
            .keys()
            .chain(self.accumulators.keys())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    fn depth_out_of(&self, node_id: &str) -> usize {
        self.plan.node(node_id).map_or(0, PlanNode::depth_out)
    }

    fn deliver(&mut self, target: &str, source: &str, delivery: Delivery) -> Vec<Work> {
        let Some(node) = self.plan.node(target).cloned() else {
            return Vec::new();
        };

        match node.shape {
            NodeShape::Join => self.deliver_to_join(&node, source, delivery),
            NodeShape::Reduce(ReduceMode::Accumulating) => {
                self.deliver_to_accumulator(&node, source, delivery)
            }
            _ => match delivery {
                Delivery::Token(token) => vec![Work::Run(Activation {
                    node_id: node.id.clone(),
                    input: token.data,
                    items: token.items,
                    fan_out: token.fan_out,
                    lineage: token.lineage,
                })],
                Delivery::Skipped { fan_out, lineage } => vec![Work::Skip {
                    node_id: node.id.clone(),
                    fan_out,
                    lineage,
                }],
            },
        }
    }

    /// Barrier keys of `node` that sit under `prefix`.
    fn open_keys<T>(
        barriers: &HashMap<BarrierKey, T>,
        node_id: &str,
        prefix: &[FanOutPosition],
    ) -> Vec<FanOutStack> {
        barriers
            .keys()
            .filter(|(id, stack)| id == node_id && stack.starts_with(prefix))
            .map(|(_, stack)| stack.clone())
            .collect()
    }

    fn deliver_to_join(&mut self, node: &PlanNode, source: &str, delivery: Delivery) -> Vec<Work> {
        let stack = delivery.fan_out().clone();

        if stack.len() < node.fan_out_depth {
            trace!(join = %node.id, parent = %source, "Join input covers every item");
            self.broadcasts.insert(
                (node.id.clone(), source.to_string(), stack.clone()),
                Broadcast::from(delivery),
            );
            let mut out = Vec::new();
            for key in Self::open_keys(&self.joins, &node.id, &stack) {
                out.extend(self.try_resolve_join(node, key));
            }
            return out;
        }

        let state = self
            .joins
            .entry((node.id.clone(), stack.clone()))
            .or_default();
        extend_lineage(&mut state.lineage, delivery.lineage());
        let value = match delivery {
            Delivery::Token(token) => Some(token.data),
            Delivery::Skipped { .. } => None,
        };
        state.received.insert(source.to_string(), value);

        self.try_resolve_join(node, stack)
    }

    fn try_resolve_join(&mut self, node: &PlanNode, stack: FanOutStack) -> Vec<Work> {
        let key = (node.id.clone(), stack);
        let Some(state) = self.joins.get(&key) else {
            return Vec::new();
        };

        let mut inputs: Vec<Option<Value>> = Vec::with_capacity(node.predecessors.len());
        let mut lineage = state.lineage.clone();
        for parent in &node.predecessors {
            if let Some(value) = state.received.get(parent) {
                inputs.push(value.clone());
                continue;
            }
            let depth = self.depth_out_of(parent);
            let broadcast = key.1.get(..depth).and_then(|prefix| {
                self.broadcasts
                    .get(&(node.id.clone(), parent.clone(), prefix.to_vec()))
            });
            match broadcast {
                Some(b) => {
                    extend_lineage(&mut lineage, &b.lineage);
                    inputs.push(b.value.clone());
                }
                None => {
                    trace!(join = %node.id, waiting_on = %parent, "Join waiting");
                    return Vec::new();
                }
            }
        }
        self.joins.remove(&key);

        // Nothing exists inside an empty fan-out, whatever arrived from outside it.
        let empty_level = key.1.iter().any(|p| p.items_total == 0);
        let outputs: Vec<Value> = inputs.into_iter().flatten().collect();
        let completion = if outputs.is_empty() || empty_level {
            Completion::Skipped
        } else {
            Completion::Produced {
                value: Value::Array(outputs),
                route: None,
            }
        };
        debug!(join = %node.id, skipped = completion == Completion::Skipped, "Join resolved");

        // Joins are synthetic: they pass straight through without a row.
        let mut out = Vec::new();
        for (target, delivery) in route(node, &key.1, lineage, completion) {
            out.extend(self.deliver(&target, &node.id, delivery));
        }
        out
    }

    fn deliver_to_accumulator(
        &mut self,
        node: &PlanNode,
        source: &str,
        delivery: Delivery,
    ) -> Vec<Work> {
        let depth = node.fan_out_depth;
        let stack = delivery.fan_out().clone();
        let parent_idx = node
            .predecessors
            .iter()
            .position(|p| p == source)
            .unwrap_or(0);

        if stack.len() < depth {
            // Folded once into every reduce under this stack, ahead of the items.
            let broadcast = Broadcast::from(delivery);
            let mut out = Vec::new();
            for outer in Self::open_keys(&self.accumulators, &node.id, &stack) {
                if let Some(state) = self.accumulators.get_mut(&(node.id.clone(), outer.clone())) {
                    state.take(
                        vec![0, parent_idx, 0],
                        broadcast.value.clone(),
                        &broadcast.lineage,
                    );
                }
                out.extend(self.try_finish_accumulator(node, outer));
            }
            self.broadcasts
                .insert((node.id.clone(), source.to_string(), stack), broadcast);
            return out;
        }

        let Some(position) = stack.last().copied() else {
            return Vec::new();
        };
        let outer: FanOutStack = stack[..stack.len() - 1].to_vec();
        let key = (node.id.clone(), outer.clone());
        if self.finished_accumulators.contains(&key) {
            trace!(step_id = %node.id, "Late input for finished reduce ignored");
            return Vec::new();
        }

        if !self.accumulators.contains_key(&key) {
            let state = self.open_accumulator(node, &outer, position.items_total);
            self.accumulators.insert(key.clone(), state);
        }
        if let Some(state) = self.accumulators.get_mut(&key) {
            let input = Broadcast::from(delivery);
            state.take(
                vec![1, position.item_index, parent_idx],
                input.value,
                &input.lineage,
            );
        }

        self.try_finish_accumulator(node, outer)
    }

    /// Start the reduce for one outer stack. Every parent at the reduce's
    /// depth sends one input per item; shallower parents send one input
    /// in total, which may already have arrived.
    fn open_accumulator(
        &self,
        node: &PlanNode,
        outer: &FanOutStack,
        items_total: usize,
    ) -> AccumulatorState {
        let depth = node.fan_out_depth;
        let (deep, shallow): (Vec<(usize, &String)>, Vec<(usize, &String)>) = node
            .predecessors
            .iter()
            .enumerate()
            .partition(|(_, p)| self.depth_out_of(p) >= depth);

        let mut state = AccumulatorState {
            acc: accumulator_for(node),
            expected: deep.len().max(1) * items_total.max(1) + shallow.len(),
            received: 0,
            lineage: Vec::new(),
        };
        for (idx, parent) in shallow {
            let prefix = outer[..self.depth_out_of(parent).min(outer.len())].to_vec();
            if let Some(b) = self.broadcasts.get(&(node.id.clone(), parent.clone(), prefix)) {
                state.take(vec![0, idx, 0], b.value.clone(), &b.lineage);
            }
        }
        state
    }

    fn try_finish_accumulator(&mut self, node: &PlanNode, outer: FanOutStack) -> Vec<Work> {
        let key = (node.id.clone(), outer);
        match self.accumulators.get(&key) {
            Some(state) if state.received >= state.expected => {}
            _ => return Vec::new(),
        }
        let Some(state) = self.accumulators.remove(&key) else {
            return Vec::new();
        };
        debug!(
            step_id = %node.id,
            items = state.acc.count(),
            "Accumulating reduce complete"
        );
        let (node_id, outer) = key.clone();
        self.finished_accumulators.insert(key);

        vec![Work::Emit {
            node_id,
            value: state.acc.finish(),
            fan_out: outer,
            lineage: state.lineage,
        }]
    }
}

fn extend_lineage(lineage: &mut Vec<String>, more: &[String]) {
    for id in more {
        if !lineage.contains(id) {
            lineage.push(id.clone());
        }
    }
}

fn accumulator_for(node: &PlanNode) -> Accumulator {
    node.step
        .as_ref()
        .map(|s| Accumulator::from_config(&s.config))
        .unwrap_or_else(|| Accumulator::new(Default::default(), None))
}

/// Turn a completion into per-target deliveries.
fn route(
    node: &PlanNode,
    fan_out: &FanOutStack,
    lineage: Vec<String>,
    completion: Completion,
) -> Vec<(String, Delivery)> {
    let targets = distinct_targets(node);
    let token = |data: Value, fan_out: FanOutStack| {
        Delivery::Token(
            Token::new(data)
                .with_fan_out(fan_out)
                .with_lineage(lineage.clone())
                .from_source(&node.id),
        )
    };
    let skipped = |fan_out: FanOutStack| Delivery::Skipped {
        fan_out,
        lineage: lineage.clone(),
    };

    let (value, route) = match completion {
        Completion::Skipped => {
            // A skipped splitter still opens its level, with no items.
            let stack = if node.shape == NodeShape::FanOut {
                push(fan_out, 0, 0)
            } else {
                fan_out.clone()
            };
            return targets
                .into_iter()
                .map(|t| (t, skipped(stack.clone())))
                .collect();
        }
        Completion::Produced { value, route } => (value, route),
        Completion::Mapped(result) if node.shape == NodeShape::Regular => {
            let bundle = result
                .into_token(&node.id)
                .with_fan_out(fan_out.clone())
                .with_lineage(lineage.clone());
            return targets
                .into_iter()
                .map(|t| (t, Delivery::Token(bundle.clone())))
                .collect();
        }
        Completion::Mapped(result) => (result.output_value(), None),
    };

    match node.shape {
        NodeShape::FanOut => {
            let items = match value {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                other => vec![other],
            };
            if items.is_empty() {
                let stack = push(fan_out, 0, 0);
                return targets
                    .into_iter()
                    .map(|t| (t, skipped(stack.clone())))
                    .collect();
            }
            let total = items.len();
            let mut out = Vec::with_capacity(total * targets.len());
            for (idx, item) in items.into_iter().enumerate() {
                let stack = push(fan_out, idx, total);
                for target in &targets {
                    out.push((target.clone(), token(item.clone(), stack.clone())));
                }
            }
            out
        }
        NodeShape::Condition => targets
            .into_iter()
            .map(|target| {
                let fires = node.successors.iter().any(|e| {
                    e.target == target
                        && (e.port == DEFAULT_PORT || route.as_deref().map_or(true, |r| r == e.port))
                });
                let delivery = if fires {
                    token(value.clone(), fan_out.clone())
                } else {
                    skipped(fan_out.clone())
                };
                (target, delivery)
            })
            .collect(),
        _ => targets
            .into_iter()
            .map(|t| (t, token(value.clone(), fan_out.clone())))
            .collect(),
    }
}

fn distinct_targets(node: &PlanNode) -> Vec<String> {
    let mut targets: Vec<String> = Vec::with_capacity(node.successors.len());
    for edge in &node.successors {
        if !targets.contains(&edge.target) {
            targets.push(edge.target.clone());
        }
    }
    targets
}

fn push(stack: &FanOutStack, item_index: usize, items_total: usize) -> FanOutStack {
    let mut next = stack.clone();
    next.push(FanOutPosition {
        item_index,
        items_total,
    });
    next
}
