//! Map-mode execution: one step over many items with bounded concurrency.
//!
//! A failing or timed-out item is recorded against that item only. The step
//! as a whole succeeds and reports `{total, successful, failed, skipped}`.
//! Its bundle travels on to the next step, so a map step fed by another map
//! step keeps the item indices and does not rerun items that already failed.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use super::runtime::{PreparedStep, StepRuntime};
use super::token::{Item, ItemCounters, Token};
use crate::metrics;
use crate::nodes::{StepContext, StepFailure, StepFailureKind, StepOutcome};

/// Concurrency bound used when a map step sets no `batch_size`.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Largest accepted map input unless the workflow overrides it.
pub const DEFAULT_MAX_MAP_ITEMS: usize = 10_000;

#[derive(Debug, Clone, Copy)]
pub struct MapSettings {
    pub concurrency: usize,
    pub item_timeout: Option<Duration>,
    pub max_items: usize,
}

impl Default for MapSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_BATCH_SIZE,
            item_timeout: None,
            max_items: DEFAULT_MAX_MAP_ITEMS,
        }
    }
}

/// Bundle produced by a map-mode step.
#[derive(Debug, Clone, PartialEq)]
pub struct MapResult {
    /// Every item in index order, successes and failures alike
    pub items: Vec<Item>,
    pub counters: ItemCounters,
}

impl MapResult {
    /// Outputs of the successful items, in index order.
    pub fn outputs(&self) -> Vec<Value> {
        self.items
            .iter()
            .filter(|i| !i.is_error() && !i.is_skipped())
            .map(|i| i.json.clone())
            .collect()
    }

    /// Step output value: the successful outputs as a list.
    pub fn output_value(&self) -> Value {
        Value::Array(self.outputs())
    }

    /// Per-item errors, for the step's metadata.
    pub fn errors(&self) -> Vec<Value> {
        self.items
            .iter()
            .filter_map(|i| {
                i.error
                    .as_ref()
                    .map(|e| json!({ "index": i.index, "error": e }))
            })
            .collect()
    }

    /// Token carrying the successful outputs as data and the full bundle as
    /// items.
    pub fn into_token(self, source: &str) -> Token {
        let data = self.output_value();
        let mut token = Token::new(data).from_source(source);
        token.items = self.items;
        token
    }
}

/// Run `prepared` once per item of `inputs`.
///
/// Only an oversized input fails the step; per-item problems are recorded in
/// the result. Items that arrive failed or skipped are carried as skipped
/// without running.
pub async fn run_map(
    runtime: Arc<StepRuntime>,
    prepared: Arc<PreparedStep>,
    inputs: Vec<Item>,
    ctx: &StepContext,
    settings: MapSettings,
) -> Result<MapResult, StepFailure> {
    let total = inputs.len();
    let step_id = prepared.step.id.clone();

    if total > settings.max_items {
        return Err(StepFailure::new(
            StepFailureKind::ExecutorFailed,
            format!(
                "Map input for step '{}' has {} items, exceeding the limit of {}",
                step_id, total, settings.max_items
            ),
        ));
    }

    let concurrency = settings.concurrency.max(1);
    debug!(step_id = %step_id, total, concurrency, "Running map step");

    let mut slots: Vec<Option<Item>> = vec![None; total];
    let mut join_set: JoinSet<(usize, Item)> = JoinSet::new();
    let mut runnable = Vec::with_capacity(total);
    for (slot, item) in inputs.into_iter().enumerate() {
        match carried(item) {
            Ok(item) => runnable.push((slot, item)),
            Err(item) => slots[slot] = Some(item),
        }
    }
    let mut pending = runnable.into_iter();

    let spawn = |join_set: &mut JoinSet<(usize, Item)>, (slot, item): (usize, Item)| {
        let runtime = runtime.clone();
        let prepared = prepared.clone();
        let item_ctx = ctx.for_item(item.index, total);
        let limit = settings.item_timeout;

        join_set.spawn(async move {
            let index = item.index;
            let run = runtime.run(&prepared, &item.json, &item_ctx, None);
            let outcome = match limit {
                Some(limit) => match timeout(limit, run).await {
                    Ok(outcome) => outcome,
                    Err(_) => StepOutcome::Err(StepFailure::new(
                        StepFailureKind::Timeout,
                        format!("Item {} timed out after {:?}", index, limit),
                    )),
                },
                None => run.await,
            };
            (slot, settle(item, outcome))
        });
    };

    // Spawn initial batch up to the concurrency bound
    while join_set.len() < concurrency {
        let Some(item) = pending.next() else { break };
        spawn(&mut join_set, item);
    }

    // Collect results and refill as slots free up
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((idx, item)) => {
                if let Some(err) = &item.error {
                    warn!(step_id = %step_id, item_index = idx, error = %err, "Map item failed");
                }
                slots[idx] = Some(item);
            }
            Err(e) => {
                error!(step_id = %step_id, "Map worker task join failed: {}", e);
            }
        }

        if let Some(item) = pending.next() {
            spawn(&mut join_set, item);
        }
    }

    let items: Vec<Item> = slots
        .into_iter()
        .enumerate()
        .map(|(idx, slot)| {
            slot.unwrap_or_else(|| {
                Item::new(Value::Null, idx).with_error(
                    StepFailure::new(StepFailureKind::Exception, "Map worker ended unexpectedly")
                        .to_value(),
                )
            })
        })
        .collect();

    let counters = ItemCounters::from_items(&items);
    metrics::record_map_items(counters.successful, counters.failed, counters.skipped);

    Ok(MapResult { items, counters })
}

/// `Err` for an item that must not run again: upstream failures become
/// skips here, upstream skips stay skipped.
fn carried(item: Item) -> Result<Item, Item> {
    if let Some(error) = item.error.clone() {
        return Err(Item::new(Value::Null, item.index)
            .with_metadata("skipped", json!(true))
            .with_metadata("reason", json!("failed upstream"))
            .with_metadata("upstream_error", error));
    }
    if item.is_skipped() {
        return Err(item);
    }
    Ok(item)
}

fn settle(item: Item, outcome: StepOutcome) -> Item {
    match outcome {
        StepOutcome::Ok(output) => Item {
            json: output.data,
            ..item
        },
        StepOutcome::Err(failure) => item.with_error(failure.to_value()),
        StepOutcome::Skip(reason) => Item::new(Value::Null, item.index)
            .with_metadata("skipped", json!(true))
            .with_metadata("reason", json!(reason)),
    }
}
