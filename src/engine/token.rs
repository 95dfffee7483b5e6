//! Tokens and items: the data envelopes flowing along connections.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Position of a token inside one fan-out level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FanOutPosition {
    pub item_index: usize,
    pub items_total: usize,
}

/// Outer-to-inner fan-out positions of a token. Empty outside any fan-out.
pub type FanOutStack = Vec<FanOutPosition>;

/// One unit of a fanned-out collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub json: Value,
    pub index: usize,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Item {
    pub fn new(json: Value, index: usize) -> Self {
        Self {
            json,
            index,
            metadata: Map::new(),
            error: None,
        }
    }

    /// Record a failure against this item only.
    pub fn with_error(mut self, error: Value) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn is_skipped(&self) -> bool {
        self.metadata
            .get("skipped")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Outcome counters of a map-mode step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCounters {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl ItemCounters {
    pub fn from_items(items: &[Item]) -> Self {
        let mut counters = Self {
            total: items.len(),
            ..Default::default()
        };
        for item in items {
            if item.is_error() {
                counters.failed += 1;
            } else if item.is_skipped() {
                counters.skipped += 1;
            } else {
                counters.successful += 1;
            }
        }
        counters
    }
}

/// Data envelope delivered to a step's input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// Value presented to the receiving step as its input
    pub data: Value,
    /// Per-item bundle of a map-mode step, failures and skips included;
    /// empty for plain tokens
    #[serde(default)]
    pub items: Vec<Item>,
    /// Port selected by a condition step
    #[serde(default)]
    pub route: Option<String>,
    /// Ids of the steps that contributed to this token, in order
    #[serde(default)]
    pub lineage: Vec<String>,
    /// Step that emitted this token
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub fan_out: FanOutStack,
}

impl Token {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            items: Vec::new(),
            route: None,
            lineage: Vec::new(),
            source: None,
            fan_out: Vec::new(),
        }
    }

    pub fn with_fan_out(mut self, fan_out: FanOutStack) -> Self {
        self.fan_out = fan_out;
        self
    }

    pub fn with_lineage(mut self, lineage: Vec<String>) -> Self {
        self.lineage = lineage;
        self
    }

    pub fn from_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    /// Innermost fan-out position, if inside a fan-out.
    pub fn position(&self) -> Option<FanOutPosition> {
        self.fan_out.last().copied()
    }
}

/// Items a map-mode step runs over: the bundle it was handed, if any.
/// Otherwise a list yields one item per element and anything else a single
/// item at index 0.
pub fn map_inputs(bundle: &[Item], data: &Value) -> Vec<Item> {
    if bundle.is_empty() {
        items_from_value(data)
    } else {
        bundle.to_vec()
    }
}

/// Normalize a plain value into items.
pub fn items_from_value(value: &Value) -> Vec<Item> {
    match value {
        Value::Array(values) => values
            .iter()
            .enumerate()
            .map(|(idx, v)| Item::new(v.clone(), idx))
            .collect(),
        other => vec![Item::new(other.clone(), 0)],
    }
}
