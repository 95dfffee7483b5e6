//! Reduce operations for fan-in steps.
//!
//! The same operations back both compiled reduce forms: a collected reduce
//! applies [`ReduceOp::apply`] to an already joined list, an accumulating
//! reduce feeds an [`Accumulator`] once per fanned-out item and emits on the
//! last one.
//!
//! | operation | empty input |
//! |-----------|-------------|
//! | `sum`     | `0`         |
//! | `count`   | `0`         |
//! | `concat`  | `[]`        |
//! | `first`, `last`, `min`, `max` | `null` |
//! | `collect` (default) | `[]` |

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Number, Value};

use crate::nodes::template::get_path_value;

/// Fold operation, selected by the step config's `operation` key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceOp {
    Sum,
    Count,
    Concat,
    First,
    Last,
    Min,
    Max,
    #[default]
    Collect,
}

impl ReduceOp {
    /// Read the operation from a step config; unknown names fall back to
    /// `collect`.
    pub fn from_config(config: &Value) -> Self {
        config
            .get("operation")
            .and_then(Value::as_str)
            .and_then(|s| serde_json::from_value(Value::String(s.to_lowercase())).ok())
            .unwrap_or_default()
    }

    /// Result of folding zero items.
    pub fn identity(self) -> Value {
        match self {
            Self::Sum | Self::Count => json!(0),
            Self::Concat | Self::Collect => json!([]),
            Self::First | Self::Last | Self::Min | Self::Max => Value::Null,
        }
    }

    /// Fold a complete, ordered list.
    pub fn apply(self, items: &[Value]) -> Value {
        let mut acc = Accumulator::new(self, None);
        for (idx, item) in items.iter().enumerate() {
            acc.fold(vec![idx], item.clone());
        }
        acc.finish()
    }
}

/// Running fold for an accumulating reduce.
///
/// Items may arrive in any order; order-sensitive operations key them by
/// their fan-out position so the result does not depend on arrival order.
#[derive(Debug, Clone)]
pub struct Accumulator {
    op: ReduceOp,
    field: Option<String>,
    seen: u64,
    int_sum: i64,
    float_sum: f64,
    floats: bool,
    best: Option<Value>,
    ordered: BTreeMap<Vec<usize>, Value>,
}

impl Accumulator {
    /// `field` optionally picks a path out of each item before folding.
    pub fn new(op: ReduceOp, field: Option<String>) -> Self {
        Self {
            op,
            field,
            seen: 0,
            int_sum: 0,
            float_sum: 0.0,
            floats: false,
            best: None,
            ordered: BTreeMap::new(),
        }
    }

    /// Build from a reduce step's config (`operation`, `field`).
    pub fn from_config(config: &Value) -> Self {
        let field = config
            .get("field")
            .and_then(Value::as_str)
            .map(|s| s.trim_start_matches("item.").to_string());
        Self::new(ReduceOp::from_config(config), field)
    }

    pub fn count(&self) -> u64 {
        self.seen
    }

    pub fn fold(&mut self, position: Vec<usize>, item: Value) {
        let value = match &self.field {
            Some(path) => get_path_value(&item, path).cloned().unwrap_or(Value::Null),
            None => item,
        };
        self.seen += 1;

        match self.op {
            ReduceOp::Count => {}
            ReduceOp::Sum => self.add(&value),
            ReduceOp::Min | ReduceOp::Max => {
                if value.is_null() {
                    return;
                }
                let wanted = if self.op == ReduceOp::Min {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
                let replace = match &self.best {
                    None => true,
                    Some(best) => compare(&value, best) == Some(wanted),
                };
                if replace {
                    self.best = Some(value);
                }
            }
            ReduceOp::Concat | ReduceOp::Collect | ReduceOp::First | ReduceOp::Last => {
                self.ordered.insert(position, value);
            }
        }
    }

    fn add(&mut self, value: &Value) {
        let number = match value {
            Value::Number(n) => Some(n.clone()),
            Value::String(s) => s.trim().parse::<f64>().ok().and_then(Number::from_f64),
            _ => None,
        };
        let Some(n) = number else { return };

        if let (Some(i), false) = (n.as_i64(), self.floats) {
            if let Some(sum) = self.int_sum.checked_add(i) {
                self.int_sum = sum;
                return;
            }
        }
        if !self.floats {
            self.floats = true;
            self.float_sum = self.int_sum as f64;
        }
        self.float_sum += n.as_f64().unwrap_or(0.0);
    }

    pub fn finish(self) -> Value {
        if self.seen == 0 {
            return self.op.identity();
        }
        match self.op {
            ReduceOp::Count => json!(self.seen),
            ReduceOp::Sum => {
                if self.floats {
                    Number::from_f64(self.float_sum)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                } else {
                    json!(self.int_sum)
                }
            }
            ReduceOp::Min | ReduceOp::Max => self.best.unwrap_or(Value::Null),
            ReduceOp::First => self.ordered.into_values().next().unwrap_or(Value::Null),
            ReduceOp::Last => self.ordered.into_values().next_back().unwrap_or(Value::Null),
            ReduceOp::Collect => Value::Array(self.ordered.into_values().collect()),
            ReduceOp::Concat => concat(self.ordered.into_values()),
        }
    }
}

/// Lists are flattened; if every element is a string the result is one
/// string; otherwise scalars are appended as list elements.
fn concat(values: impl Iterator<Item = Value>) -> Value {
    let values: Vec<Value> = values.filter(|v| !v.is_null()).collect();
    if !values.is_empty() && values.iter().all(Value::is_string) {
        let joined: String = values.iter().filter_map(Value::as_str).collect();
        return Value::String(joined);
    }

    let mut out = Vec::new();
    for value in values {
        match value {
            Value::Array(items) => out.extend(items),
            other => out.push(other),
        }
    }
    Value::Array(out)
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identities() {
        assert_eq!(ReduceOp::Sum.apply(&[]), json!(0));
        assert_eq!(ReduceOp::Count.apply(&[]), json!(0));
        assert_eq!(ReduceOp::Collect.apply(&[]), json!([]));
        assert_eq!(ReduceOp::Max.apply(&[]), Value::Null);
    }

    #[test]
    fn test_operations() {
        let items = [json!(3), json!(1), json!(2.5)];
        assert_eq!(ReduceOp::Sum.apply(&items), json!(6.5));
        assert_eq!(ReduceOp::Count.apply(&items), json!(3));
        assert_eq!(ReduceOp::Min.apply(&items), json!(1));
        assert_eq!(ReduceOp::Max.apply(&items), json!(3));
        assert_eq!(ReduceOp::First.apply(&items), json!(3));
        assert_eq!(ReduceOp::Last.apply(&items), json!(2.5));
        assert_eq!(ReduceOp::Sum.apply(&[json!(1), json!(2)]), json!(3));
    }

    #[test]
    fn test_concat() {
        assert_eq!(ReduceOp::Concat.apply(&[json!("a"), json!("b")]), json!("ab"));
        assert_eq!(
            ReduceOp::Concat.apply(&[json!([1]), json!([2, 3]), json!(4)]),
            json!([1, 2, 3, 4])
        );
    }

    #[test]
    fn test_accumulator_order_independent() {
        let mut acc = Accumulator::from_config(&json!({"operation": "collect", "field": "item.n"}));
        acc.fold(vec![2], json!({"n": "c"}));
        acc.fold(vec![0], json!({"n": "a"}));
        acc.fold(vec![1], json!({"n": "b"}));
        assert_eq!(acc.count(), 3);
        assert_eq!(acc.finish(), json!(["a", "b", "c"]));
    }

    #[test]
    fn test_from_config_defaults_to_collect() {
        assert_eq!(ReduceOp::from_config(&json!({})), ReduceOp::Collect);
        assert_eq!(ReduceOp::from_config(&json!({"operation": "SUM"})), ReduceOp::Sum);
        assert_eq!(ReduceOp::from_config(&json!({"operation": "nope"})), ReduceOp::Collect);
    }
}
