//! Production counting: how many units of output a step produced.

use serde_json::Value;

use super::plan::NodeShape;

/// Count the productions of one step output.
///
/// `shape` is the compiled shape (`None` when the node is not in the plan,
/// e.g. a pinned output recorded without compiling); `in_fan_out` is whether
/// the node runs inside an open fan-out.
pub fn count(
    output: Option<&Value>,
    shape: Option<NodeShape>,
    explicit: Option<u64>,
    in_fan_out: bool,
) -> u64 {
    if let Some(n) = explicit {
        return n;
    }

    let value = match output {
        None | Some(Value::Null) => return 0,
        Some(Value::Array(items)) if items.is_empty() => return 0,
        Some(value) => value,
    };

    match (shape, value) {
        (Some(NodeShape::FanOut), Value::Array(items)) => items.len() as u64,
        (Some(_), _) => 1,
        (None, Value::Array(items)) if in_fan_out => items.len() as u64,
        (None, _) => 1,
    }
}
