//! Template evaluation for step configs.
//!
//! Placeholders have the form `{{ path.to.value }}` where the first segment
//! names a context root: `input`, `nodes`, `variables`, `trigger`, `item`,
//! `execution` or `env`. A string that is exactly one placeholder resolves to
//! the typed JSON value; otherwise each placeholder is rendered as text.

use std::sync::OnceLock;

use regex_lite::Regex;
use serde_json::{Map, Value};

/// Evaluates templates against a materialized context.
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate one template string.
    fn evaluate(&self, template: &str, context: &Value) -> Result<Value, String>;

    /// Evaluate every string inside a map/list, recursively.
    fn evaluate_deep(&self, value: &Value, context: &Value) -> Result<Value, String> {
        match value {
            Value::String(s) if s.contains("{{") => self.evaluate(s, context),
            Value::Array(items) => items
                .iter()
                .map(|v| self.evaluate_deep(v, context))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(obj) => {
                let mut out = Map::with_capacity(obj.len());
                for (k, v) in obj {
                    out.insert(k.clone(), self.evaluate_deep(v, context)?);
                }
                Ok(Value::Object(out))
            }
            _ => Ok(value.clone()),
        }
    }
}

/// Default `{{ path }}` evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateEvaluator;

fn full_template_regex() -> &'static Regex {
    static FULL: OnceLock<Regex> = OnceLock::new();
    FULL.get_or_init(|| Regex::new(r"^\s*\{\{\s*([^{}]+?)\s*\}\}\s*$").expect("valid regex"))
}

fn template_regex() -> &'static Regex {
    static PART: OnceLock<Regex> = OnceLock::new();
    PART.get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("valid regex"))
}

impl ExpressionEvaluator for TemplateEvaluator {
    fn evaluate(&self, template: &str, context: &Value) -> Result<Value, String> {
        if let Some(caps) = full_template_regex().captures(template) {
            let expr = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            return resolve_expression(expr, context)
                .ok_or_else(|| format!("Unresolved template path '{}'", expr));
        }

        let mut missing: Option<String> = None;
        let rendered = template_regex()
            .replace_all(template, |caps: &regex_lite::Captures| {
                let expr = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                match resolve_expression(expr, context) {
                    Some(value) => value_to_string(&value),
                    None => {
                        missing.get_or_insert_with(|| expr.to_string());
                        String::new()
                    }
                }
            })
            .to_string();

        match missing {
            Some(expr) => Err(format!("Unresolved template path '{}'", expr)),
            None => Ok(Value::String(rendered)),
        }
    }
}

fn resolve_expression(expr: &str, context: &Value) -> Option<Value> {
    let expr = expr.trim();
    if let Some(var) = expr.strip_prefix("env.") {
        return Some(Value::String(render_env_var(var)));
    }
    get_path_value(context, expr).cloned()
}

/// Check if an environment variable is safe to expose in templates.
///
/// By default, only WEFT_* prefixed variables are allowed.
/// Additional variables can be whitelisted via WEFT_ALLOWED_ENV_VARS
/// (comma-separated list).
pub fn is_safe_env_var(var_name: &str) -> bool {
    if var_name.starts_with("WEFT_") {
        return true;
    }

    if let Ok(allowed) = std::env::var("WEFT_ALLOWED_ENV_VARS") {
        return allowed.split(',').map(|s| s.trim()).any(|v| v == var_name);
    }

    false
}

fn render_env_var(var_name: &str) -> String {
    if is_safe_env_var(var_name) {
        std::env::var(var_name).unwrap_or_default()
    } else {
        tracing::warn!(
            "Blocked access to environment variable '{}' in template (not in allowlist)",
            var_name
        );
        String::new()
    }
}

/// Convert a JSON value to a string for template substitution.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        _ => value.to_string(),
    }
}

/// Does any string inside `value` contain template syntax?
pub fn contains_template(value: &Value) -> bool {
    match value {
        Value::String(s) => s.contains("{{"),
        Value::Array(items) => items.iter().any(contains_template),
        Value::Object(obj) => obj.values().any(contains_template),
        _ => false,
    }
}

/// Strip `{{ }}` around a bare expression.
pub fn normalize_template(expr: &str) -> &str {
    let trimmed = expr.trim();
    if trimmed.starts_with("{{") && trimmed.ends_with("}}") {
        trimmed[2..trimmed.len() - 2].trim()
    } else {
        trimmed
    }
}

/// Walk a dotted path; numeric segments index into arrays.
pub fn get_path_value<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        match current {
            Value::Object(map) => current = map.get(segment)?,
            Value::Array(items) => {
                let index = segment.parse::<usize>().ok()?;
                current = items.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Resolve a config field that is either a bare path into the step input
/// (`input`, `input.items`, `item.price`) or an already resolved value.
///
/// Strings that are not paths are returned unchanged.
pub fn resolve_field(field: &Value, input: &Value) -> Value {
    let Value::String(raw) = field else {
        return field.clone();
    };

    let expr = normalize_template(raw);
    if expr == "input" || expr == "item" {
        return input.clone();
    }

    if let Some(path) = expr
        .strip_prefix("input.")
        .or_else(|| expr.strip_prefix("item."))
    {
        return get_path_value(input, path).cloned().unwrap_or(Value::Null);
    }

    field.clone()
}
