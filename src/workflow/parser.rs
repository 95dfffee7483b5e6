//! Workflow YAML parser.

use std::path::Path;

use super::types::Workflow;
use crate::error::{Error, Result};

/// Parse a workflow from a YAML string.
///
/// `depends_on` shorthands are desugared into connections before returning.
pub fn parse_workflow(yaml: &str) -> Result<Workflow> {
    if yaml.trim().is_empty() {
        return Err(Error::Parse("Empty workflow definition".to_string()));
    }

    let mut workflow: Workflow = serde_yaml::from_str(yaml).map_err(|e| {
        let msg = e.to_string();
        if let Some(field) = extract_missing_field(&msg) {
            Error::Parse(format!("Missing required field: {}", field))
        } else {
            Error::Parse(format!("Invalid YAML: {}", msg))
        }
    })?;
    workflow.normalize();
    Ok(workflow)
}

/// Parse a workflow from a file path.
pub fn parse_workflow_file(path: &Path) -> Result<Workflow> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow(&content)
}

fn extract_missing_field(error_message: &str) -> Option<&str> {
    let marker = "missing field `";
    let start = error_message.find(marker)? + marker.len();
    let rest = &error_message[start..];
    let end = rest.find('`')?;
    Some(&rest[..end])
}
