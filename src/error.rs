//! Error types for weft.
//!
//! Errors carry a stable machine code so callers (and agents driving the
//! engine) can branch on the kind of failure without parsing messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Result type alias for weft operations.
pub type Result<T> = std::result::Result<T, Error>;

/// weft error types.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Step error: {0}")]
    Step(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Execution '{0}' is already in a terminal state")]
    AlreadyTerminal(String),

    #[error("Step '{0}' is not pinned")]
    NodeNotPinned(String),

    #[error("Transition rejected: {from} -> {to}")]
    TransitionRejected { from: String, to: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the error code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Graph(GraphError::CycleDetected(_)) => "CYCLE_DETECTED",
            Error::Graph(GraphError::InvalidConnections(_)) => "INVALID_CONNECTIONS",
            Error::Graph(_) => "GRAPH_ERROR",
            Error::Build(_) => "BUILD_ERROR",
            Error::Workflow(_) => "WORKFLOW_ERROR",
            Error::Step(_) => "STEP_ERROR",
            Error::Execution(_) => "EXECUTION_ERROR",
            Error::AlreadyTerminal(_) => "ALREADY_TERMINAL",
            Error::NodeNotPinned(_) => "NODE_NOT_PINNED",
            Error::TransitionRejected { .. } => "TRANSITION_REJECTED",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Parse(_) => "PARSE_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Convert to a JSON error envelope.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        })
    }
}

/// Which end of a connection failed to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Source,
    Target,
}

/// A connection whose endpoint does not name a known step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidConnection {
    pub connection_id: String,
    pub endpoint: Endpoint,
    pub step_id: String,
}

/// Structural problems with a step/connection graph.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "details", rename_all = "snake_case")]
pub enum GraphError {
    #[error("invalid connections: {}", describe_invalid(.0))]
    InvalidConnections(Vec<InvalidConnection>),

    #[error("cycle detected among steps: {}", .0.join(", "))]
    CycleDetected(Vec<String>),

    #[error("connection '{connection_id}' links step '{step_id}' to itself")]
    SelfLoop {
        connection_id: String,
        step_id: String,
    },

    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),

    #[error("unknown step '{0}'")]
    UnknownStep(String),
}

fn describe_invalid(items: &[InvalidConnection]) -> String {
    items
        .iter()
        .map(|c| {
            let end = match c.endpoint {
                Endpoint::Source => "source",
                Endpoint::Target => "target",
            };
            format!("{} ({} '{}')", c.connection_id, end, c.step_id)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Failures turning a validated graph into an executable plan.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildError {
    #[error("step '{step_id}' has unknown type '{type_id}'")]
    StepResolutionFailed { step_id: String, type_id: String },
}

/// Structured execution-level error body.
///
/// Stored on a failed/timed-out/cancelled execution so consumers can branch
/// on `type` instead of parsing a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub error_type: String,
    pub details: Value,
}

impl ErrorBody {
    pub fn new(error_type: impl Into<String>, details: Value) -> Self {
        Self {
            error_type: error_type.into(),
            details,
        }
    }

    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::new(
            "timeout",
            serde_json::json!({
                "timeout_seconds": timeout_seconds,
                "message": format!("Execution timed out after {} seconds", timeout_seconds),
            }),
        )
    }

    pub fn cancelled(reason: &str) -> Self {
        Self::new("cancelled", serde_json::json!({ "reason": reason }))
    }
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        let error_type = match err {
            Error::Graph(_) => "graph_invalid",
            Error::Build(_) => "build_failed",
            _ => "execution_error",
        };
        ErrorBody::new(
            error_type,
            serde_json::json!({
                "code": err.code(),
                "message": err.to_string(),
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cycle = Error::from(GraphError::CycleDetected(vec!["a".into(), "b".into()]));
        assert_eq!(cycle.code(), "CYCLE_DETECTED");
        assert!(cycle.to_string().contains("a, b"));

        let pinned = Error::NodeNotPinned("x".into());
        assert_eq!(pinned.to_json()["error"]["code"], "NODE_NOT_PINNED");
    }

    #[test]
    fn test_invalid_connections_message() {
        let err = GraphError::InvalidConnections(vec![InvalidConnection {
            connection_id: "c1".into(),
            endpoint: Endpoint::Target,
            step_id: "ghost".into(),
        }]);
        assert_eq!(err.to_string(), "invalid connections: c1 (target 'ghost')");
    }

    #[test]
    fn test_error_body_from_build_error() {
        let err = Error::from(BuildError::StepResolutionFailed {
            step_id: "s".into(),
            type_id: "nope".into(),
        });
        let body = ErrorBody::from(&err);
        assert_eq!(body.error_type, "build_failed");
        assert_eq!(body.details["code"], "BUILD_ERROR");
    }
}
