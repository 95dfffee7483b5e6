//! Workflow definition, parsing, and validation.
//!
//! Workflows are defined in YAML format and consist of:
//! - Steps: The units of work, each with a registered type
//! - Connections: Data-flow edges between step ports
//! - Settings: Global configuration

mod draft;
mod graph;
mod parser;
mod types;
mod validator;

pub use draft::WorkflowDraft;
pub use graph::Graph;
pub use parser::{parse_workflow, parse_workflow_file};
pub use types::*;
pub use validator::{validate_step_types, validate_workflow};
