//! Mutable workflow drafts.
//!
//! A draft is edited step by step and frozen into a [`WorkflowVersion`] on
//! publish. Every edit that touches connections is checked against the graph
//! before the draft is mutated, so a draft never holds a dangling or cyclic
//! connection.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use super::graph::Graph;
use super::types::{Connection, Step, Workflow, WorkflowSettings, WorkflowVersion};
use super::validator::validate_workflow;
use crate::error::{Endpoint, Error, GraphError, InvalidConnection, Result};

/// An editable workflow.
#[derive(Debug, Clone, Default)]
pub struct WorkflowDraft {
    pub name: String,
    pub description: String,
    pub variables: HashMap<String, Value>,
    pub settings: WorkflowSettings,
    steps: Vec<Step>,
    connections: Vec<Connection>,
}

impl WorkflowDraft {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Start a draft from an existing definition (e.g. a published version).
    pub fn from_workflow(workflow: &Workflow) -> Self {
        let mut workflow = workflow.clone();
        workflow.normalize();
        Self {
            name: workflow.name,
            description: workflow.description,
            variables: workflow.variables,
            settings: workflow.settings,
            steps: workflow.steps,
            connections: workflow.connections,
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Mutable access to a step's config and options. The id must not change.
    pub fn step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn add_step(&mut self, mut step: Step) -> Result<()> {
        if step.id.is_empty() {
            return Err(Error::Validation("Step ID cannot be empty".into()));
        }
        if self.steps.iter().any(|s| s.id == step.id) {
            return Err(GraphError::DuplicateStep(step.id).into());
        }

        // depends_on is accepted here too, but goes through add_connection.
        let parents = std::mem::take(&mut step.depends_on);
        let id = step.id.clone();
        self.steps.push(step);
        for parent in parents {
            if let Err(e) = self.add_connection(Connection::new(&parent, &id)) {
                self.remove_step(&id)?;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Remove a step together with every connection touching it.
    pub fn remove_step(&mut self, id: &str) -> Result<Step> {
        let pos = self
            .steps
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| GraphError::UnknownStep(id.to_string()))?;

        self.connections
            .retain(|c| c.source_step_id != id && c.target_step_id != id);
        Ok(self.steps.remove(pos))
    }

    /// Add a connection; rejected without mutation if it references an
    /// unknown step, links a step to itself, or would close a cycle.
    pub fn add_connection(&mut self, mut connection: Connection) -> Result<()> {
        if connection.id.is_empty() {
            connection.id = format!(
                "{}:{}->{}",
                connection.source_step_id, connection.source_output, connection.target_step_id
            );
        }
        if self.connections.iter().any(|c| c.id == connection.id) {
            return Err(Error::Workflow(format!(
                "Connection '{}' already exists",
                connection.id
            )));
        }

        let graph = Graph::build(&self.steps, &self.connections)?;

        let mut invalid = Vec::new();
        for (endpoint, step_id) in [
            (Endpoint::Source, &connection.source_step_id),
            (Endpoint::Target, &connection.target_step_id),
        ] {
            if !graph.contains(step_id) {
                invalid.push(InvalidConnection {
                    connection_id: connection.id.clone(),
                    endpoint,
                    step_id: step_id.clone(),
                });
            }
        }
        if !invalid.is_empty() {
            return Err(GraphError::InvalidConnections(invalid).into());
        }

        let (source, target) = (&connection.source_step_id, &connection.target_step_id);
        if source == target {
            return Err(GraphError::SelfLoop {
                connection_id: connection.id,
                step_id: source.clone(),
            }
            .into());
        }

        if graph.would_create_cycle(source, target) {
            // The would-be cycle: target ~> ... ~> source -> target
            let between = graph.downstream(target);
            let upstream = graph.upstream(source);
            let members = graph
                .step_ids()
                .iter()
                .filter(|id| {
                    *id == source || *id == target || (between.contains(*id) && upstream.contains(*id))
                })
                .cloned()
                .collect();
            return Err(GraphError::CycleDetected(members).into());
        }

        debug!(connection = %connection.id, "Connection added to draft");
        self.connections.push(connection);
        Ok(())
    }

    pub fn remove_connection(&mut self, id: &str) -> Result<Connection> {
        let pos = self
            .connections
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| Error::Workflow(format!("Connection '{}' not found", id)))?;
        Ok(self.connections.remove(pos))
    }

    /// The draft as a plain workflow definition.
    pub fn to_workflow(&self) -> Workflow {
        Workflow {
            name: self.name.clone(),
            description: self.description.clone(),
            variables: self.variables.clone(),
            steps: self.steps.clone(),
            connections: self.connections.clone(),
            settings: self.settings.clone(),
        }
    }

    /// Validate and freeze the draft.
    pub fn publish(&self, version: u32) -> Result<WorkflowVersion> {
        let workflow = self.to_workflow();
        validate_workflow(&workflow)?;
        Ok(WorkflowVersion::new(version, workflow))
    }
}
