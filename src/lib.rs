//! weft - dataflow workflow execution engine
//!
//! Workflows are graphs of typed steps joined by port-labelled connections.
//! weft validates the graph, compiles it into a shape-aware plan (branches,
//! fan-outs, joins and reduces), and executes it with bounded parallelism,
//! per-step retries and isolated per-item failures. Every step attempt is
//! recorded as a StepExecution row whose state is merged from events, so
//! duplicate or reordered writes converge on the same row.
//!
//! ## Example
//!
//! ```yaml
//! name: order-totals
//!
//! steps:
//!   - id: orders
//!     type: split
//!     config:
//!       field: input.orders
//!
//!   - id: amount
//!     type: set
//!     depends_on: [orders]
//!     config:
//!       fields:
//!         - name: amount
//!           value: "{{ item.amount }}"
//!
//!   - id: total
//!     type: aggregate
//!     depends_on: [amount]
//!     config:
//!       operation: sum
//!       field: amount
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod nodes;
pub mod shutdown;
pub mod storage;
pub mod telemetry;
pub mod workflow;

pub use engine::{Executor, PartialRun, Plan};
pub use error::{Error, Result};
pub use workflow::{parse_workflow, Workflow, WorkflowDraft, WorkflowVersion};
