//! Step executors.
//!
//! Steps are the building blocks of workflows. Each step type is an executor
//! registered under its `type_id`; the built-ins here cover the structural
//! shapes the engine plans around (pass-through, branching, fan-out, fan-in).

mod aggregate;
mod identity;
mod if_node;
mod registry;
mod set;
mod split;
mod switch;
pub mod template;
mod types;
mod wait;

pub use aggregate::AggregateStep;
pub use identity::IdentityStep;
pub use if_node::IfStep;
pub use registry::StepRegistry;
pub use set::SetStep;
pub use split::SplitStep;
pub use switch::SwitchStep;
pub use template::{ExpressionEvaluator, TemplateEvaluator};
pub use types::{
    StepContext, StepExecutor, StepFailure, StepFailureKind, StepKind, StepOutcome, StepOutput,
};
pub use wait::WaitStep;
