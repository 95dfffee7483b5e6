//! Execution engine for workflows.
//!
//! A workflow is compiled into a [`Plan`], routed by the [`Scheduler`] and
//! driven by the [`Executor`]. Step rows are written through
//! [`state_merge`], so concurrent or repeated writes converge.

mod executor;
mod map_executor;
pub mod partial;
pub mod plan;
pub mod production;
pub mod reduce;
mod runtime;
pub mod scheduler;
mod scratch;
pub mod state_merge;
pub mod token;

pub use executor::{ExecutionHandle, Executor, RunRegistry};
pub use map_executor::{run_map, MapResult, MapSettings, DEFAULT_BATCH_SIZE, DEFAULT_MAX_MAP_ITEMS};
pub use partial::{build_downstream, filter_connections, plan_subset, PartialRun};
pub use plan::{NodeShape, Plan, PlanNode, ReduceMode};
pub use reduce::{Accumulator, ReduceOp};
pub use runtime::{ContextProvider, PreparedStep, StepRuntime, DEFAULT_EXPRESSION_TIMEOUT};
pub use scheduler::{Activation, Completion, Scheduler, Work};
pub use scratch::{ScratchKind, ScratchScope, ScratchStore};
pub use state_merge::{MergeOutcome, MergedState, StepEvent};
pub use token::{FanOutPosition, FanOutStack, Item, ItemCounters, Token};
