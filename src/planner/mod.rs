//! # Pipeline Planner
//!
//! Validates a [`CompositionRequest`] against probed metadata and builds the
//! immutable [`ExecutionPlan`] the engine runs.

pub mod plan;
#[allow(clippy::module_inception)]
pub mod planner;
pub mod request;

pub use plan::{CompositionOp, ExecutionPlan, PlannedStep, StageChain};
pub use planner::Planner;
pub use request::{
    CompositionRequest, Destination, Operation, OutputFormat, RequestOptions, SourceSpec,
    StageInvocation,
};
