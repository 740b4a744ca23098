//! Planning module for infrastructure changes.
//!
//! This module compares the desired graph with stored state, orders the
//! resulting steps into a plan, and applies plans against providers.

mod diff;
mod plan;
mod scheduler;
mod executor;

pub use diff::{AttributeChange, ChangeKind, DiffEngine, DiffResult, PlannedValue, ResourceChange};
pub use plan::{Plan, PlanStep, PlanSummary, StepKind};
pub use scheduler::{PlanScheduler, Schedule, StepStatus};
pub use executor::{
    ApplyExecutor, ApplyReport, DEFAULT_CONCURRENCY, RetryPolicy, StepOutcome, StepReport,
};
