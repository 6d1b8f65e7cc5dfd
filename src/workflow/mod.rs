//! Workflow Engine
//!
//! Drives a workflow from `ORGANIZED` through `EXECUTING` to `COMPLETED` or
//! `FAILED`. Phases run strictly in order; the tasks of one phase are
//! dispatched concurrently and the phase ends when its slowest task has
//! settled. Any task that is still failed after recovery fails the workflow,
//! and later phases are never scheduled.

mod bridge;
mod dispatch;
mod engine;
mod executor;

pub use dispatch::{Attempt, Dispatcher};
pub use engine::{
    WorkflowEngine, WorkflowEngineBuilder, WorkflowFailure, WorkflowHandle, WorkflowStatus,
    WorkflowStatusReport,
};
pub use executor::{ExecutionContext, TaskDecomposer, WorkerExecutor};
