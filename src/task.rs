//! Task model shared by the graph builder, selector and workflow engine.

use crate::core::errors::ErrorCode;
use crate::registry::WorkerCategory;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;

pub type TaskId = String;

/// Lifecycle of a single task inside a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Scheduled,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Scheduled => "SCHEDULED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }
}

/// A unit of work with declared dependencies on tasks of the same workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    /// Worker category this task must run on, if any
    pub category: Option<WorkerCategory>,
    /// Capability tags the assigned worker should offer
    pub required_capabilities: BTreeSet<String>,
    pub dependencies: BTreeSet<TaskId>,
    pub estimated_cost: f64,
    /// Opaque payload handed to the executor
    pub input: Value,
    pub assigned_worker: Option<String>,
    pub status: TaskStatus,
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            category: None,
            required_capabilities: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            estimated_cost: 60.0,
            input: Value::Object(serde_json::Map::new()),
            assigned_worker: None,
            status: TaskStatus::Pending,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_category(mut self, category: WorkerCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.estimated_cost = cost;
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }
}

/// Final result of dispatching a task, including any recovery that ran
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub worker_id: Option<String>,
    pub status: TaskStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub error_code: Option<ErrorCode>,
    /// Error record that describes the failure, if one was reported
    pub record_id: Option<String>,
    pub attempts: u32,
    pub duration: Duration,
}

impl TaskOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }
}
