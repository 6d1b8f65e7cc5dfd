use crate::cascade::FallbackKind;
use crate::task::Task;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Per-call context handed to a [`WorkerExecutor`]
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub workflow_id: String,
    /// 1 for the first dispatch, incremented by every recovery attempt
    pub attempt: u32,
    /// The breaker abandons the call after this long
    pub timeout: Duration,
    /// Set while the worker is under cascade protection
    pub fallback: Option<FallbackKind>,
}

/// Runs a task on a worker. Implementations wrap the actual vendor or agent
/// call and should honour `ctx.timeout`.
#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    async fn execute(&self, task: &Task, worker_id: &str, ctx: &ExecutionContext) -> anyhow::Result<Value>;
}

/// Turns a raw request into tasks
#[async_trait]
pub trait TaskDecomposer: Send + Sync {
    async fn decompose(&self, raw_request: &str) -> anyhow::Result<Vec<Task>>;
}
