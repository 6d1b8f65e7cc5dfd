//! Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use bulwark::cascade::FallbackKind;
use bulwark::{
    ExecutionContext, OrchestratorConfig, Task, WorkerCategory, WorkerExecutor, WorkerSpec,
    WorkflowEngine,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// One call as seen by the executor
#[derive(Debug, Clone)]
pub struct Call {
    pub task_id: String,
    pub worker_id: String,
    pub attempt: u32,
    pub fallback: Option<FallbackKind>,
}

/// Executor whose behaviour is scripted per worker and per task.
///
/// Workers fail a fixed number of times (or forever) with a chosen message;
/// tasks can be made to always fail or to take a while.
#[derive(Default)]
pub struct ScriptedExecutor {
    worker_failures: Mutex<HashMap<String, (Option<u32>, String)>>,
    failing_tasks: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls on `worker_id` with `message`
    pub fn fail_worker(self, worker_id: &str, times: u32, message: &str) -> Self {
        self.worker_failures
            .lock()
            .insert(worker_id.to_string(), (Some(times), message.to_string()));
        self
    }

    pub fn always_fail_worker(self, worker_id: &str, message: &str) -> Self {
        self.worker_failures
            .lock()
            .insert(worker_id.to_string(), (None, message.to_string()));
        self
    }

    pub fn always_fail_task(self, task_id: &str) -> Self {
        self.failing_tasks.lock().insert(task_id.to_string());
        self
    }

    pub fn delay_task(self, task_id: &str, delay: Duration) -> Self {
        self.delays.lock().insert(task_id.to_string(), delay);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, task_id: &str) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.task_id == task_id)
            .cloned()
            .collect()
    }

    fn should_fail(&self, task_id: &str, worker_id: &str) -> Option<String> {
        if self.failing_tasks.lock().contains(task_id) {
            return Some(format!("scripted failure for task {}", task_id));
        }
        let mut failures = self.worker_failures.lock();
        match failures.get_mut(worker_id) {
            Some((None, message)) => Some(message.clone()),
            Some((Some(remaining), message)) if *remaining > 0 => {
                *remaining -= 1;
                Some(message.clone())
            }
            _ => None,
        }
    }
}

#[async_trait]
impl WorkerExecutor for ScriptedExecutor {
    async fn execute(&self, task: &Task, worker_id: &str, ctx: &ExecutionContext) -> anyhow::Result<Value> {
        self.calls.lock().push(Call {
            task_id: task.id.clone(),
            worker_id: worker_id.to_string(),
            attempt: ctx.attempt,
            fallback: ctx.fallback,
        });

        let delay = self.delays.lock().get(&task.id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = self.should_fail(&task.id, worker_id) {
            anyhow::bail!(message);
        }
        Ok(json!({ "task": task.id, "worker": worker_id }))
    }
}

/// Development preset with recovery backoff short enough for tests
pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::development();
    config.recovery.initial_backoff = Duration::from_millis(1);
    config.recovery.max_backoff = Duration::from_millis(5);
    config.breaker.call_timeout = Duration::from_secs(2);
    config
}

pub fn engine_with(
    executor: Arc<ScriptedExecutor>,
    config: OrchestratorConfig,
    workers: &[(&str, WorkerCategory)],
) -> Arc<WorkflowEngine> {
    let engine = WorkflowEngine::builder(executor)
        .with_config(config)
        .build()
        .unwrap();
    for (id, category) in workers {
        engine
            .register_worker(WorkerSpec::new(*id, *category).with_max_concurrent(4))
            .unwrap();
    }
    engine
}

/// `A`, `B` independent; `C` depends on both
pub fn diamond_tasks() -> Vec<Task> {
    vec![
        Task::new("A", "first input"),
        Task::new("B", "second input"),
        Task::new("C", "combine").with_dependencies(["A", "B"]),
    ]
}
