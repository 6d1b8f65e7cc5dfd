// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
    pub mod logging;
}

pub mod task;

// Fault isolation
pub mod breaker; // per-worker and per-category circuit breakers
pub mod cascade; // dependent-worker protection
pub mod registry; // workers, load and rolling performance

// Planning and assignment
pub mod graph; // DAG validation, phases and critical path
pub mod selector; // weighted worker ranking

// Failure handling
pub mod aggregator; // classification, correlation and cascade risk
pub mod recovery; // retry, failover, rollback, restart, manual

pub mod events;
pub mod metrics;
pub mod workflow;

// Re-exports for convenience
pub use core::config::OrchestratorConfig;
pub use core::errors::{BulwarkError, ErrorCode, Result};
pub use events::{Event, EventEnvelope, EventSink};
pub use registry::{WorkerCategory, WorkerRegistry, WorkerSpec, WorkerStatus};
pub use task::{Task, TaskId, TaskOutcome, TaskStatus};
pub use workflow::{
    ExecutionContext, TaskDecomposer, WorkerExecutor, WorkflowEngine, WorkflowHandle,
    WorkflowStatus, WorkflowStatusReport,
};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    struct ExampleWorker;

    #[async_trait]
    impl WorkerExecutor for ExampleWorker {
        async fn execute(&self, task: &Task, worker_id: &str, ctx: &ExecutionContext) -> anyhow::Result<Value> {
            Ok(json!({
                "response": format!("{} handled {}", worker_id, task.description),
                "attempt": ctx.attempt,
            }))
        }
    }

    #[tokio::test]
    async fn test_basic_workflow() {
        let engine = WorkflowEngine::builder(Arc::new(ExampleWorker))
            .build()
            .unwrap();
        engine
            .register_worker(WorkerSpec::new("voice", WorkerCategory::ExternalApi).with_capabilities(["tts"]))
            .unwrap();
        engine
            .register_worker(WorkerSpec::new("writer", WorkerCategory::AiAgent).with_capabilities(["script"]))
            .unwrap();

        let tasks = vec![
            Task::new("script", "write the script").with_capabilities(["script"]),
            Task::new("narrate", "record narration")
                .with_capabilities(["tts"])
                .with_dependencies(["script"]),
        ];
        let handle = engine.submit(tasks).unwrap();
        let report = engine.wait(&handle, Duration::from_secs(5)).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Completed);

        let tasks = engine.tasks(&handle).unwrap();
        assert_eq!(tasks[0].assigned_worker.as_deref(), Some("writer"));
        assert_eq!(tasks[1].assigned_worker.as_deref(), Some("voice"));

        let outcomes = engine.outcomes(&handle).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].output.as_ref().unwrap()["attempt"], 1);
    }
}
