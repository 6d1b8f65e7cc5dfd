//! Failure messages flowing through the engine into category and recovery strategy

mod common;

use bulwark::aggregator::{ErrorCategory, RecoveryStrategy};
use bulwark::{ErrorCode, Task, WorkerCategory, WorkflowStatus};
use common::{engine_with, test_config, ScriptedExecutor};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_permission_denied_goes_to_manual() {
    let executor = Arc::new(ScriptedExecutor::new().always_fail_worker("w1", "permission denied"));
    let engine = engine_with(executor.clone(), test_config(), &[("w1", WorkerCategory::AiAgent)]);

    let handle = engine.submit(vec![Task::new("t", "")]).unwrap();
    let report = engine.wait(&handle, WAIT).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Failed);
    assert_eq!(report.failure.unwrap().code, ErrorCode::TaskFailed);

    // MANUAL never re-dispatches
    assert_eq!(executor.calls().len(), 1);
    let records = engine.aggregator().records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].category, ErrorCategory::Security);
    assert_eq!(records[0].message, "permission denied");
    assert_eq!(records[0].strategy, Some(RecoveryStrategy::Manual));
    assert!(!records[0].resolved);
    assert_eq!(engine.recovery().stats().escalated, 0);
}

#[tokio::test]
async fn test_connection_refused_restarts_worker() {
    let executor = Arc::new(ScriptedExecutor::new().fail_worker("solo", 1, "connection refused"));
    let engine = engine_with(executor.clone(), test_config(), &[("solo", WorkerCategory::AiAgent)]);

    let handle = engine.submit(vec![Task::new("t", "")]).unwrap();
    let report = engine.wait(&handle, WAIT).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);

    let attempts: Vec<_> = executor.calls().into_iter().map(|c| c.attempt).collect();
    assert_eq!(attempts, vec![1, 2]);
    let records = engine.aggregator().records();
    assert_eq!(records[0].category, ErrorCategory::Infrastructure);
    assert_eq!(records[0].strategy, Some(RecoveryStrategy::Restart));
    assert!(records[0].resolved);
}

#[tokio::test]
async fn test_worker_id_does_not_drive_classification() {
    let executor = Arc::new(ScriptedExecutor::new().always_fail_worker("database-writer", "boom"));
    let engine = engine_with(
        executor.clone(),
        test_config(),
        &[
            ("database-writer", WorkerCategory::AiAgent),
            ("dns-relay", WorkerCategory::AiAgent),
        ],
    );

    let handle = engine.submit(vec![Task::new("t", "")]).unwrap();
    let report = engine.wait(&handle, WAIT).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);

    // unmatched message: worker failure, moved to the other agent
    let workers: Vec<_> = executor.calls().into_iter().map(|c| c.worker_id).collect();
    assert_eq!(workers, vec!["database-writer", "dns-relay"]);
    let records = engine.aggregator().records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].worker_id, "database-writer");
    assert_eq!(records[0].message, "boom");
    assert_eq!(records[0].category, ErrorCategory::AgentFailure);
    assert_eq!(records[0].strategy, Some(RecoveryStrategy::Failover));
}

#[tokio::test]
async fn test_embedded_status_codes_are_not_keywords() {
    let executor = Arc::new(ScriptedExecutor::new().always_fail_worker("w1", "err 4010"));
    let engine = engine_with(
        executor.clone(),
        test_config(),
        &[("w1", WorkerCategory::AiAgent), ("w2", WorkerCategory::AiAgent)],
    );

    let handle = engine.submit(vec![Task::new("t", "")]).unwrap();
    let report = engine.wait(&handle, WAIT).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);

    let records = engine.aggregator().records();
    assert_eq!(records[0].category, ErrorCategory::AgentFailure);
    assert_eq!(records[0].strategy, Some(RecoveryStrategy::Failover));
}
