//! Recovery Orchestrator
//!
//! Chooses a strategy from the failure's error category and runs it:
//!
//! - `RETRY` re-invokes the task on the same worker with exponential backoff.
//! - `FAILOVER` moves the task to the next-best worker, excluding every worker
//!   already tried.
//! - `ROLLBACK` runs the compensating action registered for the task.
//! - `RESTART` cycles the worker OFFLINE then READY, clears its breaker and
//!   re-runs the task once as verification.
//! - `MANUAL` leaves the record unresolved.
//!
//! An automated strategy that cannot verify success escalates to `MANUAL`.

use crate::aggregator::{ErrorAggregator, ErrorCategory, ErrorRecord, RecoveryStrategy};
use crate::breaker::BreakerKey;
use crate::core::config::RecoverySettings;
use crate::core::errors::{BulwarkError, ErrorCode};
use crate::task::{Task, TaskId};
use crate::workflow::{Attempt, Dispatcher};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Undoes the partial side effects of a failed task
#[async_trait]
pub trait CompensatingAction: Send + Sync {
    async fn compensate(&self, task: &Task) -> anyhow::Result<()>;
}

/// A failed task handed to [`RecoveryOrchestrator::recover`]
#[derive(Debug, Clone, Copy)]
pub struct RecoveryRequest<'a> {
    pub workflow_id: &'a str,
    pub task: &'a Task,
    pub failed_worker: &'a str,
    pub record: &'a ErrorRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub strategy: RecoveryStrategy,
    /// The task now has a successful output
    pub succeeded: bool,
    /// The error record was marked resolved
    pub resolved: bool,
    /// An automated strategy failed verification and fell back to MANUAL
    pub escalated: bool,
    pub compensated: bool,
    pub worker_id: Option<String>,
    pub output: Option<Value>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_code: Option<ErrorCode>,
}

impl RecoveryOutcome {
    fn new(strategy: RecoveryStrategy) -> Self {
        Self {
            strategy,
            succeeded: false,
            resolved: false,
            escalated: false,
            compensated: false,
            worker_id: None,
            output: None,
            attempts: 0,
            last_error: None,
            last_code: None,
        }
    }

    /// Error surfaced to the workflow when the task stays failed
    pub fn failure(&self, task_id: &str, record_id: &str) -> BulwarkError {
        if self.escalated {
            BulwarkError::recovery_exhausted(task_id, self.strategy.as_str(), self.attempts)
        } else {
            BulwarkError::task_failed(
                task_id,
                Some(record_id.to_string()),
                self.last_error
                    .clone()
                    .unwrap_or_else(|| format!("unresolved after {}", self.strategy)),
            )
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub attempted: u64,
    pub succeeded: u64,
    pub escalated: u64,
    pub success_rate: f64,
}

pub struct RecoveryOrchestrator {
    settings: RecoverySettings,
    dispatcher: Arc<Dispatcher>,
    aggregator: Arc<ErrorAggregator>,
    compensations: DashMap<TaskId, Arc<dyn CompensatingAction>>,
    attempted: AtomicU64,
    succeeded: AtomicU64,
    escalated: AtomicU64,
}

impl RecoveryOrchestrator {
    pub fn new(
        settings: RecoverySettings,
        dispatcher: Arc<Dispatcher>,
        aggregator: Arc<ErrorAggregator>,
    ) -> Self {
        Self {
            settings,
            dispatcher,
            aggregator,
            compensations: DashMap::new(),
            attempted: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            escalated: AtomicU64::new(0),
        }
    }

    pub fn strategy_for(&self, category: ErrorCategory) -> RecoveryStrategy {
        self.settings
            .strategy_overrides
            .get(&category)
            .copied()
            .unwrap_or_else(|| category.default_strategy())
    }

    pub fn register_compensation(&self, task_id: impl Into<TaskId>, action: Arc<dyn CompensatingAction>) {
        self.compensations.insert(task_id.into(), action);
    }

    pub fn has_compensation(&self, task_id: &str) -> bool {
        self.compensations.contains_key(task_id)
    }

    fn attempt_timeout(&self) -> Duration {
        self.dispatcher
            .breakers()
            .call_timeout()
            .min(self.settings.verification_timeout)
    }

    pub async fn recover(&self, request: RecoveryRequest<'_>) -> RecoveryOutcome {
        let strategy = self.strategy_for(request.record.category);
        self.attempted.fetch_add(1, Ordering::Relaxed);
        info!(
            workflow_id = %request.workflow_id,
            task_id = %request.task.id,
            worker_id = %request.failed_worker,
            strategy = strategy.as_str(),
            category = request.record.category.as_str(),
            "Starting recovery"
        );

        let mut outcome = match strategy {
            RecoveryStrategy::Retry => self.retry(&request).await,
            RecoveryStrategy::Failover => self.failover(&request).await,
            RecoveryStrategy::Rollback => self.rollback(&request).await,
            RecoveryStrategy::Restart => self.restart(&request).await,
            RecoveryStrategy::Manual => RecoveryOutcome::new(RecoveryStrategy::Manual),
        };

        if outcome.succeeded || outcome.compensated {
            if self.aggregator.resolve(&request.record.id, strategy).is_ok() {
                outcome.resolved = true;
            }
            if outcome.succeeded {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            if strategy.is_automated() {
                outcome.escalated = true;
                self.escalated.fetch_add(1, Ordering::Relaxed);
                warn!(
                    task_id = %request.task.id,
                    strategy = strategy.as_str(),
                    attempts = outcome.attempts,
                    "Recovery failed verification, escalating to MANUAL"
                );
            }
            // the record may have aged out of retention; nothing to mark then
            let _ = self
                .aggregator
                .set_strategy(&request.record.id, RecoveryStrategy::Manual);
        }
        outcome
    }

    async fn retry(&self, request: &RecoveryRequest<'_>) -> RecoveryOutcome {
        let mut outcome = RecoveryOutcome::new(RecoveryStrategy::Retry);
        for attempt in 1..=self.settings.max_retry_attempts {
            let delay = self.settings.backoff_for(attempt);
            debug!(task_id = %request.task.id, attempt = attempt, delay_ms = delay.as_millis() as u64, "Retry backoff");
            tokio::time::sleep(delay).await;

            outcome.attempts = attempt;
            let Some(guard) = self.dispatcher.reserve_worker(request.failed_worker) else {
                outcome.last_error = Some(format!("worker {} has no free capacity", request.failed_worker));
                outcome.last_code = Some(ErrorCode::NoWorkerAvailable);
                continue;
            };
            let result = self
                .dispatcher
                .execute(request.workflow_id, request.task, guard, attempt + 1, self.attempt_timeout())
                .await;
            if self.settle(&mut outcome, result) {
                break;
            }
        }
        outcome
    }

    async fn failover(&self, request: &RecoveryRequest<'_>) -> RecoveryOutcome {
        let mut outcome = RecoveryOutcome::new(RecoveryStrategy::Failover);
        let mut tried: HashSet<String> = HashSet::from([request.failed_worker.to_string()]);

        for attempt in 1..=self.settings.max_failover_attempts {
            let guard = match self.dispatcher.reserve(request.task, &tried) {
                Ok(guard) => guard,
                Err(err) => {
                    debug!(task_id = %request.task.id, "No failover candidate left");
                    outcome.last_code = Some(err.code());
                    outcome.last_error = Some(err.to_string());
                    break;
                }
            };
            tried.insert(guard.worker_id().to_string());
            outcome.attempts = attempt;
            let result = self
                .dispatcher
                .execute(request.workflow_id, request.task, guard, attempt + 1, self.attempt_timeout())
                .await;
            if self.settle(&mut outcome, result) {
                break;
            }
        }
        outcome
    }

    async fn rollback(&self, request: &RecoveryRequest<'_>) -> RecoveryOutcome {
        let mut outcome = RecoveryOutcome::new(RecoveryStrategy::Rollback);
        let Some(action) = self.compensations.get(&request.task.id).map(|a| Arc::clone(a.value())) else {
            outcome.last_error = Some(format!("no compensating action registered for task {}", request.task.id));
            return outcome;
        };

        outcome.attempts = 1;
        match tokio::time::timeout(self.settings.verification_timeout, action.compensate(request.task)).await {
            Ok(Ok(())) => {
                info!(task_id = %request.task.id, "Compensating action completed");
                outcome.compensated = true;
            }
            Ok(Err(err)) => {
                outcome.last_error = Some(format!("compensation failed: {:#}", err));
            }
            Err(_) => {
                outcome.last_code = Some(ErrorCode::Timeout);
                outcome.last_error = Some(
                    BulwarkError::timeout("compensation", self.settings.verification_timeout).to_string(),
                );
            }
        }
        outcome
    }

    async fn restart(&self, request: &RecoveryRequest<'_>) -> RecoveryOutcome {
        let mut outcome = RecoveryOutcome::new(RecoveryStrategy::Restart);
        let worker_id = request.failed_worker;
        let registry = self.dispatcher.registry();

        if let Err(err) = registry.set_offline(worker_id, true) {
            outcome.last_code = Some(err.code());
            outcome.last_error = Some(err.to_string());
            return outcome;
        }
        // a worker breaker may not exist yet if the failure never reached it
        let _ = self.dispatcher.breakers().reset(&BreakerKey::worker(worker_id));
        if let Err(err) = registry.set_offline(worker_id, false) {
            outcome.last_code = Some(err.code());
            outcome.last_error = Some(err.to_string());
            return outcome;
        }
        info!(worker_id = %worker_id, "Worker restarted");

        outcome.attempts = 1;
        let Some(guard) = self.dispatcher.reserve_worker(worker_id) else {
            outcome.last_code = Some(ErrorCode::NoWorkerAvailable);
            outcome.last_error = Some(format!("worker {} has no free capacity after restart", worker_id));
            return outcome;
        };
        let result = self
            .dispatcher
            .execute(request.workflow_id, request.task, guard, 2, self.attempt_timeout())
            .await;
        self.settle(&mut outcome, result);
        outcome
    }

    /// Fold one attempt into the outcome. Returns true on success.
    fn settle(&self, outcome: &mut RecoveryOutcome, attempt: Attempt) -> bool {
        match attempt.result {
            Ok(output) => {
                self.aggregator.record_success(&attempt.worker_id, attempt.latency);
                outcome.succeeded = true;
                outcome.worker_id = Some(attempt.worker_id);
                outcome.output = Some(output);
                outcome.last_error = None;
                outcome.last_code = None;
                true
            }
            Err(err) => {
                debug!(worker_id = %attempt.worker_id, error = %err, "Recovery attempt failed");
                self.dispatcher
                    .registry()
                    .record_outcome(&attempt.worker_id, false, attempt.latency);
                outcome.worker_id = Some(attempt.worker_id);
                outcome.last_code = Some(err.code());
                outcome.last_error = Some(err.to_string());
                false
            }
        }
    }

    pub fn stats(&self) -> RecoveryStats {
        let attempted = self.attempted.load(Ordering::Relaxed);
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        RecoveryStats {
            attempted,
            succeeded,
            escalated: self.escalated.load(Ordering::Relaxed),
            success_rate: if attempted == 0 {
                1.0
            } else {
                succeeded as f64 / attempted as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::FailureReport;
    use crate::breaker::BreakerTable;
    use crate::cascade::CascadeGuard;
    use crate::core::config::{AggregatorSettings, BreakerSettings, CascadeSettings};
    use crate::events::EventBus;
    use crate::registry::{WorkerCategory, WorkerRegistry, WorkerSpec};
    use crate::selector::WorkerSelector;
    use crate::workflow::{ExecutionContext, WorkerExecutor};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::collections::VecDeque;

    /// Pops a scripted result per worker; succeeds once the script runs out
    #[derive(Default)]
    struct Scripted {
        scripts: Mutex<HashMap<String, VecDeque<bool>>>,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn fail(self, worker: &str, times: usize) -> Self {
            self.scripts
                .lock()
                .insert(worker.to_string(), std::iter::repeat(false).take(times).collect());
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl WorkerExecutor for Scripted {
        async fn execute(&self, task: &Task, worker_id: &str, _ctx: &ExecutionContext) -> anyhow::Result<Value> {
            self.calls.lock().push(worker_id.to_string());
            let ok = self
                .scripts
                .lock()
                .get_mut(worker_id)
                .and_then(|s| s.pop_front())
                .unwrap_or(true);
            if ok {
                Ok(serde_json::json!({ "task": task.id, "worker": worker_id }))
            } else {
                anyhow::bail!("scripted failure on {}", worker_id)
            }
        }
    }

    struct Harness {
        recovery: RecoveryOrchestrator,
        aggregator: Arc<ErrorAggregator>,
        registry: Arc<WorkerRegistry>,
        executor: Arc<Scripted>,
    }

    fn harness(executor: Scripted, workers: &[(&str, WorkerCategory)]) -> Harness {
        let registry = Arc::new(WorkerRegistry::default());
        for (id, cat) in workers {
            registry.register(WorkerSpec::new(*id, *cat)).unwrap();
        }
        let events = Arc::new(EventBus::new(64));
        let breakers = Arc::new(BreakerTable::new(BreakerSettings::default()));
        let cascade = Arc::new(CascadeGuard::new(
            CascadeSettings::default(),
            breakers.clone(),
            registry.clone(),
            events.clone(),
        ));
        let executor = Arc::new(executor);
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            breakers,
            cascade,
            Arc::new(WorkerSelector::default()),
            executor.clone(),
        ));
        let aggregator = Arc::new(ErrorAggregator::new(
            AggregatorSettings::default(),
            registry.clone(),
            events,
        ));
        let settings = RecoverySettings {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            jitter: false,
            ..Default::default()
        };
        Harness {
            recovery: RecoveryOrchestrator::new(settings, dispatcher, aggregator.clone()),
            aggregator,
            registry,
            executor,
        }
    }

    fn record(h: &Harness, worker: &str, category: ErrorCategory) -> ErrorRecord {
        h.aggregator
            .report(FailureReport::new(worker, "boom").with_category(category))
            .record
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_same_worker() {
        let h = harness(Scripted::default().fail("w1", 1), &[("w1", WorkerCategory::AiAgent)]);
        let task = Task::new("t1", "");
        let rec = record(&h, "w1", ErrorCategory::Performance);

        let outcome = h
            .recovery
            .recover(RecoveryRequest {
                workflow_id: "wf",
                task: &task,
                failed_worker: "w1",
                record: &rec,
            })
            .await;

        assert_eq!(outcome.strategy, RecoveryStrategy::Retry);
        assert!(outcome.succeeded && outcome.resolved);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(h.executor.calls(), vec!["w1", "w1"]);
        assert!(h.aggregator.get(&rec.id).unwrap().resolved);
    }

    #[tokio::test]
    async fn test_failover_excludes_failed_worker() {
        let h = harness(
            Scripted::default(),
            &[("w1", WorkerCategory::AiAgent), ("w2", WorkerCategory::AiAgent)],
        );
        let task = Task::new("t1", "");
        let rec = record(&h, "w1", ErrorCategory::Integration);

        let outcome = h
            .recovery
            .recover(RecoveryRequest {
                workflow_id: "wf",
                task: &task,
                failed_worker: "w1",
                record: &rec,
            })
            .await;

        assert_eq!(outcome.strategy, RecoveryStrategy::Failover);
        assert!(outcome.succeeded);
        assert_eq!(outcome.worker_id.as_deref(), Some("w2"));
        assert_eq!(h.executor.calls(), vec!["w2"]);
    }

    #[tokio::test]
    async fn test_failover_without_candidates_escalates() {
        let h = harness(Scripted::default(), &[("w1", WorkerCategory::AiAgent)]);
        let task = Task::new("t1", "");
        let rec = record(&h, "w1", ErrorCategory::AgentFailure);

        let outcome = h
            .recovery
            .recover(RecoveryRequest {
                workflow_id: "wf",
                task: &task,
                failed_worker: "w1",
                record: &rec,
            })
            .await;

        assert!(outcome.escalated);
        assert!(!outcome.succeeded);
        let err = outcome.failure("t1", &rec.id);
        assert_eq!(err.code(), ErrorCode::RecoveryExhausted);
        assert_eq!(h.aggregator.get(&rec.id).unwrap().strategy, Some(RecoveryStrategy::Manual));
        assert_eq!(h.recovery.stats().escalated, 1);
    }

    struct Undo(Mutex<u32>);

    #[async_trait]
    impl CompensatingAction for Undo {
        async fn compensate(&self, _task: &Task) -> anyhow::Result<()> {
            *self.0.lock() += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_rollback_resolves_without_success() {
        let h = harness(Scripted::default(), &[("w1", WorkerCategory::Database)]);
        let task = Task::new("t1", "");
        let undo = Arc::new(Undo(Mutex::new(0)));
        h.recovery.register_compensation("t1", undo.clone());
        let rec = record(&h, "w1", ErrorCategory::ConstraintViolation);

        let outcome = h
            .recovery
            .recover(RecoveryRequest {
                workflow_id: "wf",
                task: &task,
                failed_worker: "w1",
                record: &rec,
            })
            .await;

        assert!(outcome.compensated && outcome.resolved);
        assert!(!outcome.succeeded && !outcome.escalated);
        assert_eq!(*undo.0.lock(), 1);
        assert_eq!(outcome.failure("t1", &rec.id).code(), ErrorCode::TaskFailed);
    }

    #[tokio::test]
    async fn test_rollback_without_compensation_escalates() {
        let h = harness(Scripted::default(), &[("w1", WorkerCategory::Database)]);
        let task = Task::new("t1", "");
        let rec = record(&h, "w1", ErrorCategory::ConstraintViolation);
        let outcome = h
            .recovery
            .recover(RecoveryRequest {
                workflow_id: "wf",
                task: &task,
                failed_worker: "w1",
                record: &rec,
            })
            .await;
        assert!(outcome.escalated);
        assert!(h.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_restart_cycles_worker_and_verifies() {
        let h = harness(Scripted::default(), &[("w1", WorkerCategory::Infrastructure)]);
        h.registry.set_breaker_open("w1", true);
        let task = Task::new("t1", "");
        let rec = record(&h, "w1", ErrorCategory::Infrastructure);

        let outcome = h
            .recovery
            .recover(RecoveryRequest {
                workflow_id: "wf",
                task: &task,
                failed_worker: "w1",
                record: &rec,
            })
            .await;

        assert_eq!(outcome.strategy, RecoveryStrategy::Restart);
        assert!(outcome.succeeded);
        assert_eq!(h.registry.get("w1").unwrap().status, crate::registry::WorkerStatus::Ready);
    }

    #[tokio::test]
    async fn test_manual_is_not_escalation() {
        let h = harness(Scripted::default(), &[("w1", WorkerCategory::Database)]);
        let task = Task::new("t1", "");
        let rec = record(&h, "w1", ErrorCategory::Security);
        let outcome = h
            .recovery
            .recover(RecoveryRequest {
                workflow_id: "wf",
                task: &task,
                failed_worker: "w1",
                record: &rec,
            })
            .await;
        assert_eq!(outcome.strategy, RecoveryStrategy::Manual);
        assert!(!outcome.escalated && !outcome.resolved);
        assert!(h.executor.calls().is_empty());
        assert_eq!(h.aggregator.active_count(), 1);
    }

    #[test]
    fn test_strategy_overrides() {
        let h = harness(Scripted::default(), &[]);
        assert_eq!(h.recovery.strategy_for(ErrorCategory::Data), RecoveryStrategy::Manual);

        let mut settings = RecoverySettings::default();
        settings
            .strategy_overrides
            .insert(ErrorCategory::Data, RecoveryStrategy::Retry);
        let recovery = RecoveryOrchestrator::new(
            settings,
            h.recovery.dispatcher.clone(),
            h.aggregator.clone(),
        );
        assert_eq!(recovery.strategy_for(ErrorCategory::Data), RecoveryStrategy::Retry);
    }
}
