use super::bridge::BreakerBridge;
use super::dispatch::Dispatcher;
use super::executor::{TaskDecomposer, WorkerExecutor};
use crate::aggregator::{ErrorAggregator, ErrorRecord, FailureReport, RiskLevel};
use crate::breaker::BreakerTable;
use crate::cascade::CascadeGuard;
use crate::core::config::OrchestratorConfig;
use crate::core::errors::{BulwarkError, ErrorCode, Result};
use crate::events::{Event, EventBus, EventSink, EventSubscription};
use crate::graph::{build_plan, ExecutionPlan};
use crate::metrics::{MetricsSnapshot, OrchestratorMetrics, SystemHealth};
use crate::recovery::{RecoveryOrchestrator, RecoveryRequest};
use crate::registry::{WorkerRegistry, WorkerSpec};
use crate::selector::{ScoringStrategy, WeightedScorer, WorkerSelector};
use crate::task::{Task, TaskId, TaskOutcome, TaskStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Organized,
    Executing,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Organized => "ORGANIZED",
            Self::Executing => "EXECUTING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

/// Identifier returned by submit, used for status polling and cancellation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowHandle(String);

impl WorkflowHandle {
    pub fn id(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkflowHandle {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for WorkflowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a workflow ended FAILED
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowFailure {
    pub code: ErrorCode,
    pub message: String,
    pub task_id: Option<TaskId>,
    pub record_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatusReport {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub progress_percent: u8,
    pub risk_level: RiskLevel,
    pub risk_score: f64,
    pub phase_count: usize,
    /// Index of the phase being executed, or the last one that ran
    pub current_phase: Option<usize>,
    pub tasks_total: usize,
    pub tasks_succeeded: usize,
    pub tasks_failed: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure: Option<WorkflowFailure>,
}

#[derive(Debug)]
struct WorkflowRecord {
    id: String,
    plan: ExecutionPlan,
    tasks: HashMap<TaskId, Task>,
    outcomes: Vec<TaskOutcome>,
    status: WorkflowStatus,
    risk_score: f64,
    current_phase: Option<usize>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    failure: Option<WorkflowFailure>,
}

impl WorkflowRecord {
    fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    fn progress(&self, organized_progress: u8) -> u8 {
        match self.status {
            WorkflowStatus::Organized => organized_progress,
            WorkflowStatus::Completed => 100,
            _ => {
                let total = self.tasks.len().max(1) as f64;
                let succeeded = self.count(TaskStatus::Succeeded) as f64;
                (succeeded / total * 100.0).round() as u8
            }
        }
    }

    fn report(&self, organized_progress: u8) -> WorkflowStatusReport {
        WorkflowStatusReport {
            workflow_id: self.id.clone(),
            status: self.status,
            progress_percent: self.progress(organized_progress),
            risk_level: RiskLevel::from_score(self.risk_score),
            risk_score: self.risk_score,
            phase_count: self.plan.phases.len(),
            current_phase: self.current_phase,
            tasks_total: self.tasks.len(),
            tasks_succeeded: self.count(TaskStatus::Succeeded),
            tasks_failed: self.count(TaskStatus::Failed),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            failure: self.failure.clone(),
        }
    }
}

struct WorkflowSlot {
    state: Mutex<WorkflowRecord>,
    cancel_requested: AtomicBool,
    status_tx: watch::Sender<WorkflowStatus>,
}

impl WorkflowSlot {
    fn set_task(&self, task_id: &str, status: TaskStatus, worker_id: Option<&str>) {
        let mut state = self.state.lock();
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.status = status;
            if let Some(worker_id) = worker_id {
                task.assigned_worker = Some(worker_id.to_string());
            }
        }
    }
}

pub struct WorkflowEngineBuilder {
    executor: Arc<dyn WorkerExecutor>,
    config: OrchestratorConfig,
    decomposer: Option<Arc<dyn TaskDecomposer>>,
    scorer: Option<Arc<dyn ScoringStrategy>>,
    sinks: Vec<Arc<dyn EventSink>>,
    registry: Option<Arc<WorkerRegistry>>,
}

impl WorkflowEngineBuilder {
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_decomposer(mut self, decomposer: Arc<dyn TaskDecomposer>) -> Self {
        self.decomposer = Some(decomposer);
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn ScoringStrategy>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_registry(mut self, registry: Arc<WorkerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<Arc<WorkflowEngine>> {
        let config = self.config;
        config.validate()?;

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(WorkerRegistry::new(config.engine.performance_window)));
        let events = Arc::new(EventBus::new(config.engine.event_capacity));
        for sink in self.sinks {
            events.add_sink(sink);
        }

        let breakers = Arc::new(BreakerTable::new(config.breaker.clone()));
        let cascade = Arc::new(CascadeGuard::new(
            config.cascade.clone(),
            breakers.clone(),
            registry.clone(),
            events.clone(),
        ));
        breakers.add_observer(Arc::new(BreakerBridge::new(
            &breakers,
            &cascade,
            registry.clone(),
            events.clone(),
        )));

        let aggregator = Arc::new(
            ErrorAggregator::new(config.aggregator.clone(), registry.clone(), events.clone())
                .with_cascade_guard(cascade.clone(), config.cascade.risk_trigger),
        );
        let selector = Arc::new(WorkerSelector::new(
            self.scorer
                .unwrap_or_else(|| Arc::new(WeightedScorer::default())),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            breakers.clone(),
            cascade.clone(),
            selector,
            self.executor,
        ));
        let recovery = Arc::new(RecoveryOrchestrator::new(
            config.recovery.clone(),
            dispatcher.clone(),
            aggregator.clone(),
        ));

        info!(
            max_concurrent_dispatch = config.engine.max_concurrent_dispatch,
            "Workflow engine ready"
        );
        Ok(Arc::new(WorkflowEngine {
            dispatch_limit: Semaphore::new(config.engine.max_concurrent_dispatch.max(1)),
            config,
            registry,
            breakers,
            events,
            cascade,
            aggregator,
            recovery,
            dispatcher,
            decomposer: self.decomposer,
            metrics: OrchestratorMetrics::new(),
            workflows: DashMap::new(),
            archive: Mutex::new(VecDeque::new()),
        }))
    }
}

pub struct WorkflowEngine {
    config: OrchestratorConfig,
    registry: Arc<WorkerRegistry>,
    breakers: Arc<BreakerTable>,
    events: Arc<EventBus>,
    cascade: Arc<CascadeGuard>,
    aggregator: Arc<ErrorAggregator>,
    recovery: Arc<RecoveryOrchestrator>,
    dispatcher: Arc<Dispatcher>,
    decomposer: Option<Arc<dyn TaskDecomposer>>,
    metrics: OrchestratorMetrics,
    dispatch_limit: Semaphore,
    workflows: DashMap<String, Arc<WorkflowSlot>>,
    archive: Mutex<VecDeque<String>>,
}

impl WorkflowEngine {
    pub fn builder(executor: Arc<dyn WorkerExecutor>) -> WorkflowEngineBuilder {
        WorkflowEngineBuilder {
            executor,
            config: OrchestratorConfig::default(),
            decomposer: None,
            scorer: None,
            sinks: Vec::new(),
            registry: None,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<BreakerTable> {
        &self.breakers
    }

    pub fn cascade(&self) -> &Arc<CascadeGuard> {
        &self.cascade
    }

    pub fn aggregator(&self) -> &Arc<ErrorAggregator> {
        &self.aggregator
    }

    pub fn recovery(&self) -> &Arc<RecoveryOrchestrator> {
        &self.recovery
    }

    pub fn register_worker(&self, spec: WorkerSpec) -> Result<()> {
        self.registry.register(spec)
    }

    pub fn declare_dependents<I, S>(&self, source: &str, dependents: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cascade.declare_dependents(source, dependents);
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn health(&self) -> SystemHealth {
        SystemHealth {
            engine: self.metrics.snapshot(),
            breakers: self.breakers.summary(),
            errors: self.aggregator.stats(),
            recovery: self.recovery.stats(),
            cascades_prevented: self.cascade.cascades_prevented(),
            workers: self.registry.len(),
        }
    }

    /// Plan and start a workflow for an already decomposed task graph.
    ///
    /// Structural problems (cycles, unknown dependencies, empty input) are
    /// returned here and no workflow is created. Must be called from within a
    /// tokio runtime.
    pub fn submit(self: &Arc<Self>, tasks: Vec<Task>) -> Result<WorkflowHandle> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| BulwarkError::internal("submit requires a running tokio runtime"))?;

        let plan = match build_plan(&tasks) {
            Ok(plan) => plan,
            Err(err) => {
                self.metrics.record_rejected();
                warn!(code = %err.code(), "Workflow rejected: {}", err);
                return Err(err);
            }
        };

        let id = format!("wf-{}", uuid::Uuid::new_v4());
        let risk_score = self.creation_risk(&plan);
        let (status_tx, _) = watch::channel(WorkflowStatus::Organized);
        let record = WorkflowRecord {
            id: id.clone(),
            tasks: tasks
                .into_iter()
                .map(|mut t| {
                    t.status = TaskStatus::Pending;
                    t.assigned_worker = None;
                    (t.id.clone(), t)
                })
                .collect(),
            outcomes: Vec::new(),
            status: WorkflowStatus::Organized,
            risk_score,
            current_phase: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            failure: None,
            plan,
        };
        let task_count = record.tasks.len();
        let phase_count = record.plan.phases.len();
        let slot = Arc::new(WorkflowSlot {
            state: Mutex::new(record),
            cancel_requested: AtomicBool::new(false),
            status_tx,
        });
        self.workflows.insert(id.clone(), slot.clone());
        self.metrics.record_submitted();

        info!(
            workflow_id = %id,
            tasks = task_count,
            phases = phase_count,
            risk_score = risk_score,
            "Workflow organized"
        );
        self.events.publish(Event::WorkflowCreated {
            workflow_id: id.clone(),
            task_count,
            phase_count,
            risk_level: RiskLevel::from_score(risk_score),
        });

        let engine = Arc::clone(self);
        runtime.spawn(async move {
            engine.run(slot).await;
        });
        Ok(WorkflowHandle(id))
    }

    /// Decompose a raw request and submit the result. A failing or empty
    /// decomposition falls back to a single task covering the whole request.
    pub async fn submit_request(self: &Arc<Self>, raw_request: &str) -> Result<WorkflowHandle> {
        let request_id = format!("req-{}", uuid::Uuid::new_v4().simple());
        let decomposed = match &self.decomposer {
            Some(decomposer) => match decomposer.decompose(raw_request).await {
                Ok(tasks) if !tasks.is_empty() => Some(tasks),
                Ok(_) => {
                    warn!(request_id = %request_id, "Decomposer returned no tasks, using single-task fallback");
                    None
                }
                Err(err) => {
                    warn!(request_id = %request_id, error = %format!("{:#}", err), "Decomposition failed, using single-task fallback");
                    None
                }
            },
            None => None,
        };

        let tasks = decomposed.unwrap_or_else(|| {
            vec![Task::new(format!("{}-task-1", request_id), raw_request)
                .with_cost(self.config.engine.default_estimated_cost)]
        });
        self.submit(tasks)
    }

    fn slot(&self, handle: &WorkflowHandle) -> Result<Arc<WorkflowSlot>> {
        self.workflows
            .get(handle.id())
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| BulwarkError::not_found("workflow", handle.id()))
    }

    /// Current status. Has no side effects.
    pub fn status(&self, handle: &WorkflowHandle) -> Result<WorkflowStatusReport> {
        let slot = self.slot(handle)?;
        let state = slot.state.lock();
        Ok(state.report(self.config.engine.organized_progress))
    }

    /// Tasks with their current status and assigned worker, in plan order
    pub fn tasks(&self, handle: &WorkflowHandle) -> Result<Vec<Task>> {
        let slot = self.slot(handle)?;
        let state = slot.state.lock();
        Ok(state
            .plan
            .phases
            .iter()
            .flat_map(|p| p.tasks.iter())
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect())
    }

    pub fn outcomes(&self, handle: &WorkflowHandle) -> Result<Vec<TaskOutcome>> {
        let slot = self.slot(handle)?;
        let outcomes = slot.state.lock().outcomes.clone();
        Ok(outcomes)
    }

    pub fn plan(&self, handle: &WorkflowHandle) -> Result<ExecutionPlan> {
        let slot = self.slot(handle)?;
        let plan = slot.state.lock().plan.clone();
        Ok(plan)
    }

    /// Request cancellation. Takes effect before the next phase starts;
    /// tasks already dispatched run to completion. Returns false if the
    /// workflow had already finished.
    pub fn cancel(&self, handle: &WorkflowHandle) -> Result<bool> {
        let slot = self.slot(handle)?;
        if slot.state.lock().status.is_terminal() {
            return Ok(false);
        }
        slot.cancel_requested.store(true, Ordering::SeqCst);
        info!(workflow_id = %handle, "Cancellation requested");
        Ok(true)
    }

    /// Wait until the workflow is COMPLETED or FAILED, at most `timeout`.
    /// Terminal events have been published by the time this returns.
    pub async fn wait(&self, handle: &WorkflowHandle, timeout: Duration) -> Result<WorkflowStatusReport> {
        let slot = self.slot(handle)?;
        let mut rx = slot.status_tx.subscribe();
        let finished = tokio::time::timeout(timeout, async {
            loop {
                if rx.borrow_and_update().is_terminal() {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;
        match finished {
            Ok(_) => Ok(slot.state.lock().report(self.config.engine.organized_progress)),
            Err(_) => Err(BulwarkError::timeout(format!("waiting for workflow {}", handle), timeout)),
        }
    }

    pub fn workflow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn creation_risk(&self, plan: &ExecutionPlan) -> f64 {
        let saturation = self.config.aggregator.active_error_saturation.max(1) as f64;
        let error_load = (self.aggregator.active_count() as f64 / saturation).min(1.0);
        let unreliability = 1.0 - self.registry.mean_success_rate();
        (0.4 * plan.complexity + 0.3 * unreliability + 0.3 * error_load).clamp(0.0, 1.0)
    }

    async fn run(self: Arc<Self>, slot: Arc<WorkflowSlot>) {
        let started = Instant::now();
        let (workflow_id, phases) = {
            let mut state = slot.state.lock();
            state.status = WorkflowStatus::Executing;
            state.started_at = Some(Utc::now());
            (state.id.clone(), state.plan.phases.clone())
        };
        slot.status_tx.send_replace(WorkflowStatus::Executing);
        info!(workflow_id = %workflow_id, phases = phases.len(), "Workflow executing");

        let phase_count = phases.len();
        for phase in &phases {
            if slot.cancel_requested.load(Ordering::SeqCst) {
                self.finish_failed(
                    &slot,
                    WorkflowFailure {
                        code: ErrorCode::Cancelled,
                        message: BulwarkError::cancelled(format!("workflow {}", workflow_id)).to_string(),
                        task_id: None,
                        record_id: None,
                    },
                    None,
                );
                return;
            }

            let tasks: Vec<Task> = {
                let mut state = slot.state.lock();
                state.current_phase = Some(phase.index);
                let mut scheduled = Vec::with_capacity(phase.tasks.len());
                for id in &phase.tasks {
                    if let Some(task) = state.tasks.get_mut(id) {
                        task.status = TaskStatus::Scheduled;
                        scheduled.push(task.clone());
                    }
                }
                scheduled
            };
            debug!(workflow_id = %workflow_id, phase = phase.index, tasks = tasks.len(), "Dispatching phase");

            let results = join_all(
                tasks
                    .into_iter()
                    .map(|task| self.run_task(&slot, &workflow_id, task)),
            )
            .await;

            let mut succeeded = Vec::new();
            let mut failed = Vec::new();
            let mut first_failure: Option<(WorkflowFailure, Option<ErrorRecord>)> = None;
            {
                let mut state = slot.state.lock();
                for (outcome, record) in results {
                    if let Some(task) = state.tasks.get_mut(&outcome.task_id) {
                        task.status = outcome.status;
                        if outcome.worker_id.is_some() {
                            task.assigned_worker = outcome.worker_id.clone();
                        }
                    }
                    if outcome.succeeded() {
                        succeeded.push(outcome.task_id.clone());
                    } else {
                        failed.push(outcome.task_id.clone());
                        if let Some(risk) = record.as_ref().map(|r| r.cascade_risk) {
                            state.risk_score = state.risk_score.max(risk);
                        }
                        if first_failure.is_none() {
                            first_failure = Some((
                                WorkflowFailure {
                                    code: outcome.error_code.unwrap_or(ErrorCode::TaskFailed),
                                    message: outcome
                                        .error
                                        .clone()
                                        .unwrap_or_else(|| "task failed".to_string()),
                                    task_id: Some(outcome.task_id.clone()),
                                    record_id: outcome.record_id.clone(),
                                },
                                record,
                            ));
                        }
                    }
                    state.outcomes.push(outcome);
                }
            }

            let progress = slot.state.lock().progress(self.config.engine.organized_progress);
            self.events.publish(Event::WorkflowProgress {
                workflow_id: workflow_id.clone(),
                phase: phase.index + 1,
                phase_count,
                progress_percent: progress,
                succeeded,
                failed,
            });

            if let Some((failure, record)) = first_failure {
                self.finish_failed(&slot, failure, record);
                return;
            }
        }

        let tasks = {
            let mut state = slot.state.lock();
            state.status = WorkflowStatus::Completed;
            state.finished_at = Some(Utc::now());
            state.tasks.len()
        };
        self.metrics.record_completed();
        let duration_ms = started.elapsed().as_millis() as u64;
        info!(workflow_id = %workflow_id, elapsed_ms = duration_ms, "Workflow completed");
        self.events.publish(Event::WorkflowCompleted {
            workflow_id: workflow_id.clone(),
            duration_ms,
            tasks,
        });
        self.archive(workflow_id);
        slot.status_tx.send_replace(WorkflowStatus::Completed);
    }

    fn finish_failed(&self, slot: &WorkflowSlot, failure: WorkflowFailure, record: Option<ErrorRecord>) {
        let workflow_id = {
            let mut state = slot.state.lock();
            state.status = WorkflowStatus::Failed;
            state.finished_at = Some(Utc::now());
            state.failure = Some(failure.clone());
            state.id.clone()
        };
        self.metrics
            .record_failed(failure.code == ErrorCode::Cancelled);
        error!(
            workflow_id = %workflow_id,
            code = %failure.code,
            task_id = failure.task_id.as_deref().unwrap_or("-"),
            "Workflow failed: {}",
            failure.message
        );
        self.events.publish(Event::WorkflowFailed {
            workflow_id: workflow_id.clone(),
            code: failure.code,
            message: failure.message,
            record,
        });
        self.archive(workflow_id);
        slot.status_tx.send_replace(WorkflowStatus::Failed);
    }

    /// Keep at most `max_archived_workflows` finished workflows around
    fn archive(&self, workflow_id: String) {
        let mut archive = self.archive.lock();
        archive.push_back(workflow_id);
        while archive.len() > self.config.engine.max_archived_workflows {
            if let Some(evicted) = archive.pop_front() {
                self.workflows.remove(&evicted);
                debug!(workflow_id = %evicted, "Evicted archived workflow");
            }
        }
    }

    async fn run_task(
        &self,
        slot: &WorkflowSlot,
        workflow_id: &str,
        task: Task,
    ) -> (TaskOutcome, Option<ErrorRecord>) {
        let started = Instant::now();
        let mut outcome = TaskOutcome {
            task_id: task.id.clone(),
            worker_id: None,
            status: TaskStatus::Failed,
            output: None,
            error: None,
            error_code: None,
            record_id: None,
            attempts: 0,
            duration: Duration::ZERO,
        };

        let _permit = match self.dispatch_limit.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                let err = BulwarkError::internal("dispatch pool closed");
                outcome.error_code = Some(err.code());
                outcome.error = Some(err.to_string());
                return (outcome, None);
            }
        };
        self.metrics.record_dispatch();

        let guard = match self.dispatcher.reserve(&task, &HashSet::new()) {
            Ok(guard) => guard,
            Err(err) => {
                // structural: recorded, but never recovered
                warn!(workflow_id = %workflow_id, task_id = %task.id, "{}", err);
                let mut failure = FailureReport::new(String::new(), err.failure_message())
                    .for_task(workflow_id, &task.id)
                    .with_code(err.code());
                if let Some(category) = task.category {
                    failure = failure.with_worker_category(category);
                }
                let record = self.aggregator.report(failure).record;
                outcome.record_id = Some(record.id.clone());
                outcome.error_code = Some(err.code());
                outcome.error = Some(err.to_string());
                outcome.duration = started.elapsed();
                self.metrics.record_task(false, false, outcome.duration);
                return (outcome, Some(record));
            }
        };
        let worker_id = guard.worker_id().to_string();
        slot.set_task(&task.id, TaskStatus::Running, Some(&worker_id));
        outcome.worker_id = Some(worker_id.clone());
        outcome.attempts = 1;

        let attempt = self
            .dispatcher
            .execute(workflow_id, &task, guard, 1, self.breakers.call_timeout())
            .await;

        let err = match attempt.result {
            Ok(output) => {
                self.aggregator.record_success(&worker_id, attempt.latency);
                outcome.status = TaskStatus::Succeeded;
                outcome.output = Some(output);
                outcome.duration = started.elapsed();
                self.metrics.record_task(true, false, outcome.duration);
                debug!(workflow_id = %workflow_id, task_id = %task.id, worker_id = %worker_id, "Task succeeded");
                return (outcome, None);
            }
            Err(err) => err,
        };

        let mut failure = FailureReport::new(&worker_id, err.failure_message())
            .for_task(workflow_id, &task.id)
            .with_code(err.code())
            .with_latency(attempt.latency);
        if let Some(category) = self.registry.category_of(&worker_id) {
            failure = failure.with_worker_category(category);
        }
        let report = self.aggregator.report(failure);
        let record = report.record;
        outcome.record_id = Some(record.id.clone());

        if !err.is_recoverable() {
            let failed = BulwarkError::task_failed(&task.id, Some(record.id.clone()), err.to_string());
            outcome.error_code = Some(failed.code());
            outcome.error = Some(failed.to_string());
            outcome.duration = started.elapsed();
            self.metrics.record_task(false, false, outcome.duration);
            return (outcome, Some(record));
        }

        let recovered = self
            .recovery
            .recover(RecoveryRequest {
                workflow_id,
                task: &task,
                failed_worker: &worker_id,
                record: &record,
            })
            .await;
        outcome.attempts += recovered.attempts;
        outcome.duration = started.elapsed();

        if recovered.succeeded {
            outcome.status = TaskStatus::Succeeded;
            outcome.worker_id = recovered.worker_id;
            outcome.output = recovered.output;
            self.metrics.record_task(true, true, outcome.duration);
            info!(
                workflow_id = %workflow_id,
                task_id = %task.id,
                strategy = recovered.strategy.as_str(),
                "Task recovered"
            );
            return (outcome, None);
        }

        let failed = recovered.failure(&task.id, &record.id);
        outcome.error_code = Some(failed.code());
        outcome.error = Some(failed.to_string());
        self.metrics.record_task(false, false, outcome.duration);
        let record = self.aggregator.get(&record.id).unwrap_or(record);
        (outcome, Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::WorkerCategory;
    use crate::workflow::ExecutionContext;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Echo;

    #[async_trait]
    impl WorkerExecutor for Echo {
        async fn execute(&self, task: &Task, worker_id: &str, _ctx: &ExecutionContext) -> anyhow::Result<Value> {
            Ok(json!({ "task": task.id, "worker": worker_id }))
        }
    }

    struct Failing;

    #[async_trait]
    impl TaskDecomposer for Failing {
        async fn decompose(&self, _raw: &str) -> anyhow::Result<Vec<Task>> {
            anyhow::bail!("model unavailable")
        }
    }

    fn engine() -> Arc<WorkflowEngine> {
        let engine = WorkflowEngine::builder(Arc::new(Echo))
            .with_config(OrchestratorConfig::development())
            .with_decomposer(Arc::new(Failing))
            .build()
            .unwrap();
        engine
            .register_worker(WorkerSpec::new("w1", WorkerCategory::AiAgent).with_max_concurrent(4))
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn test_progress_rules() {
        let engine = engine();
        let handle = engine
            .submit(vec![Task::new("a", ""), Task::new("b", "").with_dependencies(["a"])])
            .unwrap();
        let report = engine.wait(&handle, Duration::from_secs(5)).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(report.progress_percent, 100);
        assert_eq!(report.phase_count, 2);
        assert_eq!(report.tasks_succeeded, 2);
        assert!(report.started_at.is_some() && report.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_submit_request_falls_back_to_single_task() {
        let engine = engine();
        let handle = engine.submit_request("book a table for two").await.unwrap();
        let tasks = engine.tasks(&handle).unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].id.ends_with("-task-1"));
        assert_eq!(tasks[0].description, "book a table for two");
        assert_eq!(tasks[0].estimated_cost, engine.config().engine.default_estimated_cost);
        engine.wait(&handle, Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let engine = engine();
        let err = engine.status(&WorkflowHandle::from("wf-missing")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_submit_outside_runtime_is_an_error() {
        let engine = engine();
        let err = engine.submit(vec![Task::new("a", "")]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
    }

    #[tokio::test]
    async fn test_archive_is_bounded() {
        let mut config = OrchestratorConfig::development();
        config.engine.max_archived_workflows = 2;
        let engine = WorkflowEngine::builder(Arc::new(Echo))
            .with_config(config)
            .build()
            .unwrap();
        engine
            .register_worker(WorkerSpec::new("w1", WorkerCategory::AiAgent))
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..3 {
            let handle = engine.submit(vec![Task::new(format!("t{i}"), "")]).unwrap();
            engine.wait(&handle, Duration::from_secs(5)).await.unwrap();
            handles.push(handle);
        }
        assert!(engine.status(&handles[0]).is_err());
        assert!(engine.status(&handles[2]).is_ok());
        assert_eq!(engine.workflow_ids().len(), 2);
    }
}
