//! Reservation and execution of a single task attempt.
//!
//! Shared by the engine's first dispatch and the recovery strategies, so both
//! go through the same selection, load accounting and breaker path.

use super::executor::{ExecutionContext, WorkerExecutor};
use crate::breaker::BreakerTable;
use crate::cascade::CascadeGuard;
use crate::core::errors::{BulwarkError, Result};
use crate::registry::{LoadGuard, WorkerRegistry, WorkerSnapshot, WorkerStatus};
use crate::selector::WorkerSelector;
use crate::task::Task;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Outcome of one call through the breakers
#[derive(Debug)]
pub struct Attempt {
    pub worker_id: String,
    pub result: Result<Value>,
    pub latency: Duration,
}

pub struct Dispatcher {
    registry: Arc<WorkerRegistry>,
    breakers: Arc<BreakerTable>,
    cascade: Arc<CascadeGuard>,
    selector: Arc<WorkerSelector>,
    executor: Arc<dyn WorkerExecutor>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        breakers: Arc<BreakerTable>,
        cascade: Arc<CascadeGuard>,
        selector: Arc<WorkerSelector>,
        executor: Arc<dyn WorkerExecutor>,
    ) -> Self {
        Self {
            registry,
            breakers,
            cascade,
            selector,
            executor,
        }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<BreakerTable> {
        &self.breakers
    }

    /// Registry snapshots as the selector should see them. A worker whose
    /// breaker would now admit a half-open trial is offered as READY.
    pub fn candidates(&self) -> Vec<WorkerSnapshot> {
        let mut snapshots = self.registry.snapshots();
        for snapshot in snapshots.iter_mut() {
            if snapshot.status == WorkerStatus::CircuitOpen
                && self.breakers.would_admit(&snapshot.id, snapshot.category)
            {
                snapshot.status = if snapshot.load.has_capacity() {
                    WorkerStatus::Ready
                } else {
                    WorkerStatus::Busy
                };
            }
        }
        snapshots
    }

    /// Pick the best eligible worker and reserve one unit of its load.
    ///
    /// Ranking works on a snapshot, so a reservation can lose a race with
    /// another dispatch; the next ranked worker is tried in that case.
    pub fn reserve(&self, task: &Task, exclude: &HashSet<String>) -> Result<LoadGuard> {
        let candidates = self.candidates();
        let ranked = self.selector.rank(task, &candidates, exclude);
        for choice in &ranked {
            if let Some(guard) = self.registry.try_acquire(&choice.worker_id) {
                debug!(task_id = %task.id, worker_id = %choice.worker_id, score = choice.score, "Worker reserved");
                return Ok(guard);
            }
            debug!(task_id = %task.id, worker_id = %choice.worker_id, "Reservation lost, trying next worker");
        }
        Err(BulwarkError::no_worker(
            task.id.clone(),
            if ranked.is_empty() {
                format!(
                    "no READY worker with spare capacity among {} registered",
                    candidates.len()
                )
            } else {
                format!("all {} ranked workers became busy", ranked.len())
            },
        ))
    }

    /// Reserve a specific worker, if it has capacity
    pub fn reserve_worker(&self, worker_id: &str) -> Option<LoadGuard> {
        self.registry.try_acquire(worker_id)
    }

    /// Execute `task` on the reserved worker through its breakers. The
    /// reservation is released when the call returns.
    pub async fn execute(
        &self,
        workflow_id: &str,
        task: &Task,
        guard: LoadGuard,
        attempt: u32,
        timeout: Duration,
    ) -> Attempt {
        let worker_id = guard.worker_id().to_string();
        let started = Instant::now();

        let Some(category) = self.registry.category_of(&worker_id) else {
            return Attempt {
                result: Err(BulwarkError::not_found("worker", worker_id.clone())),
                worker_id,
                latency: Duration::ZERO,
            };
        };

        let ctx = ExecutionContext {
            workflow_id: workflow_id.to_string(),
            attempt,
            timeout,
            fallback: self.cascade.fallback_for(&worker_id),
        };
        let result = self
            .breakers
            .call(
                &worker_id,
                category,
                timeout,
                self.executor.execute(task, &worker_id, &ctx),
            )
            .await;
        drop(guard);

        Attempt {
            worker_id,
            result,
            latency: started.elapsed(),
        }
    }
}
