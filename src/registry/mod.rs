//! Worker Registry
//!
//! Tracks known workers, their capability tags, category and live status/load.
//! Each worker lives behind its own lock so unrelated workflows never serialize
//! on one another, and load reservations are made under that lock so two
//! concurrent selections can never oversubscribe a worker.

mod worker;

pub use worker::{
    PerformanceStats, WorkerCategory, WorkerLoad, WorkerSnapshot, WorkerSpec, WorkerStatus,
};

use crate::core::errors::{BulwarkError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Success rate assumed for a worker with no recorded outcomes
pub const DEFAULT_SUCCESS_RATE: f64 = 0.8;

#[derive(Debug)]
struct WorkerState {
    id: String,
    category: WorkerCategory,
    capabilities: BTreeSet<String>,
    max_concurrent: u32,
    current_load: u32,
    breaker_open: bool,
    offline: bool,
    pending_removal: bool,
    outcomes: VecDeque<(bool, Duration)>,
    tasks_completed: u64,
    tasks_failed: u64,
}

impl WorkerState {
    fn status(&self) -> WorkerStatus {
        if self.offline {
            WorkerStatus::Offline
        } else if self.breaker_open {
            WorkerStatus::CircuitOpen
        } else if self.current_load >= self.max_concurrent {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Ready
        }
    }

    fn performance(&self) -> PerformanceStats {
        let samples = self.outcomes.len();
        let (success_rate, avg_latency) = if samples == 0 {
            (DEFAULT_SUCCESS_RATE, Duration::ZERO)
        } else {
            let successes = self.outcomes.iter().filter(|(ok, _)| *ok).count();
            let total: Duration = self.outcomes.iter().map(|(_, latency)| *latency).sum();
            (
                successes as f64 / samples as f64,
                total / samples as u32,
            )
        };
        PerformanceStats {
            success_rate,
            avg_latency,
            samples,
            tasks_completed: self.tasks_completed,
            tasks_failed: self.tasks_failed,
        }
    }

    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id.clone(),
            category: self.category,
            capabilities: self.capabilities.clone(),
            status: self.status(),
            load: WorkerLoad {
                current: self.current_load,
                max: self.max_concurrent,
            },
            performance: self.performance(),
            pending_removal: self.pending_removal,
        }
    }
}

/// Process-wide store of workers with per-worker locking
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: DashMap<String, Arc<Mutex<WorkerState>>>,
    performance_window: usize,
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new(50)
    }
}

impl WorkerRegistry {
    pub fn new(performance_window: usize) -> Self {
        Self {
            workers: DashMap::new(),
            performance_window: performance_window.max(1),
        }
    }

    fn entry(&self, worker_id: &str) -> Option<Arc<Mutex<WorkerState>>> {
        self.workers.get(worker_id).map(|e| Arc::clone(e.value()))
    }

    pub fn register(&self, spec: WorkerSpec) -> Result<()> {
        if spec.id.trim().is_empty() {
            return Err(BulwarkError::validation_field("worker id cannot be empty", "id"));
        }
        if spec.max_concurrent == 0 {
            return Err(BulwarkError::validation_field(
                "max_concurrent must be greater than 0",
                "max_concurrent",
            ));
        }
        if self.workers.contains_key(&spec.id) {
            return Err(BulwarkError::validation_field(
                format!("worker {} is already registered", spec.id),
                "id",
            ));
        }

        info!(
            worker_id = %spec.id,
            category = %spec.category,
            max_concurrent = spec.max_concurrent,
            "Registered worker"
        );
        let state = WorkerState {
            id: spec.id.clone(),
            category: spec.category,
            capabilities: spec.capabilities,
            max_concurrent: spec.max_concurrent,
            current_load: 0,
            breaker_open: false,
            offline: false,
            pending_removal: false,
            outcomes: VecDeque::with_capacity(self.performance_window),
            tasks_completed: 0,
            tasks_failed: 0,
        };
        self.workers.insert(spec.id, Arc::new(Mutex::new(state)));
        Ok(())
    }

    /// Remove a worker. Returns `true` if it was dropped now, `false` if removal
    /// was deferred until its in-flight tasks release their load.
    pub fn deregister(&self, worker_id: &str) -> Result<bool> {
        let entry = self
            .entry(worker_id)
            .ok_or_else(|| BulwarkError::not_found("worker", worker_id))?;

        let idle = {
            let mut state = entry.lock();
            state.pending_removal = true;
            state.current_load == 0
        };

        if idle {
            self.workers.remove(worker_id);
            info!(worker_id = %worker_id, "Deregistered worker");
        } else {
            info!(worker_id = %worker_id, "Worker busy, removal deferred until idle");
        }
        Ok(idle)
    }

    pub fn contains(&self, worker_id: &str) -> bool {
        self.workers.contains_key(worker_id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn get(&self, worker_id: &str) -> Option<WorkerSnapshot> {
        self.entry(worker_id).map(|e| e.lock().snapshot())
    }

    pub fn category_of(&self, worker_id: &str) -> Option<WorkerCategory> {
        self.entry(worker_id).map(|e| e.lock().category)
    }

    /// Snapshot of every worker, ordered by id
    pub fn snapshots(&self) -> Vec<WorkerSnapshot> {
        let entries: Vec<_> = self.workers.iter().map(|e| Arc::clone(e.value())).collect();
        let mut snapshots: Vec<_> = entries.iter().map(|e| e.lock().snapshot()).collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Mean rolling success rate over workers that are not offline
    pub fn mean_success_rate(&self) -> f64 {
        let rates: Vec<f64> = self
            .snapshots()
            .into_iter()
            .filter(|w| w.status != WorkerStatus::Offline)
            .map(|w| w.performance.success_rate)
            .collect();
        if rates.is_empty() {
            DEFAULT_SUCCESS_RATE
        } else {
            rates.iter().sum::<f64>() / rates.len() as f64
        }
    }

    /// Reserve one unit of load on a worker.
    ///
    /// Succeeds only if the worker exists, is not offline or being removed, and
    /// has spare capacity. The check and the increment happen under the
    /// worker's lock. Workers with an open breaker may still be reserved; the
    /// breaker itself decides whether a trial call is admitted.
    pub fn try_acquire(self: &Arc<Self>, worker_id: &str) -> Option<LoadGuard> {
        let entry = self.entry(worker_id)?;
        let mut state = entry.lock();
        if state.offline || state.pending_removal || state.current_load >= state.max_concurrent {
            debug!(
                worker_id = %worker_id,
                status = state.status().as_str(),
                load = state.current_load,
                "Load reservation refused"
            );
            return None;
        }
        state.current_load += 1;
        debug!(worker_id = %worker_id, load = state.current_load, "Load reserved");
        Some(LoadGuard {
            registry: Arc::clone(self),
            worker_id: worker_id.to_string(),
        })
    }

    fn release(&self, worker_id: &str) {
        let Some(entry) = self.entry(worker_id) else {
            warn!(worker_id = %worker_id, "Released load on unknown worker");
            return;
        };
        let remove = {
            let mut state = entry.lock();
            state.current_load = state.current_load.saturating_sub(1);
            state.pending_removal && state.current_load == 0
        };
        if remove {
            let removed = self
                .workers
                .remove_if(worker_id, |_, v| Arc::ptr_eq(v, &entry))
                .is_some();
            if removed {
                info!(worker_id = %worker_id, "Deferred removal completed");
            }
        }
    }

    pub fn record_outcome(&self, worker_id: &str, success: bool, latency: Duration) {
        let Some(entry) = self.entry(worker_id) else {
            return;
        };
        let mut state = entry.lock();
        if state.outcomes.len() >= self.performance_window {
            state.outcomes.pop_front();
        }
        state.outcomes.push_back((success, latency));
        if success {
            state.tasks_completed += 1;
        } else {
            state.tasks_failed += 1;
        }
    }

    pub fn set_breaker_open(&self, worker_id: &str, open: bool) {
        if let Some(entry) = self.entry(worker_id) {
            let mut state = entry.lock();
            if state.breaker_open != open {
                state.breaker_open = open;
                debug!(worker_id = %worker_id, status = state.status().as_str(), "Worker status changed");
            }
        }
    }

    pub fn set_offline(&self, worker_id: &str, offline: bool) -> Result<()> {
        let entry = self
            .entry(worker_id)
            .ok_or_else(|| BulwarkError::not_found("worker", worker_id))?;
        let mut state = entry.lock();
        state.offline = offline;
        if !offline {
            state.breaker_open = false;
        }
        info!(worker_id = %worker_id, status = state.status().as_str(), "Worker availability changed");
        Ok(())
    }
}

/// RAII reservation of one unit of worker load
#[derive(Debug)]
pub struct LoadGuard {
    registry: Arc<WorkerRegistry>,
    worker_id: String,
}

impl LoadGuard {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.registry.release(&self.worker_id);
    }
}
