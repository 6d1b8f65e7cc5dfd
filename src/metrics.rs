//! Orchestrator metrics collection
//!
//! Plain atomic counters updated by the workflow engine, plus a combined
//! snapshot that folds in breaker, aggregator and recovery statistics.

use crate::aggregator::AggregatorStats;
use crate::breaker::BreakerSummary;
use crate::recovery::RecoveryStats;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Workflow and task counters
#[derive(Debug, Default)]
pub struct OrchestratorMetrics {
    /// Workflows accepted by submit
    pub workflows_submitted: AtomicU64,
    pub workflows_completed: AtomicU64,
    pub workflows_failed: AtomicU64,
    pub workflows_cancelled: AtomicU64,
    /// Submissions rejected before a workflow was created
    pub submissions_rejected: AtomicU64,
    pub tasks_dispatched: AtomicU64,
    pub tasks_succeeded: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_recovered: AtomicU64,
    pub total_task_time_ms: AtomicU64,
}

impl OrchestratorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&self) {
        self.workflows_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.submissions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self) {
        self.tasks_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished task. `recovered` marks a success obtained through recovery.
    pub fn record_task(&self, succeeded: bool, recovered: bool, elapsed: Duration) {
        if succeeded {
            self.tasks_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        }
        if recovered {
            self.tasks_recovered.fetch_add(1, Ordering::Relaxed);
        }
        self.total_task_time_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.workflows_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self, cancelled: bool) {
        self.workflows_failed.fetch_add(1, Ordering::Relaxed);
        if cancelled {
            self.workflows_cancelled.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let tasks_succeeded = self.tasks_succeeded.load(Ordering::Relaxed);
        let tasks_failed = self.tasks_failed.load(Ordering::Relaxed);
        let finished = tasks_succeeded + tasks_failed;
        MetricsSnapshot {
            workflows_submitted: self.workflows_submitted.load(Ordering::Relaxed),
            workflows_completed: self.workflows_completed.load(Ordering::Relaxed),
            workflows_failed: self.workflows_failed.load(Ordering::Relaxed),
            workflows_cancelled: self.workflows_cancelled.load(Ordering::Relaxed),
            submissions_rejected: self.submissions_rejected.load(Ordering::Relaxed),
            tasks_dispatched: self.tasks_dispatched.load(Ordering::Relaxed),
            tasks_succeeded,
            tasks_failed,
            tasks_recovered: self.tasks_recovered.load(Ordering::Relaxed),
            avg_task_time_ms: if finished == 0 {
                0
            } else {
                self.total_task_time_ms.load(Ordering::Relaxed) / finished
            },
        }
    }
}

/// Snapshot of the engine counters at a point in time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub workflows_submitted: u64,
    pub workflows_completed: u64,
    pub workflows_failed: u64,
    pub workflows_cancelled: u64,
    pub submissions_rejected: u64,
    pub tasks_dispatched: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_recovered: u64,
    pub avg_task_time_ms: u64,
}

impl MetricsSnapshot {
    /// Share of finished tasks that succeeded (0.0 to 1.0)
    pub fn task_success_rate(&self) -> f64 {
        let finished = self.tasks_succeeded + self.tasks_failed;
        if finished == 0 {
            0.0
        } else {
            self.tasks_succeeded as f64 / finished as f64
        }
    }
}

/// Everything an operator dashboard needs in one value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub engine: MetricsSnapshot,
    pub breakers: BreakerSummary,
    pub errors: AggregatorStats,
    pub recovery: RecoveryStats,
    pub cascades_prevented: u64,
    pub workers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_rates() {
        let metrics = OrchestratorMetrics::new();
        metrics.record_submitted();
        metrics.record_dispatch();
        metrics.record_dispatch();
        metrics.record_task(true, false, Duration::from_millis(30));
        metrics.record_task(false, false, Duration::from_millis(10));
        metrics.record_failed(true);

        let snap = metrics.snapshot();
        assert_eq!(snap.tasks_dispatched, 2);
        assert_eq!(snap.avg_task_time_ms, 20);
        assert_eq!(snap.workflows_cancelled, 1);
        assert!((snap.task_success_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = OrchestratorMetrics::new().snapshot();
        assert_eq!(snap, MetricsSnapshot::default());
        assert_eq!(snap.task_success_rate(), 0.0);
    }
}
