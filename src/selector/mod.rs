//! Worker Selector
//!
//! Ranks candidate workers for a task. Scoring is a pluggable
//! [`ScoringStrategy`]; the default [`WeightedScorer`] is
//! `0.5 * success_rate + 0.3 * (1 - load) + 0.2 * capability_overlap`.

use crate::core::errors::{BulwarkError, Result};
use crate::registry::{WorkerSnapshot, WorkerStatus};
use crate::task::Task;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub trait ScoringStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Higher is better
    fn score(&self, task: &Task, worker: &WorkerSnapshot) -> f64;
}

/// `|required ∩ offered| / |required|`, or 1.0 when nothing is required
pub fn capability_overlap(task: &Task, worker: &WorkerSnapshot) -> f64 {
    if task.required_capabilities.is_empty() {
        return 1.0;
    }
    let matched = task
        .required_capabilities
        .iter()
        .filter(|c| worker.capabilities.contains(*c))
        .count();
    matched as f64 / task.required_capabilities.len() as f64
}

#[derive(Debug, Clone)]
pub struct WeightedScorer {
    pub success_weight: f64,
    pub load_weight: f64,
    pub capability_weight: f64,
}

impl Default for WeightedScorer {
    fn default() -> Self {
        Self {
            success_weight: 0.5,
            load_weight: 0.3,
            capability_weight: 0.2,
        }
    }
}

impl ScoringStrategy for WeightedScorer {
    fn name(&self) -> &str {
        "weighted"
    }

    fn score(&self, task: &Task, worker: &WorkerSnapshot) -> f64 {
        self.success_weight * worker.performance.success_rate
            + self.load_weight * (1.0 - worker.load.utilization())
            + self.capability_weight * capability_overlap(task, worker)
    }
}

#[derive(Debug, Clone)]
pub struct RankedWorker {
    pub worker_id: String,
    pub score: f64,
    pub load: u32,
}

pub struct WorkerSelector {
    scorer: Arc<dyn ScoringStrategy>,
}

impl Default for WorkerSelector {
    fn default() -> Self {
        Self::new(Arc::new(WeightedScorer::default()))
    }
}

impl WorkerSelector {
    pub fn new(scorer: Arc<dyn ScoringStrategy>) -> Self {
        Self { scorer }
    }

    pub fn scorer_name(&self) -> &str {
        self.scorer.name()
    }

    /// Workers eligible for `task`: READY with spare capacity, matching the
    /// task's category if it has one, not being removed and not excluded.
    pub fn eligible<'a>(
        &self,
        task: &Task,
        workers: &'a [WorkerSnapshot],
        exclude: &HashSet<String>,
    ) -> Vec<&'a WorkerSnapshot> {
        workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Ready && w.load.has_capacity())
            .filter(|w| !w.pending_removal)
            .filter(|w| !exclude.contains(&w.id))
            .filter(|w| task.category.map(|c| c == w.category).unwrap_or(true))
            .collect()
    }

    /// All eligible workers, best first. Ties go to the lower current load,
    /// then to the lower worker id.
    pub fn rank(
        &self,
        task: &Task,
        workers: &[WorkerSnapshot],
        exclude: &HashSet<String>,
    ) -> Vec<RankedWorker> {
        let mut ranked: Vec<RankedWorker> = self
            .eligible(task, workers, exclude)
            .into_iter()
            .map(|w| RankedWorker {
                worker_id: w.id.clone(),
                score: self.scorer.score(task, w),
                load: w.load.current,
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.load.cmp(&b.load))
                .then_with(|| a.worker_id.cmp(&b.worker_id))
        });
        ranked
    }

    pub fn select(
        &self,
        task: &Task,
        workers: &[WorkerSnapshot],
        exclude: &HashSet<String>,
    ) -> Result<RankedWorker> {
        let ranked = self.rank(task, workers, exclude);
        debug!(
            task_id = %task.id,
            candidates = ranked.len(),
            scorer = self.scorer.name(),
            "Ranked workers"
        );
        ranked.into_iter().next().ok_or_else(|| {
            BulwarkError::no_worker(
                task.id.clone(),
                format!(
                    "no READY worker with spare capacity among {} registered",
                    workers.len()
                ),
            )
        })
    }
}
