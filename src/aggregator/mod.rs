//! Error Aggregator
//!
//! Every task failure passes through [`ErrorAggregator::report`]. A report is
//! classified into an [`ErrorCategory`], scored for cascade risk, linked to
//! recent records it correlates with and retained for a bounded window. The
//! aggregator also feeds the worker registry's rolling performance window and
//! hands high-risk failures to the [`CascadeGuard`].

mod taxonomy;

pub use taxonomy::{ErrorCategory, PatternTable, RecoveryStrategy, RiskLevel, Severity};

use crate::cascade::{CascadeGuard, CascadeTrigger};
use crate::core::config::AggregatorSettings;
use crate::core::errors::{BulwarkError, ErrorCode, Result};
use crate::events::{Event, EventBus};
use crate::registry::{WorkerCategory, WorkerRegistry};
use crate::task::TaskId;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A failure as observed by the caller, before classification
#[derive(Debug, Clone, Default)]
pub struct FailureReport {
    pub worker_id: String,
    pub worker_category: Option<WorkerCategory>,
    pub task_id: Option<TaskId>,
    pub workflow_id: Option<String>,
    pub message: String,
    pub declared_category: Option<ErrorCategory>,
    pub code: Option<ErrorCode>,
    pub latency: Duration,
}

impl FailureReport {
    pub fn new(worker_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn for_task(mut self, workflow_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_worker_category(mut self, category: WorkerCategory) -> Self {
        self.worker_category = Some(category);
        self
    }

    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.declared_category = Some(category);
        self
    }

    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: String,
    /// Empty when no worker could be assigned
    pub worker_id: String,
    /// Category of the failing worker, or the requested one when unassigned
    pub worker_category: Option<WorkerCategory>,
    pub task_id: Option<TaskId>,
    pub workflow_id: Option<String>,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub message: String,
    pub code: Option<ErrorCode>,
    pub timestamp: DateTime<Utc>,
    pub correlated_with: BTreeSet<String>,
    pub cascade_risk: f64,
    pub resolved: bool,
    pub strategy: Option<RecoveryStrategy>,
}

/// Result of [`ErrorAggregator::report`]
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub record: ErrorRecord,
    pub risk_level: RiskLevel,
    pub cascade_triggered: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatorStats {
    pub total_reported: u64,
    pub retained: usize,
    pub active: usize,
    pub resolved: u64,
    pub cascades_triggered: u64,
    pub by_category: HashMap<ErrorCategory, usize>,
    pub by_severity: HashMap<Severity, usize>,
}

/// Correlation between two records, in `[0, 1]`.
///
/// `0.3` for temporal proximity within `window`, `0.4` for sharing a worker
/// (or `0.24` for sharing only an error category) and `0.3` for severity
/// similarity.
pub fn correlation_score(a: &ErrorRecord, b: &ErrorRecord, window: Duration) -> f64 {
    let window_ms = window.as_millis().max(1) as f64;
    let delta_ms = (a.timestamp - b.timestamp).num_milliseconds().unsigned_abs() as f64;
    let temporal = (1.0 - delta_ms / window_ms).max(0.0);

    let locality = if a.worker_id == b.worker_id {
        1.0
    } else if a.category == b.category {
        0.6
    } else {
        0.0
    };

    let rank_gap = (a.severity.rank() as f64 - b.severity.rank() as f64).abs();
    let similarity = 1.0 - rank_gap / 3.0;

    0.3 * temporal + 0.4 * locality + 0.3 * similarity
}

pub struct ErrorAggregator {
    settings: AggregatorSettings,
    patterns: RwLock<PatternTable>,
    records: Mutex<VecDeque<ErrorRecord>>,
    registry: Arc<WorkerRegistry>,
    events: Arc<EventBus>,
    cascade: Option<Arc<CascadeGuard>>,
    risk_trigger: f64,
    total_reported: AtomicU64,
    resolved: AtomicU64,
    cascades_triggered: AtomicU64,
}

impl ErrorAggregator {
    pub fn new(
        settings: AggregatorSettings,
        registry: Arc<WorkerRegistry>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            settings,
            patterns: RwLock::new(PatternTable::default()),
            records: Mutex::new(VecDeque::new()),
            registry,
            events,
            cascade: None,
            risk_trigger: 0.7,
            total_reported: AtomicU64::new(0),
            resolved: AtomicU64::new(0),
            cascades_triggered: AtomicU64::new(0),
        }
    }

    /// Invoke `guard` for any report whose cascade risk exceeds `risk_trigger`
    pub fn with_cascade_guard(mut self, guard: Arc<CascadeGuard>, risk_trigger: f64) -> Self {
        self.cascade = Some(guard);
        self.risk_trigger = risk_trigger;
        self
    }

    pub fn with_patterns(self, patterns: PatternTable) -> Self {
        *self.patterns.write() = patterns;
        self
    }

    pub fn pattern_version(&self) -> u32 {
        self.patterns.read().version
    }

    pub fn report(&self, failure: FailureReport) -> ErrorReport {
        self.report_at(failure, Utc::now())
    }

    pub fn report_at(&self, failure: FailureReport, now: DateTime<Utc>) -> ErrorReport {
        let category = self.patterns.read().classify(
            failure.declared_category,
            failure.code,
            &failure.message,
        );
        let severity = category.default_severity();

        let record = {
            let mut records = self.records.lock();
            self.prune(&mut records, now);

            let active = records.iter().filter(|r| !r.resolved).count();
            let cascade_risk = self.cascade_risk(severity, category, active);

            let mut record = ErrorRecord {
                id: uuid::Uuid::new_v4().to_string(),
                worker_id: failure.worker_id.clone(),
                worker_category: failure.worker_category,
                task_id: failure.task_id.clone(),
                workflow_id: failure.workflow_id.clone(),
                category,
                severity,
                message: failure.message.clone(),
                code: failure.code,
                timestamp: now,
                correlated_with: BTreeSet::new(),
                cascade_risk,
                resolved: false,
                strategy: None,
            };

            for existing in records.iter_mut() {
                let score = correlation_score(&record, existing, self.settings.correlation_window);
                if score > self.settings.correlation_threshold {
                    record.correlated_with.insert(existing.id.clone());
                    existing.correlated_with.insert(record.id.clone());
                }
            }

            records.push_back(record.clone());
            while records.len() > self.settings.max_records.max(1) {
                records.pop_front();
            }
            record
        };

        self.total_reported.fetch_add(1, Ordering::Relaxed);
        self.registry
            .record_outcome(&failure.worker_id, false, failure.latency);

        let risk_level = RiskLevel::from_score(record.cascade_risk);
        warn!(
            record_id = %record.id,
            worker_id = %record.worker_id,
            category = record.category.as_str(),
            severity = record.severity.as_str(),
            cascade_risk = record.cascade_risk,
            correlated = record.correlated_with.len(),
            "Error reported: {}",
            record.message
        );
        self.events.publish(Event::ErrorReported {
            record: record.clone(),
            risk_level,
        });

        let mut cascade_triggered = false;
        if record.cascade_risk > self.risk_trigger {
            if let Some(guard) = &self.cascade {
                cascade_triggered = guard
                    .protect_dependents(
                        &record.worker_id,
                        CascadeTrigger::HighRisk {
                            cascade_risk: record.cascade_risk,
                        },
                    )
                    .is_some();
                if cascade_triggered {
                    self.cascades_triggered.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        ErrorReport {
            record,
            risk_level,
            cascade_triggered,
        }
    }

    fn cascade_risk(&self, severity: Severity, category: ErrorCategory, active: usize) -> f64 {
        let saturation = self.settings.active_error_saturation.max(1) as f64;
        let load = (active as f64 / saturation).min(1.0);
        let criticality = if self.settings.infra_critical.contains(&category) {
            1.0
        } else {
            0.3
        };
        (0.4 * severity.cascade_weight() + 0.3 * load + 0.3 * criticality).clamp(0.0, 1.0)
    }

    fn prune(&self, records: &mut VecDeque<ErrorRecord>, now: DateTime<Utc>) {
        let retention = chrono::Duration::from_std(self.settings.retention)
            .unwrap_or(chrono::Duration::MAX);
        let before = records.len();
        while records
            .front()
            .map(|r| now - r.timestamp > retention)
            .unwrap_or(false)
        {
            records.pop_front();
        }
        let pruned = before - records.len();
        if pruned > 0 {
            debug!(pruned = pruned, "Pruned expired error records");
        }
    }

    /// Count a successful execution towards the worker's performance window
    pub fn record_success(&self, worker_id: &str, latency: Duration) {
        self.registry.record_outcome(worker_id, true, latency);
    }

    pub fn set_strategy(&self, record_id: &str, strategy: RecoveryStrategy) -> Result<()> {
        let mut records = self.records.lock();
        let record = records
            .iter_mut()
            .find(|r| r.id == record_id)
            .ok_or_else(|| BulwarkError::not_found("error record", record_id))?;
        record.strategy = Some(strategy);
        Ok(())
    }

    /// Mark a record resolved. Resolving twice is a no-op.
    pub fn resolve(&self, record_id: &str, strategy: RecoveryStrategy) -> Result<()> {
        let mut records = self.records.lock();
        let record = records
            .iter_mut()
            .find(|r| r.id == record_id)
            .ok_or_else(|| BulwarkError::not_found("error record", record_id))?;
        if !record.resolved {
            record.resolved = true;
            record.strategy = Some(strategy);
            self.resolved.fetch_add(1, Ordering::Relaxed);
            info!(record_id = %record_id, strategy = strategy.as_str(), "Error record resolved");
        }
        Ok(())
    }

    pub fn get(&self, record_id: &str) -> Option<ErrorRecord> {
        self.records.lock().iter().find(|r| r.id == record_id).cloned()
    }

    pub fn records(&self) -> Vec<ErrorRecord> {
        self.records.lock().iter().cloned().collect()
    }

    pub fn records_for_workflow(&self, workflow_id: &str) -> Vec<ErrorRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.workflow_id.as_deref() == Some(workflow_id))
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.records.lock().iter().filter(|r| !r.resolved).count()
    }

    pub fn stats(&self) -> AggregatorStats {
        let records = self.records.lock();
        let mut stats = AggregatorStats {
            total_reported: self.total_reported.load(Ordering::Relaxed),
            retained: records.len(),
            resolved: self.resolved.load(Ordering::Relaxed),
            cascades_triggered: self.cascades_triggered.load(Ordering::Relaxed),
            ..Default::default()
        };
        for record in records.iter() {
            if !record.resolved {
                stats.active += 1;
            }
            *stats.by_category.entry(record.category).or_default() += 1;
            *stats.by_severity.entry(record.severity).or_default() += 1;
        }
        stats
    }
}
