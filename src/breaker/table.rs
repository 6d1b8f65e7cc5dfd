use super::{BreakerKey, BreakerPermit, BreakerState, BreakerStatus, CircuitBreaker, Transition};
use crate::core::config::BreakerSettings;
use crate::core::errors::{BulwarkError, Result};
use crate::registry::WorkerCategory;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Notified after a breaker changes state. Called outside the breaker's lock
/// and must not block.
pub trait BreakerObserver: Send + Sync {
    fn on_transition(&self, key: &BreakerKey, transition: Transition);
}

/// Aggregate view over every breaker in the table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerSummary {
    pub total: usize,
    pub open: usize,
    pub half_open: usize,
    pub closed: usize,
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub timeouts: u64,
    /// Percentage of breakers currently closed
    pub overall_health: f64,
}

/// Process-wide table of worker and category breakers
pub struct BreakerTable {
    settings: BreakerSettings,
    breakers: DashMap<BreakerKey, Arc<CircuitBreaker>>,
    observers: RwLock<Vec<Arc<dyn BreakerObserver>>>,
}

impl BreakerTable {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: DashMap::new(),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    pub fn call_timeout(&self) -> Duration {
        self.settings.call_timeout
    }

    pub fn add_observer(&self, observer: Arc<dyn BreakerObserver>) {
        self.observers.write().push(observer);
    }

    pub fn worker_breaker(&self, worker_id: &str, category: WorkerCategory) -> Arc<CircuitBreaker> {
        let key = BreakerKey::worker(worker_id);
        if let Some(existing) = self.breakers.get(&key) {
            return Arc::clone(existing.value());
        }
        let config = self.settings.worker_config(category);
        Arc::clone(
            self.breakers
                .entry(key.clone())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(key, config)))
                .value(),
        )
    }

    pub fn category_breaker(&self, category: WorkerCategory) -> Arc<CircuitBreaker> {
        let key = BreakerKey::Category(category);
        if let Some(existing) = self.breakers.get(&key) {
            return Arc::clone(existing.value());
        }
        let config = self.settings.category_config(category);
        Arc::clone(
            self.breakers
                .entry(key.clone())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(key, config)))
                .value(),
        )
    }

    pub fn get(&self, key: &BreakerKey) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(key).map(|e| Arc::clone(e.value()))
    }

    pub fn status(&self, key: &BreakerKey) -> Option<BreakerStatus> {
        self.get(key).map(|b| b.status())
    }

    pub fn statuses(&self) -> Vec<BreakerStatus> {
        let breakers: Vec<_> = self.breakers.iter().map(|e| Arc::clone(e.value())).collect();
        let mut statuses: Vec<_> = breakers.iter().map(|b| b.status()).collect();
        statuses.sort_by_key(|s| s.key.to_string());
        statuses
    }

    /// Reset a breaker to `Closed` and tell observers
    pub fn reset(&self, key: &BreakerKey) -> Result<()> {
        let breaker = self
            .get(key)
            .ok_or_else(|| BulwarkError::not_found("breaker", key.to_string()))?;
        let was_closed = breaker.state() == BreakerState::Closed;
        breaker.reset();
        if !was_closed {
            self.notify(key, Some(Transition::Closed));
        }
        Ok(())
    }

    /// Whether a call to this worker would currently get through both the
    /// category and the worker breaker. Does not change any state.
    pub fn would_admit(&self, worker_id: &str, category: WorkerCategory) -> bool {
        let now = Instant::now();
        let category_ok = self
            .get(&BreakerKey::Category(category))
            .map(|b| b.would_admit_at(now))
            .unwrap_or(true);
        category_ok
            && self
                .get(&BreakerKey::worker(worker_id))
                .map(|b| b.would_admit_at(now))
                .unwrap_or(true)
    }

    fn notify(&self, key: &BreakerKey, transition: Option<Transition>) {
        let Some(transition) = transition else {
            return;
        };
        let observers: Vec<_> = self.observers.read().iter().cloned().collect();
        for observer in observers {
            observer.on_transition(key, transition);
        }
    }

    /// Admit a call for `worker_id`, checking the category breaker first.
    ///
    /// If the category breaker rejects, the worker breaker is not consulted.
    pub fn admit(
        &self,
        worker_id: &str,
        category: WorkerCategory,
    ) -> Result<(BreakerPermit, BreakerPermit)> {
        let category_breaker = self.category_breaker(category);
        let category_permit = category_breaker.try_acquire().map_err(|e| {
            debug!(worker_id = %worker_id, category = %category, "Category breaker rejected call");
            e
        })?;
        self.notify(category_permit.key(), category_permit.admission_transition());

        let worker_breaker = self.worker_breaker(worker_id, category);
        let worker_permit = worker_breaker.try_acquire()?;
        self.notify(worker_permit.key(), worker_permit.admission_transition());
        Ok((category_permit, worker_permit))
    }

    /// Run one unit of work through the breakers for `worker_id`, bounded by
    /// `timeout`. A call that exceeds the timeout counts as one failure and its
    /// eventual result is dropped with the future.
    pub async fn call<T, F>(
        &self,
        worker_id: &str,
        category: WorkerCategory,
        timeout: Duration,
        work: F,
    ) -> Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let (category_permit, worker_permit) = self.admit(worker_id, category)?;

        match tokio::time::timeout(timeout, work).await {
            Ok(Ok(value)) => {
                let ck = category_permit.key().clone();
                let wk = worker_permit.key().clone();
                self.notify(&ck, category_permit.success());
                self.notify(&wk, worker_permit.success());
                Ok(value)
            }
            Ok(Err(err)) => {
                let ck = category_permit.key().clone();
                let wk = worker_permit.key().clone();
                self.notify(&ck, category_permit.failure(false));
                self.notify(&wk, worker_permit.failure(false));
                Err(BulwarkError::execution(worker_id, format!("{:#}", err)))
            }
            Err(_) => {
                warn!(worker_id = %worker_id, timeout_ms = timeout.as_millis() as u64, "Call timed out");
                let ck = category_permit.key().clone();
                let wk = worker_permit.key().clone();
                self.notify(&ck, category_permit.failure(true));
                self.notify(&wk, worker_permit.failure(true));
                Err(BulwarkError::timeout(format!("call to {}", worker_id), timeout))
            }
        }
    }

    pub fn summary(&self) -> BreakerSummary {
        let mut summary = BreakerSummary::default();
        for status in self.statuses() {
            summary.total += 1;
            match status.state {
                BreakerState::Open => summary.open += 1,
                BreakerState::HalfOpen => summary.half_open += 1,
                BreakerState::Closed => summary.closed += 1,
            }
            summary.total_requests += status.total_requests;
            summary.blocked_requests += status.blocked_requests;
            summary.successful_requests += status.successful_requests;
            summary.failed_requests += status.failed_requests;
            summary.timeouts += status.timeouts;
        }
        summary.overall_health = if summary.total == 0 {
            100.0
        } else {
            summary.closed as f64 / summary.total as f64 * 100.0
        };
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    impl BreakerObserver for Recorder {
        fn on_transition(&self, _key: &BreakerKey, transition: Transition) {
            match transition {
                Transition::Opened => self.opened.fetch_add(1, Ordering::SeqCst),
                Transition::Closed => self.closed.fetch_add(1, Ordering::SeqCst),
                Transition::HalfOpened => 0,
            };
        }
    }

    fn table(threshold: u32) -> BreakerTable {
        let mut overrides = HashMap::new();
        overrides.insert(
            WorkerCategory::AiAgent,
            BreakerConfig::new(threshold, Duration::from_millis(50), 1),
        );
        BreakerTable::new(BreakerSettings {
            overrides,
            ..BreakerSettings::default()
        })
    }

    #[tokio::test]
    async fn test_call_records_failures_and_notifies() {
        let table = table(2);
        let recorder = Arc::new(Recorder::default());
        table.add_observer(recorder.clone());

        for _ in 0..2 {
            let result: Result<()> = table
                .call("w1", WorkerCategory::AiAgent, Duration::from_secs(1), async {
                    Err(anyhow::anyhow!("boom"))
                })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(recorder.opened.load(Ordering::SeqCst), 1);

        let result: Result<()> = table
            .call("w1", WorkerCategory::AiAgent, Duration::from_secs(1), async { Ok(()) })
            .await;
        assert!(matches!(result, Err(BulwarkError::BreakerOpen { .. })));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let table = table(1);
        let result: Result<u32> = table
            .call("w1", WorkerCategory::AiAgent, Duration::from_millis(10), async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(7)
            })
            .await;
        assert!(matches!(result, Err(BulwarkError::Timeout { .. })));
        let status = table.status(&BreakerKey::worker("w1")).unwrap();
        assert_eq!(status.state, BreakerState::Open);
        assert_eq!(status.timeouts, 1);
        assert_eq!(status.failed_requests, 1);
    }

    #[tokio::test]
    async fn test_open_category_short_circuits_worker_breaker() {
        let table = table(5);
        let category = table.category_breaker(WorkerCategory::AiAgent);
        // category threshold is 2x the worker threshold
        for _ in 0..10 {
            let permit = category.try_acquire().unwrap();
            permit.failure(false);
        }
        assert_eq!(category.state(), BreakerState::Open);

        let result: Result<()> = table
            .call("w9", WorkerCategory::AiAgent, Duration::from_secs(1), async { Ok(()) })
            .await;
        assert!(matches!(result, Err(BulwarkError::BreakerOpen { .. })));
        assert!(table.get(&BreakerKey::worker("w9")).is_none());
        assert!(!table.would_admit("w9", WorkerCategory::AiAgent));
    }

    #[tokio::test]
    async fn test_recovers_through_half_open() {
        let table = table(1);
        let recorder = Arc::new(Recorder::default());
        table.add_observer(recorder.clone());

        let _: Result<()> = table
            .call("w1", WorkerCategory::AiAgent, Duration::from_secs(1), async {
                Err(anyhow::anyhow!("down"))
            })
            .await;
        assert!(!table.would_admit("w1", WorkerCategory::AiAgent));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(table.would_admit("w1", WorkerCategory::AiAgent));

        let ok: Result<u8> = table
            .call("w1", WorkerCategory::AiAgent, Duration::from_secs(1), async { Ok(1) })
            .await;
        assert_eq!(ok.unwrap(), 1);
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);

        let summary = table.summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.closed, 2);
        assert_eq!(summary.overall_health, 100.0);
    }
}
