//! Circuit breakers for workers and worker categories.
//!
//! A breaker moves between three states:
//!
//! * `Closed`: calls flow; consecutive failures are counted and any success
//!   resets the count. Reaching the failure threshold opens the breaker.
//! * `Open`: calls are rejected with [`BulwarkError::BreakerOpen`] until the
//!   open duration has elapsed since the last failure. The check is lazy: the
//!   next call after the window moves the breaker to `HalfOpen`.
//! * `HalfOpen`: one trial call at a time is admitted. Enough successful
//!   trials close the breaker; any failure reopens it.
//!
//! All state lives behind one mutex per breaker. Admission and outcome
//! recording each take that lock once, so concurrent completions are applied
//! in some sequential order.

mod table;

pub use table::{BreakerObserver, BreakerSummary, BreakerTable};

use crate::core::errors::{BulwarkError, Result};
use crate::registry::WorkerCategory;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Thresholds for a single breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Time after the last failure before a trial call is allowed
    pub open_duration: Duration,
    /// Successful trials needed to close from half-open
    pub half_open_success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::for_category(WorkerCategory::AiAgent)
    }
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, open_duration: Duration, half_open_success_threshold: u32) -> Self {
        Self {
            failure_threshold,
            open_duration,
            half_open_success_threshold,
        }
    }

    /// Built-in preset per worker category
    pub fn for_category(category: WorkerCategory) -> Self {
        match category {
            WorkerCategory::AiAgent
            | WorkerCategory::ExternalApi
            | WorkerCategory::Infrastructure => Self::new(5, Duration::from_secs(30), 3),
            WorkerCategory::Integration => Self::new(3, Duration::from_secs(15), 2),
            WorkerCategory::Database => Self::new(2, Duration::from_secs(60), 1),
            WorkerCategory::Workflow => Self::new(3, Duration::from_secs(45), 2),
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }
        if self.half_open_success_threshold == 0 {
            return Err("half_open_success_threshold must be greater than 0".to_string());
        }
        if self.open_duration.is_zero() {
            return Err("open_duration must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

/// What a breaker guards: a single worker or a whole category
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerKey {
    Worker(String),
    Category(WorkerCategory),
}

impl BreakerKey {
    pub fn worker(id: impl Into<String>) -> Self {
        Self::Worker(id.into())
    }

    pub fn worker_id(&self) -> Option<&str> {
        match self {
            Self::Worker(id) => Some(id),
            Self::Category(_) => None,
        }
    }
}

impl fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Worker(id) => write!(f, "worker:{}", id),
            Self::Category(category) => write!(f, "category:{}", category),
        }
    }
}

/// State change produced by an admission or an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened,
    HalfOpened,
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct ThresholdOverride {
    threshold: u32,
    until: Instant,
}

#[derive(Debug, Default, Clone)]
struct BreakerCounters {
    total_requests: u64,
    blocked_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    timeouts: u64,
    opened_count: u64,
}

#[derive(Debug)]
struct BreakerCore {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
    last_failure_wall: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    threshold_override: Option<ThresholdOverride>,
    generation: u64,
    counters: BreakerCounters,
}

impl BreakerCore {
    fn effective_threshold(&mut self, base: u32, now: Instant) -> u32 {
        match self.threshold_override {
            Some(o) if now < o.until => o.threshold,
            Some(_) => {
                self.threshold_override = None;
                base
            }
            None => base,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.success_count = 0;
        self.trial_in_flight = false;
        self.last_failure_at = Some(now);
        self.last_failure_wall = Some(Utc::now());
        self.counters.opened_count += 1;
    }
}

/// Proof that a call was admitted; used to record its outcome exactly once
#[derive(Debug, Clone, Copy)]
pub struct Admission {
    generation: u64,
    trial: bool,
    /// `Some(HalfOpened)` when this admission performed the lazy transition
    pub transition: Option<Transition>,
}

/// Serializable view of a breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerStatus {
    pub key: BreakerKey,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Threshold currently in force, including any cascade tightening
    pub failure_threshold: u32,
    pub base_failure_threshold: u32,
    pub open_duration: Duration,
    pub half_open_success_threshold: u32,
    pub retry_after: Option<Duration>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub timeouts: u64,
    pub opened_count: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    key: BreakerKey,
    config: BreakerConfig,
    core: Mutex<BreakerCore>,
}

impl CircuitBreaker {
    pub fn new(key: BreakerKey, config: BreakerConfig) -> Self {
        Self {
            key,
            config,
            core: Mutex::new(BreakerCore {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_at: None,
                last_failure_wall: None,
                trial_in_flight: false,
                threshold_override: None,
                generation: 0,
                counters: BreakerCounters::default(),
            }),
        }
    }

    pub fn key(&self) -> &BreakerKey {
        &self.key
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> BreakerState {
        self.core.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.core.lock().failure_count
    }

    pub fn success_count(&self) -> u32 {
        self.core.lock().success_count
    }

    /// Ask to run one call. Performs the lazy `Open -> HalfOpen` check.
    ///
    /// On rejection returns how long the caller should wait before trying again.
    pub fn try_admit_at(&self, now: Instant) -> std::result::Result<Admission, Duration> {
        let mut core = self.core.lock();
        core.counters.total_requests += 1;

        let mut transition = None;
        if core.state == BreakerState::Open {
            let elapsed = core
                .last_failure_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or(self.config.open_duration);
            if elapsed < self.config.open_duration {
                core.counters.blocked_requests += 1;
                return Err(self.config.open_duration - elapsed);
            }
            core.state = BreakerState::HalfOpen;
            core.success_count = 0;
            core.trial_in_flight = false;
            transition = Some(Transition::HalfOpened);
            info!(breaker = %self.key, "Circuit breaker half-open, admitting trial call");
        }

        if core.state == BreakerState::HalfOpen {
            if core.trial_in_flight {
                core.counters.blocked_requests += 1;
                debug!(breaker = %self.key, "Trial already in flight, rejecting call");
                return Err(Duration::ZERO);
            }
            core.trial_in_flight = true;
            return Ok(Admission {
                generation: core.generation,
                trial: true,
                transition,
            });
        }

        Ok(Admission {
            generation: core.generation,
            trial: false,
            transition,
        })
    }

    pub fn record_success_at(&self, admission: &Admission, _now: Instant) -> Option<Transition> {
        let mut core = self.core.lock();
        if admission.generation != core.generation {
            debug!(breaker = %self.key, "Ignoring success from a call admitted before reset");
            return None;
        }
        core.counters.successful_requests += 1;
        if admission.trial {
            core.trial_in_flight = false;
        }

        match core.state {
            BreakerState::Closed => {
                core.failure_count = 0;
                None
            }
            BreakerState::HalfOpen => {
                core.success_count += 1;
                if core.success_count >= self.config.half_open_success_threshold {
                    core.state = BreakerState::Closed;
                    core.failure_count = 0;
                    core.success_count = 0;
                    info!(breaker = %self.key, "Circuit breaker closed");
                    Some(Transition::Closed)
                } else {
                    None
                }
            }
            // late result from a call admitted before the breaker opened
            BreakerState::Open => None,
        }
    }

    pub fn record_failure_at(
        &self,
        admission: &Admission,
        now: Instant,
        timed_out: bool,
    ) -> Option<Transition> {
        let mut core = self.core.lock();
        if admission.generation != core.generation {
            debug!(breaker = %self.key, "Ignoring failure from a call admitted before reset");
            return None;
        }
        core.counters.failed_requests += 1;
        if timed_out {
            core.counters.timeouts += 1;
        }
        if admission.trial {
            core.trial_in_flight = false;
        }

        match core.state {
            BreakerState::Closed => {
                core.failure_count += 1;
                core.last_failure_at = Some(now);
                core.last_failure_wall = Some(Utc::now());
                let threshold = core.effective_threshold(self.config.failure_threshold, now);
                if core.failure_count >= threshold {
                    core.open(now);
                    warn!(
                        breaker = %self.key,
                        failures = core.failure_count,
                        threshold = threshold,
                        "Circuit breaker opened"
                    );
                    Some(Transition::Opened)
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => {
                core.failure_count += 1;
                core.open(now);
                warn!(breaker = %self.key, "Trial call failed, circuit breaker reopened");
                Some(Transition::Opened)
            }
            BreakerState::Open => {
                core.failure_count += 1;
                core.last_failure_at = Some(now);
                core.last_failure_wall = Some(Utc::now());
                None
            }
        }
    }

    /// Release an admission whose outcome will never be recorded
    pub fn abandon(&self, admission: &Admission) {
        let mut core = self.core.lock();
        if admission.trial && admission.generation == core.generation {
            core.trial_in_flight = false;
        }
    }

    /// Whether a call made now would be admitted. Does not change state.
    pub fn would_admit_at(&self, now: Instant) -> bool {
        let core = self.core.lock();
        match core.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => !core.trial_in_flight,
            BreakerState::Open => core
                .last_failure_at
                .map(|at| now.saturating_duration_since(at) >= self.config.open_duration)
                .unwrap_or(true),
        }
    }

    /// Temporarily lower the failure threshold until `until`.
    ///
    /// Returns the threshold now in force. Does not touch the failure count.
    pub fn tighten_until(&self, threshold: u32, until: Instant) -> u32 {
        let mut core = self.core.lock();
        let threshold = threshold.clamp(1, self.config.failure_threshold);
        core.threshold_override = Some(ThresholdOverride { threshold, until });
        threshold
    }

    pub fn restore_threshold(&self) {
        self.core.lock().threshold_override = None;
    }

    pub fn failure_threshold_at(&self, now: Instant) -> u32 {
        self.core
            .lock()
            .effective_threshold(self.config.failure_threshold, now)
    }

    /// Return to a fresh `Closed` state; outcomes of calls admitted earlier are ignored
    pub fn reset(&self) {
        let mut core = self.core.lock();
        core.state = BreakerState::Closed;
        core.failure_count = 0;
        core.success_count = 0;
        core.last_failure_at = None;
        core.trial_in_flight = false;
        core.generation += 1;
        info!(breaker = %self.key, "Circuit breaker reset");
    }

    pub fn status_at(&self, now: Instant) -> BreakerStatus {
        let mut core = self.core.lock();
        let failure_threshold = core.effective_threshold(self.config.failure_threshold, now);
        let retry_after = match (core.state, core.last_failure_at) {
            (BreakerState::Open, Some(at)) => {
                Some(self.config.open_duration.saturating_sub(now.saturating_duration_since(at)))
            }
            _ => None,
        };
        BreakerStatus {
            key: self.key.clone(),
            state: core.state,
            failure_count: core.failure_count,
            success_count: core.success_count,
            failure_threshold,
            base_failure_threshold: self.config.failure_threshold,
            open_duration: self.config.open_duration,
            half_open_success_threshold: self.config.half_open_success_threshold,
            retry_after,
            last_failure_at: core.last_failure_wall,
            total_requests: core.counters.total_requests,
            blocked_requests: core.counters.blocked_requests,
            successful_requests: core.counters.successful_requests,
            failed_requests: core.counters.failed_requests,
            timeouts: core.counters.timeouts,
            opened_count: core.counters.opened_count,
        }
    }

    pub fn status(&self) -> BreakerStatus {
        self.status_at(Instant::now())
    }

    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit> {
        match self.try_admit_at(Instant::now()) {
            Ok(admission) => Ok(BreakerPermit {
                breaker: Arc::clone(self),
                admission,
                settled: false,
            }),
            Err(retry_after) => Err(BulwarkError::breaker_open(self.key.to_string(), retry_after)),
        }
    }
}

/// An admitted call. Settle it with [`success`](Self::success) or
/// [`failure`](Self::failure); dropping it unsettled releases a trial slot.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    admission: Admission,
    settled: bool,
}

impl BreakerPermit {
    pub fn key(&self) -> &BreakerKey {
        self.breaker.key()
    }

    pub fn admission_transition(&self) -> Option<Transition> {
        self.admission.transition
    }

    pub fn success(mut self) -> Option<Transition> {
        self.settled = true;
        self.breaker.record_success_at(&self.admission, Instant::now())
    }

    pub fn failure(mut self, timed_out: bool) -> Option<Transition> {
        self.settled = true;
        self.breaker
            .record_failure_at(&self.admission, Instant::now(), timed_out)
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.abandon(&self.admission);
        }
    }
}
