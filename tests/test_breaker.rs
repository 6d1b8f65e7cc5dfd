//! Circuit breaker behaviour under concurrency and through the breaker table

use bulwark::breaker::{
    BreakerConfig, BreakerKey, BreakerObserver, BreakerState, BreakerTable, CircuitBreaker,
    Transition,
};
use bulwark::core::config::BreakerSettings;
use bulwark::{ErrorCode, WorkerCategory};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn breaker(threshold: u32) -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new(
        BreakerKey::worker("w1"),
        BreakerConfig::new(threshold, Duration::from_secs(60), 1),
    ))
}

/// Fire `n` concurrent calls; `fail(i)` decides whether call `i` fails.
/// Returns (admitted, blocked, opened transitions observed).
async fn hammer(
    breaker: &Arc<CircuitBreaker>,
    n: usize,
    fail: fn(usize) -> bool,
) -> (usize, usize, usize) {
    let handles: Vec<_> = (0..n)
        .map(|i| {
            let breaker = Arc::clone(breaker);
            tokio::spawn(async move {
                match breaker.try_acquire() {
                    Ok(permit) => {
                        tokio::task::yield_now().await;
                        let transition = if fail(i) {
                            permit.failure(false)
                        } else {
                            permit.success()
                        };
                        (true, transition == Some(Transition::Opened))
                    }
                    Err(err) => {
                        assert_eq!(err.code(), ErrorCode::BreakerOpen);
                        (false, false)
                    }
                }
            })
        })
        .collect();

    let (mut admitted, mut blocked, mut opened) = (0, 0, 0);
    for handle in handles {
        let (was_admitted, did_open) = handle.await.unwrap();
        if was_admitted {
            admitted += 1;
        } else {
            blocked += 1;
        }
        if did_open {
            opened += 1;
        }
    }
    (admitted, blocked, opened)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_failures_open_exactly_once() {
    let breaker = breaker(10);
    let (admitted, blocked, opened) = hammer(&breaker, 100, |_| true).await;

    assert_eq!(admitted + blocked, 100);
    assert!(admitted >= 10);
    assert_eq!(opened, 1);

    let status = breaker.status();
    assert_eq!(status.state, BreakerState::Open);
    assert_eq!(status.opened_count, 1);
    assert_eq!(status.failed_requests as usize, admitted);
    assert_eq!(status.blocked_requests as usize, blocked);
    assert_eq!(status.total_requests, 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_failures_below_threshold_are_all_counted() {
    let breaker = breaker(1_000);
    let (admitted, blocked, opened) = hammer(&breaker, 100, |_| true).await;

    assert_eq!((admitted, blocked, opened), (100, 0, 0));
    assert_eq!(breaker.failure_count(), 100);
    assert_eq!(breaker.state(), BreakerState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mixed_outcomes_are_all_recorded() {
    let breaker = breaker(1_000);
    let (admitted, blocked, _) = hammer(&breaker, 100, |i| i % 2 == 0).await;
    assert_eq!((admitted, blocked), (100, 0));

    let status = breaker.status();
    assert_eq!(status.total_requests, 100);
    assert_eq!(status.successful_requests + status.failed_requests, 100);
    assert_eq!(status.successful_requests, 50);
    assert_eq!(status.failed_requests, 50);
    assert_eq!(status.state, BreakerState::Closed);
    assert!(status.failure_count <= 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_outcomes_match_sequential_replay() {
    let breaker = breaker(1_000);
    // outcomes are logged in the order the breaker saw them
    let log = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..200)
        .map(|i| {
            let breaker = Arc::clone(&breaker);
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                let permit = breaker.try_acquire().unwrap();
                tokio::task::yield_now().await;
                let success = i % 7 == 0 || i % 3 == 0;
                let mut log = log.lock();
                if success {
                    permit.success();
                } else {
                    permit.failure(false);
                }
                log.push(success);
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let log = log.lock().clone();
    assert_eq!(log.len(), 200);
    let start = Instant::now();
    let mut model = Model {
        threshold: 1_000,
        open_for: Duration::from_secs(60),
        successes_to_close: 1,
        state: BreakerState::Closed,
        failures: 0,
        successes: 0,
        last_failure: None,
    };
    for success in &log {
        assert!(model.admit(start));
        model.outcome(start, *success);
    }

    let status = breaker.status();
    assert_eq!(status.state, model.state);
    assert_eq!(status.failure_count, model.failures);
    assert_eq!(status.total_requests, 200);
    assert_eq!(
        status.successful_requests as usize,
        log.iter().filter(|s| **s).count()
    );
    assert_eq!(
        status.failed_requests as usize,
        log.iter().filter(|s| !**s).count()
    );
}

#[tokio::test]
async fn test_work_not_polled_while_open() {
    let table = BreakerTable::new(BreakerSettings::default());
    for _ in 0..3 {
        let err = table
            .call("api-1", WorkerCategory::Integration, Duration::from_secs(1), async {
                anyhow::bail!("502 bad gateway")
            })
            .await
            .map(|_: ()| ())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::TaskFailed);
    }
    let status = table.status(&BreakerKey::worker("api-1")).unwrap();
    assert_eq!(status.state, BreakerState::Open);

    let touched = Arc::new(AtomicBool::new(false));
    let flag = touched.clone();
    let err = table
        .call("api-1", WorkerCategory::Integration, Duration::from_secs(1), async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BreakerOpen);
    assert!(err.retry_after().unwrap() > Duration::ZERO);
    assert!(!touched.load(Ordering::SeqCst));

    // category breaker trips at twice the worker threshold, so it is still closed
    let category = table
        .status(&BreakerKey::Category(WorkerCategory::Integration))
        .unwrap();
    assert_eq!(category.state, BreakerState::Closed);
}

#[tokio::test]
async fn test_open_category_short_circuits_worker() {
    let table = BreakerTable::new(BreakerSettings::default());
    let category = table.category_breaker(WorkerCategory::Database);
    while category.state() != BreakerState::Open {
        category.try_acquire().unwrap().failure(false);
    }

    let err = table
        .call("db-1", WorkerCategory::Database, Duration::from_secs(1), async { Ok(1) })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BreakerOpen);
    assert!(table.get(&BreakerKey::worker("db-1")).is_none());
    assert!(!table.would_admit("db-1", WorkerCategory::Database));
}

#[tokio::test]
async fn test_timeout_counts_as_failure() {
    let table = BreakerTable::new(BreakerSettings::default());
    let err = table
        .call("slow", WorkerCategory::AiAgent, Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(())
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Timeout);

    let status = table.status(&BreakerKey::worker("slow")).unwrap();
    assert_eq!(status.failure_count, 1);
    assert_eq!(status.timeouts, 1);
    assert_eq!(table.summary().timeouts, 2);
}

#[derive(Default)]
struct CountingObserver {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl BreakerObserver for CountingObserver {
    fn on_transition(&self, key: &BreakerKey, transition: Transition) {
        if key.worker_id().is_none() {
            return;
        }
        match transition {
            Transition::Opened => self.opened.fetch_add(1, Ordering::SeqCst),
            Transition::Closed => self.closed.fetch_add(1, Ordering::SeqCst),
            Transition::HalfOpened => 0,
        };
    }
}

#[tokio::test]
async fn test_reset_notifies_observers() {
    let table = BreakerTable::new(BreakerSettings::default());
    let observer = Arc::new(CountingObserver::default());
    table.add_observer(observer.clone());

    for _ in 0..2 {
        let _ = table
            .call("db-1", WorkerCategory::Database, Duration::from_secs(1), async {
                anyhow::bail!("deadlock detected")
            })
            .await
            .map(|_: ()| ());
    }
    assert_eq!(observer.opened.load(Ordering::SeqCst), 1);

    table.reset(&BreakerKey::worker("db-1")).unwrap();
    assert_eq!(observer.closed.load(Ordering::SeqCst), 1);
    assert!(table.would_admit("db-1", WorkerCategory::Database));

    let err = table.reset(&BreakerKey::worker("missing")).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[test]
fn test_half_open_admits_one_trial_at_a_time() {
    let breaker = CircuitBreaker::new(
        BreakerKey::worker("w1"),
        BreakerConfig::new(1, Duration::from_secs(10), 2),
    );
    let start = Instant::now();
    let first = breaker.try_admit_at(start).unwrap();
    assert_eq!(breaker.record_failure_at(&first, start, false), Some(Transition::Opened));

    let later = start + Duration::from_secs(11);
    let trial = breaker.try_admit_at(later).unwrap();
    assert_eq!(trial.transition, Some(Transition::HalfOpened));
    assert_eq!(breaker.try_admit_at(later).unwrap_err(), Duration::ZERO);

    assert_eq!(breaker.record_success_at(&trial, later), None);
    let second = breaker.try_admit_at(later).unwrap();
    assert_eq!(breaker.record_success_at(&second, later), Some(Transition::Closed));
    assert_eq!(breaker.state(), BreakerState::Closed);
    assert_eq!(breaker.failure_count(), 0);
}

/// Reference model of a single breaker driven sequentially
#[derive(Debug)]
struct Model {
    threshold: u32,
    open_for: Duration,
    successes_to_close: u32,
    state: BreakerState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
}

impl Model {
    fn admit(&mut self, now: Instant) -> bool {
        if self.state == BreakerState::Open {
            let elapsed = self.last_failure.map(|at| now - at).unwrap_or(self.open_for);
            if elapsed < self.open_for {
                return false;
            }
            self.state = BreakerState::HalfOpen;
            self.successes = 0;
        }
        true
    }

    fn outcome(&mut self, now: Instant, success: bool) {
        match (self.state, success) {
            (BreakerState::Closed, true) => self.failures = 0,
            (BreakerState::Closed, false) => {
                self.failures += 1;
                self.last_failure = Some(now);
                if self.failures >= self.threshold {
                    self.state = BreakerState::Open;
                }
            }
            (BreakerState::HalfOpen, true) => {
                self.successes += 1;
                if self.successes >= self.successes_to_close {
                    self.state = BreakerState::Closed;
                    self.failures = 0;
                    self.successes = 0;
                }
            }
            (BreakerState::HalfOpen, false) => {
                self.failures += 1;
                self.last_failure = Some(now);
                self.state = BreakerState::Open;
                self.successes = 0;
            }
            (BreakerState::Open, _) => unreachable!("rejected calls have no outcome"),
        }
    }
}

#[test]
fn test_sequential_behaviour_matches_model() {
    let config = BreakerConfig::new(4, Duration::from_secs(5), 2);
    let breaker = CircuitBreaker::new(BreakerKey::worker("w1"), config.clone());
    let mut model = Model {
        threshold: config.failure_threshold,
        open_for: config.open_duration,
        successes_to_close: config.half_open_success_threshold,
        state: BreakerState::Closed,
        failures: 0,
        successes: 0,
        last_failure: None,
    };

    let mut rng = fastrand::Rng::with_seed(7);
    let mut now = Instant::now();
    let mut rejected = 0;
    for step in 0..2_000 {
        now += Duration::from_millis(rng.u64(0..2_000));
        let admitted = breaker.try_admit_at(now);
        assert_eq!(admitted.is_ok(), model.admit(now), "admission at step {step}");

        if let Ok(admission) = admitted {
            // failures are more likely than successes so the breaker cycles
            let success = rng.u8(0..10) < 4;
            if success {
                breaker.record_success_at(&admission, now);
            } else {
                breaker.record_failure_at(&admission, now, false);
            }
            model.outcome(now, success);
        } else {
            rejected += 1;
        }

        let status = breaker.status_at(now);
        assert_eq!(status.state, model.state, "state at step {step}");
        assert_eq!(status.failure_count, model.failures, "failures at step {step}");
    }
    assert!(rejected > 0);
    assert!(breaker.status_at(now).opened_count > 1);
}
