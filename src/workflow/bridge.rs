use crate::breaker::{BreakerKey, BreakerObserver, BreakerTable, Transition};
use crate::cascade::CascadeGuard;
use crate::events::{Event, EventBus};
use crate::registry::WorkerRegistry;
use std::sync::{Arc, Weak};
use tracing::{info, warn};

/// Mirrors breaker transitions into worker status and the event stream, then
/// forwards them to the cascade guard.
///
/// The table and guard are held weakly: the table owns its observers and the
/// guard owns the table.
pub(crate) struct BreakerBridge {
    table: Weak<BreakerTable>,
    cascade: Weak<CascadeGuard>,
    registry: Arc<WorkerRegistry>,
    events: Arc<EventBus>,
}

impl BreakerBridge {
    pub(crate) fn new(
        table: &Arc<BreakerTable>,
        cascade: &Arc<CascadeGuard>,
        registry: Arc<WorkerRegistry>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            table: Arc::downgrade(table),
            cascade: Arc::downgrade(cascade),
            registry,
            events,
        }
    }
}

impl BreakerObserver for BreakerBridge {
    fn on_transition(&self, key: &BreakerKey, transition: Transition) {
        match transition {
            Transition::Opened => {
                if let Some(worker_id) = key.worker_id() {
                    self.registry.set_breaker_open(worker_id, true);
                }
                let status = self.table.upgrade().and_then(|t| t.status(key));
                let (failure_count, retry_after_ms) = status
                    .map(|s| {
                        let retry = s.retry_after.unwrap_or(s.open_duration);
                        (s.failure_count, retry.as_millis() as u64)
                    })
                    .unwrap_or((0, 0));
                warn!(breaker = %key, failure_count = failure_count, "Circuit breaker opened");
                self.events.publish(Event::BreakerOpened {
                    key: key.to_string(),
                    failure_count,
                    retry_after_ms,
                });
                if let Some(cascade) = self.cascade.upgrade() {
                    cascade.on_transition(key, transition);
                }
            }
            Transition::Closed => {
                if let Some(worker_id) = key.worker_id() {
                    self.registry.set_breaker_open(worker_id, false);
                }
                info!(breaker = %key, "Circuit breaker closed");
                self.events.publish(Event::BreakerClosed { key: key.to_string() });
            }
            Transition::HalfOpened => {}
        }
    }
}
