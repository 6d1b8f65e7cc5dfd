//! Event stream for workflow, breaker, cascade and error notifications
//!
//! Events are stamped with a global sequence number and fanned out to every
//! subscriber over a broadcast channel, and to any registered [`EventSink`].
//! Stamping and sending happen under one lock, so subscribers see events in
//! sequence order. In particular, the events of one workflow arrive in the
//! order they were published.

use crate::aggregator::{ErrorRecord, RiskLevel};
use crate::cascade::CascadePreventionRecord;
use crate::core::errors::ErrorCode;
use crate::task::TaskId;
use async_broadcast::{InactiveReceiver, Receiver, RecvError, Sender, TryRecvError, TrySendError};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

pub const EVENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "workflow.created")]
    WorkflowCreated {
        workflow_id: String,
        task_count: usize,
        phase_count: usize,
        risk_level: RiskLevel,
    },
    #[serde(rename = "workflow.progress")]
    WorkflowProgress {
        workflow_id: String,
        /// 1-based number of the phase that just finished
        phase: usize,
        phase_count: usize,
        progress_percent: u8,
        succeeded: Vec<TaskId>,
        failed: Vec<TaskId>,
    },
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted {
        workflow_id: String,
        duration_ms: u64,
        tasks: usize,
    },
    #[serde(rename = "workflow.failed")]
    WorkflowFailed {
        workflow_id: String,
        code: ErrorCode,
        message: String,
        record: Option<ErrorRecord>,
    },
    #[serde(rename = "breaker.opened")]
    BreakerOpened {
        key: String,
        failure_count: u32,
        retry_after_ms: u64,
    },
    #[serde(rename = "breaker.closed")]
    BreakerClosed { key: String },
    #[serde(rename = "cascade.prevented")]
    CascadePrevented { record: CascadePreventionRecord },
    #[serde(rename = "error.reported")]
    ErrorReported {
        record: ErrorRecord,
        risk_level: RiskLevel,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkflowCreated { .. } => "workflow.created",
            Self::WorkflowProgress { .. } => "workflow.progress",
            Self::WorkflowCompleted { .. } => "workflow.completed",
            Self::WorkflowFailed { .. } => "workflow.failed",
            Self::BreakerOpened { .. } => "breaker.opened",
            Self::BreakerClosed { .. } => "breaker.closed",
            Self::CascadePrevented { .. } => "cascade.prevented",
            Self::ErrorReported { .. } => "error.reported",
        }
    }

    pub fn workflow_id(&self) -> Option<&str> {
        match self {
            Self::WorkflowCreated { workflow_id, .. }
            | Self::WorkflowProgress { workflow_id, .. }
            | Self::WorkflowCompleted { workflow_id, .. }
            | Self::WorkflowFailed { workflow_id, .. } => Some(workflow_id),
            Self::ErrorReported { record, .. } => record.workflow_id.as_deref(),
            _ => None,
        }
    }
}

/// Event envelope with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub version: u32,
    pub sequence: u64,
    pub workflow_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}

/// Fire-and-forget consumer of events, e.g. a metrics or log pipeline.
/// Called synchronously on the publishing path; must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, envelope: &EventEnvelope);
}

pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, envelope: &EventEnvelope) {
        debug!(
            sequence = envelope.sequence,
            event = envelope.event.name(),
            workflow_id = envelope.workflow_id.as_deref().unwrap_or("-"),
            "Event: {:?}",
            envelope.event
        );
    }
}

/// Collects every envelope it sees
#[derive(Default, Clone)]
pub struct BufferingEventSink {
    events: Arc<RwLock<Vec<EventEnvelope>>>,
}

impl BufferingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_events(&self) -> Vec<EventEnvelope> {
        self.events.read().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.read().iter().map(|e| e.event.name()).collect()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl EventSink for BufferingEventSink {
    fn emit(&self, envelope: &EventEnvelope) {
        self.events.write().push(envelope.clone());
    }
}

pub struct EventBus {
    sender: Sender<EventEnvelope>,
    // keeps the channel open while nobody is subscribed
    _keepalive: InactiveReceiver<EventEnvelope>,
    sequence: Mutex<u64>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (mut sender, receiver) = async_broadcast::broadcast(capacity.max(1));
        // slow subscribers lose the oldest events rather than stalling publishers
        sender.set_overflow(true);
        sender.set_await_active(false);
        Self {
            sender,
            _keepalive: receiver.deactivate(),
            sequence: Mutex::new(0),
            sinks: RwLock::new(Vec::new()),
        }
    }

    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.new_receiver(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish an event and return its sequence number. Never blocks.
    pub fn publish(&self, event: Event) -> u64 {
        let sinks: Vec<_> = self.sinks.read().iter().cloned().collect();
        let mut sequence = self.sequence.lock();
        *sequence += 1;
        let envelope = EventEnvelope {
            version: EVENT_VERSION,
            sequence: *sequence,
            workflow_id: event.workflow_id().map(str::to_string),
            timestamp: Utc::now(),
            event,
        };

        for sink in &sinks {
            sink.emit(&envelope);
        }

        let seq = envelope.sequence;
        let name = envelope.event.name();
        match self.sender.try_broadcast(envelope) {
            Ok(Some(_dropped)) => debug!(event = name, "Event channel full, dropped oldest event"),
            Ok(None) => {}
            Err(TrySendError::Inactive(_)) => {}
            Err(TrySendError::Full(_)) => warn!(event = name, "Event channel full"),
            Err(TrySendError::Closed(_)) => warn!(event = name, "Event channel closed"),
        }
        seq
    }
}

/// Receiving half handed to subscribers
pub struct EventSubscription {
    receiver: Receiver<EventEnvelope>,
}

impl EventSubscription {
    /// Next event, or `None` once the bus is gone. Skips past overflow gaps.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(RecvError::Overflowed(missed)) => {
                    warn!(missed = missed, "Subscriber lagged, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) => return Some(envelope),
                Err(TryRecvError::Overflowed(missed)) => {
                    warn!(missed = missed, "Subscriber lagged, events dropped");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain everything currently buffered
    pub fn drain(&mut self) -> Vec<EventEnvelope> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
