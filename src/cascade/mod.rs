//! Cascade Guard
//!
//! When a worker starts failing, the workers that depend on it are the next
//! likely casualties. The guard looks them up in a declared dependency map
//! and makes their breakers more sensitive for a cooldown window: the failure
//! threshold is halved (never below 1) and, if a fallback is configured for
//! the dependent's category, the dependent is marked for fallback routing.
//!
//! Dependents are never forced open. Each intervention is published as a
//! `cascade.prevented` event.

use crate::breaker::{BreakerKey, BreakerObserver, BreakerTable, Transition};
use crate::core::config::CascadeSettings;
use crate::events::{Event, EventBus};
use crate::registry::{WorkerCategory, WorkerRegistry};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FallbackKind {
    CachedResponse,
    AlternativeProvider,
    ReadonlyMode,
    DefaultValues,
    SimplifiedFlow,
}

impl FallbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CachedResponse => "CACHED_RESPONSE",
            Self::AlternativeProvider => "ALTERNATIVE_PROVIDER",
            Self::ReadonlyMode => "READONLY_MODE",
            Self::DefaultValues => "DEFAULT_VALUES",
            Self::SimplifiedFlow => "SIMPLIFIED_FLOW",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CascadeTrigger {
    BreakerOpened,
    HighRisk { cascade_risk: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependentAction {
    pub worker_id: String,
    pub previous_threshold: u32,
    pub tightened_threshold: u32,
    pub fallback: Option<FallbackKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadePreventionRecord {
    pub id: String,
    pub source_worker: String,
    pub trigger: CascadeTrigger,
    pub dependents: Vec<String>,
    pub actions_applied: Vec<DependentAction>,
    pub timestamp: DateTime<Utc>,
    pub cooldown_until: DateTime<Utc>,
}

pub struct CascadeGuard {
    settings: CascadeSettings,
    dependencies: RwLock<HashMap<String, BTreeSet<String>>>,
    breakers: Arc<BreakerTable>,
    registry: Arc<WorkerRegistry>,
    events: Arc<EventBus>,
    fallback_routes: DashMap<String, (FallbackKind, Instant)>,
    history: Mutex<VecDeque<CascadePreventionRecord>>,
    prevented: AtomicU64,
}

impl CascadeGuard {
    pub fn new(
        settings: CascadeSettings,
        breakers: Arc<BreakerTable>,
        registry: Arc<WorkerRegistry>,
        events: Arc<EventBus>,
    ) -> Self {
        let dependencies = settings.dependencies.clone();
        Self {
            settings,
            dependencies: RwLock::new(dependencies),
            breakers,
            registry,
            events,
            fallback_routes: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            prevented: AtomicU64::new(0),
        }
    }

    /// Declare that `dependents` rely on `source`. Adds to any existing entry.
    pub fn declare_dependents<I, S>(&self, source: &str, dependents: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut map = self.dependencies.write();
        let entry = map.entry(source.to_string()).or_default();
        for dep in dependents {
            let dep = dep.into();
            if dep != source {
                entry.insert(dep);
            }
        }
    }

    pub fn dependents_of(&self, source: &str) -> Vec<String> {
        self.dependencies
            .read()
            .get(source)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn protect_dependents(
        &self,
        source: &str,
        trigger: CascadeTrigger,
    ) -> Option<CascadePreventionRecord> {
        self.protect_dependents_at(source, trigger, Instant::now())
    }

    /// Tighten every direct dependent of `source`. Returns `None` when no
    /// dependents are declared.
    pub fn protect_dependents_at(
        &self,
        source: &str,
        trigger: CascadeTrigger,
        now: Instant,
    ) -> Option<CascadePreventionRecord> {
        let dependents = self.dependents_of(source);
        if dependents.is_empty() {
            debug!(source = %source, "No declared dependents, nothing to protect");
            return None;
        }

        let until = now + self.settings.cooldown;
        let mut actions = Vec::with_capacity(dependents.len());
        for dependent in &dependents {
            let Some(category) = self.registry.category_of(dependent) else {
                debug!(worker_id = %dependent, "Dependent not registered, skipping");
                continue;
            };
            actions.push(self.tighten(dependent, category, now, until));
        }

        let timestamp = Utc::now();
        let cooldown = chrono::Duration::from_std(self.settings.cooldown)
            .unwrap_or(chrono::Duration::zero());
        let record = CascadePreventionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            source_worker: source.to_string(),
            trigger,
            dependents,
            actions_applied: actions,
            timestamp,
            cooldown_until: timestamp + cooldown,
        };

        warn!(
            source = %source,
            dependents = ?record.dependents,
            actions = record.actions_applied.len(),
            "Cascade prevention applied"
        );

        {
            let mut history = self.history.lock();
            if history.len() >= self.settings.max_records.max(1) {
                history.pop_front();
            }
            history.push_back(record.clone());
        }
        self.prevented.fetch_add(1, Ordering::Relaxed);
        self.events.publish(Event::CascadePrevented {
            record: record.clone(),
        });
        Some(record)
    }

    fn tighten(
        &self,
        worker_id: &str,
        category: WorkerCategory,
        now: Instant,
        until: Instant,
    ) -> DependentAction {
        let breaker = self.breakers.worker_breaker(worker_id, category);
        let previous_threshold = breaker.failure_threshold_at(now);
        let halved = (breaker.config().failure_threshold / 2).max(1);
        let tightened_threshold = breaker.tighten_until(halved, until);

        let fallback = self.settings.fallbacks.get(&category).copied();
        if let Some(kind) = fallback {
            self.fallback_routes
                .insert(worker_id.to_string(), (kind, until));
        }

        DependentAction {
            worker_id: worker_id.to_string(),
            previous_threshold,
            tightened_threshold,
            fallback,
        }
    }

    /// Active fallback for a worker, if its cooldown has not expired
    pub fn fallback_for(&self, worker_id: &str) -> Option<FallbackKind> {
        self.fallback_for_at(worker_id, Instant::now())
    }

    pub fn fallback_for_at(&self, worker_id: &str, now: Instant) -> Option<FallbackKind> {
        let (kind, until) = *self.fallback_routes.get(worker_id)?;
        if now < until {
            Some(kind)
        } else {
            self.fallback_routes
                .remove_if(worker_id, |_, (_, u)| now >= *u);
            None
        }
    }

    /// Drop expired fallback routes. Thresholds restore themselves lazily.
    pub fn restore_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.fallback_routes.len();
        self.fallback_routes.retain(|_, (_, until)| now < *until);
        before - self.fallback_routes.len()
    }

    pub fn history(&self) -> Vec<CascadePreventionRecord> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn cascades_prevented(&self) -> u64 {
        self.prevented.load(Ordering::Relaxed)
    }
}

impl BreakerObserver for CascadeGuard {
    fn on_transition(&self, key: &BreakerKey, transition: Transition) {
        if transition != Transition::Opened {
            return;
        }
        if let Some(worker_id) = key.worker_id() {
            self.protect_dependents(worker_id, CascadeTrigger::BreakerOpened);
        }
    }
}
