use crate::aggregator::{ErrorCategory, RecoveryStrategy};
use crate::breaker::BreakerConfig;
use crate::cascade::FallbackKind;
use crate::core::errors::{BulwarkError, Result};
use crate::registry::WorkerCategory;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Top-level configuration for the orchestration core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub breaker: BreakerSettings,
    pub cascade: CascadeSettings,
    pub aggregator: AggregatorSettings,
    pub recovery: RecoverySettings,
    pub engine: EngineSettings,
    pub logging: LoggingSettings,
}

/// Circuit breaker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Per-worker breaker config overriding the built-in category preset
    pub overrides: HashMap<WorkerCategory, BreakerConfig>,
    /// Category breakers trip at `worker threshold * multiplier`
    pub category_threshold_multiplier: u32,
    pub category_success_threshold: u32,
    /// Category breakers stay open `worker open duration * multiplier`
    pub category_open_multiplier: u32,
    /// Hard limit on every breaker-wrapped call
    pub call_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            overrides: HashMap::new(),
            category_threshold_multiplier: 2,
            category_success_threshold: 5,
            category_open_multiplier: 2,
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl BreakerSettings {
    /// Config for a breaker keyed by worker id
    pub fn worker_config(&self, category: WorkerCategory) -> BreakerConfig {
        self.overrides
            .get(&category)
            .cloned()
            .unwrap_or_else(|| BreakerConfig::for_category(category))
    }

    /// Looser config for the breaker guarding a whole category
    pub fn category_config(&self, category: WorkerCategory) -> BreakerConfig {
        let base = self.worker_config(category);
        BreakerConfig {
            failure_threshold: base.failure_threshold * self.category_threshold_multiplier,
            open_duration: base.open_duration * self.category_open_multiplier,
            half_open_success_threshold: self.category_success_threshold,
        }
    }
}

/// Cascade Guard tuning and the declared worker dependency map
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeSettings {
    /// `worker id -> ids of workers that depend on it`
    pub dependencies: HashMap<String, BTreeSet<String>>,
    /// Fallback routing applied to dependents of a failing worker, per category
    pub fallbacks: HashMap<WorkerCategory, FallbackKind>,
    /// How long tightened thresholds and fallbacks stay in force
    pub cooldown: Duration,
    /// Cascade risk above which the aggregator invokes the guard
    pub risk_trigger: f64,
    pub max_records: usize,
}

impl Default for CascadeSettings {
    fn default() -> Self {
        Self {
            dependencies: HashMap::new(),
            fallbacks: HashMap::new(),
            cooldown: Duration::from_secs(300),
            risk_trigger: 0.7,
            max_records: 1_000,
        }
    }
}

/// Error Aggregator retention and correlation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorSettings {
    pub retention: Duration,
    pub max_records: usize,
    pub correlation_window: Duration,
    pub correlation_threshold: f64,
    /// Number of active errors at which the load term of cascade risk saturates
    pub active_error_saturation: usize,
    pub infra_critical: Vec<ErrorCategory>,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3600),
            max_records: 10_000,
            correlation_window: Duration::from_secs(300),
            correlation_threshold: 0.7,
            active_error_saturation: 20,
            infra_critical: vec![ErrorCategory::Infrastructure],
        }
    }
}

/// Recovery Orchestrator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    /// Replaces the taxonomy's default strategy for the given categories
    pub strategy_overrides: HashMap<ErrorCategory, RecoveryStrategy>,
    pub max_retry_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub max_failover_attempts: u32,
    /// Upper bound on any single verification step
    pub verification_timeout: Duration,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            strategy_overrides: HashMap::new(),
            max_retry_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
            max_failover_attempts: 2,
            verification_timeout: Duration::from_secs(30),
        }
    }
}

impl RecoverySettings {
    /// Backoff before retry `attempt` (1-based), capped at `max_backoff`
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let base = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exp);
        let capped = base.min(self.max_backoff.as_secs_f64());
        let delay = if self.jitter {
            // up to 10% extra so synchronized retries spread out
            capped * (1.0 + fastrand::f64() * 0.1)
        } else {
            capped
        };
        Duration::from_secs_f64(delay.min(self.max_backoff.as_secs_f64()))
    }
}

/// Workflow Engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Bounded pool of concurrent task dispatches per process
    pub max_concurrent_dispatch: usize,
    pub max_archived_workflows: usize,
    pub default_estimated_cost: f64,
    pub event_capacity: usize,
    /// Progress reported for a workflow that has been planned but not started
    pub organized_progress: u8,
    /// Number of recent outcomes kept per worker for rolling performance
    pub performance_window: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_dispatch: 32,
            max_archived_workflows: 1_000,
            default_estimated_cost: 60.0,
            event_capacity: 1_024,
            organized_progress: 10,
            performance_window: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (category, cfg) in &self.breaker.overrides {
            cfg.validate()
                .map_err(|e| BulwarkError::configuration_field(e, format!("breaker.overrides.{}", category.as_str())))?;
        }
        if self.breaker.category_threshold_multiplier == 0 {
            return Err(BulwarkError::configuration_field(
                "category_threshold_multiplier must be greater than 0",
                "breaker.category_threshold_multiplier",
            ));
        }
        if self.breaker.category_success_threshold == 0 {
            return Err(BulwarkError::configuration_field(
                "category_success_threshold must be greater than 0",
                "breaker.category_success_threshold",
            ));
        }
        if self.breaker.call_timeout.is_zero() {
            return Err(BulwarkError::configuration_field(
                "call_timeout must be greater than 0",
                "breaker.call_timeout",
            ));
        }
        if self.cascade.cooldown.is_zero() {
            return Err(BulwarkError::configuration_field(
                "cooldown must be greater than 0",
                "cascade.cooldown",
            ));
        }
        if !(0.0..=1.0).contains(&self.cascade.risk_trigger) {
            return Err(BulwarkError::configuration_field(
                "risk_trigger must be between 0 and 1",
                "cascade.risk_trigger",
            ));
        }
        for (source, dependents) in &self.cascade.dependencies {
            if dependents.contains(source) {
                return Err(BulwarkError::configuration_field(
                    format!("worker {} cannot depend on itself", source),
                    "cascade.dependencies",
                ));
            }
        }
        if self.aggregator.max_records == 0 {
            return Err(BulwarkError::configuration_field(
                "max_records must be greater than 0",
                "aggregator.max_records",
            ));
        }
        if self.aggregator.retention.is_zero() || self.aggregator.correlation_window.is_zero() {
            return Err(BulwarkError::configuration(
                "aggregator retention and correlation_window must be greater than 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.aggregator.correlation_threshold) {
            return Err(BulwarkError::configuration_field(
                "correlation_threshold must be between 0 and 1",
                "aggregator.correlation_threshold",
            ));
        }
        if self.aggregator.active_error_saturation == 0 {
            return Err(BulwarkError::configuration_field(
                "active_error_saturation must be greater than 0",
                "aggregator.active_error_saturation",
            ));
        }
        if self.recovery.backoff_multiplier < 1.0 {
            return Err(BulwarkError::configuration_field(
                "backoff_multiplier must be at least 1.0",
                "recovery.backoff_multiplier",
            ));
        }
        if self.recovery.initial_backoff > self.recovery.max_backoff {
            return Err(BulwarkError::configuration_field(
                "initial_backoff cannot exceed max_backoff",
                "recovery.initial_backoff",
            ));
        }
        if self.recovery.verification_timeout.is_zero() {
            return Err(BulwarkError::configuration_field(
                "verification_timeout must be greater than 0",
                "recovery.verification_timeout",
            ));
        }
        if self.engine.max_concurrent_dispatch == 0 {
            return Err(BulwarkError::configuration_field(
                "max_concurrent_dispatch must be greater than 0",
                "engine.max_concurrent_dispatch",
            ));
        }
        if self.engine.event_capacity == 0 {
            return Err(BulwarkError::configuration_field(
                "event_capacity must be greater than 0",
                "engine.event_capacity",
            ));
        }
        if self.engine.max_archived_workflows == 0 {
            return Err(BulwarkError::configuration_field(
                "max_archived_workflows must be greater than 0",
                "engine.max_archived_workflows",
            ));
        }
        if self.engine.performance_window == 0 {
            return Err(BulwarkError::configuration_field(
                "performance_window must be greater than 0",
                "engine.performance_window",
            ));
        }
        if self.engine.organized_progress > 100 {
            return Err(BulwarkError::configuration_field(
                "organized_progress must be a percentage",
                "engine.organized_progress",
            ));
        }
        Ok(())
    }

    /// Short windows and sensitive breakers for local runs and tests
    pub fn development() -> Self {
        let mut config = Self::default();
        config.breaker.call_timeout = Duration::from_secs(5);
        config.cascade.cooldown = Duration::from_secs(10);
        config.aggregator.retention = Duration::from_secs(300);
        config.aggregator.max_records = 1_000;
        config.recovery.initial_backoff = Duration::from_millis(10);
        config.recovery.max_backoff = Duration::from_millis(200);
        config.recovery.jitter = false;
        config.recovery.verification_timeout = Duration::from_secs(5);
        config.engine.max_concurrent_dispatch = 8;
        config.engine.max_archived_workflows = 100;
        config.logging.level = "debug".to_string();
        config
    }

    /// Default thresholds with a larger dispatch pool and event buffer
    pub fn production() -> Self {
        let mut config = Self::default();
        config.engine.max_concurrent_dispatch = 128;
        config.engine.event_capacity = 8_192;
        config.logging.level = "warn".to_string();
        config
    }
}
