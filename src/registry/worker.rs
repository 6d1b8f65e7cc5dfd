use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Enumerated worker category tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerCategory {
    AiAgent,
    Integration,
    Database,
    ExternalApi,
    Workflow,
    Infrastructure,
}

impl WorkerCategory {
    pub const ALL: [WorkerCategory; 6] = [
        Self::AiAgent,
        Self::Integration,
        Self::Database,
        Self::ExternalApi,
        Self::Workflow,
        Self::Infrastructure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AiAgent => "AI_AGENT",
            Self::Integration => "INTEGRATION",
            Self::Database => "DATABASE",
            Self::ExternalApi => "EXTERNAL_API",
            Self::Workflow => "WORKFLOW",
            Self::Infrastructure => "INFRASTRUCTURE",
        }
    }
}

impl std::fmt::Display for WorkerCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Ready,
    Busy,
    CircuitOpen,
    Offline,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Busy => "BUSY",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::Offline => "OFFLINE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLoad {
    pub current: u32,
    pub max: u32,
}

impl WorkerLoad {
    pub fn has_capacity(&self) -> bool {
        self.current < self.max
    }

    /// Fraction of capacity in use, 0.0 to 1.0
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 1.0;
        }
        (self.current as f64 / self.max as f64).min(1.0)
    }
}

/// Rolling performance over the most recent outcomes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub success_rate: f64,
    pub avg_latency: Duration,
    /// Outcomes currently inside the rolling window
    pub samples: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
}

/// Registration request for a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub id: String,
    pub category: WorkerCategory,
    pub capabilities: BTreeSet<String>,
    pub max_concurrent: u32,
}

impl WorkerSpec {
    pub fn new(id: impl Into<String>, category: WorkerCategory) -> Self {
        Self {
            id: id.into(),
            category,
            capabilities: BTreeSet::new(),
            max_concurrent: 1,
        }
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_concurrent(mut self, max: u32) -> Self {
        self.max_concurrent = max;
        self
    }
}

/// Point-in-time copy of a worker's registry entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: String,
    pub category: WorkerCategory,
    pub capabilities: BTreeSet<String>,
    pub status: WorkerStatus,
    pub load: WorkerLoad,
    pub performance: PerformanceStats,
    pub pending_removal: bool,
}
