use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Stable, user-visible error codes.
///
/// Every [`BulwarkError`] maps to exactly one code. The string form returned by
/// [`ErrorCode::as_str`] is part of the public contract and never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    CyclicDependency,
    BreakerOpen,
    NoWorkerAvailable,
    TaskFailed,
    RecoveryExhausted,
    Timeout,
    InvalidRequest,
    NotFound,
    Cancelled,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CyclicDependency => "CYCLIC_DEPENDENCY",
            Self::BreakerOpen => "BREAKER_OPEN",
            Self::NoWorkerAvailable => "NO_WORKER_AVAILABLE",
            Self::TaskFailed => "TASK_FAILED",
            Self::RecoveryExhausted => "RECOVERY_EXHAUSTED",
            Self::Timeout => "TIMEOUT",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::NotFound => "NOT_FOUND",
            Self::Cancelled => "CANCELLED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for the orchestration core
#[derive(Debug, Error)]
pub enum BulwarkError {
    /// The declared task graph contains a cycle
    #[error("Cyclic dependency detected at task {task_id} (cycle: {})", cycle.join(" -> "))]
    CyclicDependency { task_id: String, cycle: Vec<String> },

    /// A circuit breaker rejected the call without invoking the work
    #[error("Circuit breaker open for {key}, retry after {}ms", retry_after.as_millis())]
    BreakerOpen { key: String, retry_after: Duration },

    /// No READY worker with spare capacity could take the task
    #[error("No worker available for task {task_id}: {reason}")]
    NoWorkerAvailable { task_id: String, reason: String },

    /// A task failed after its recovery options were used up
    #[error("Task {task_id} failed: {message}")]
    TaskFailed {
        task_id: String,
        record_id: Option<String>,
        message: String,
    },

    /// Recovery ran but verification did not succeed
    #[error("Recovery exhausted for task {task_id} after {attempts} attempt(s) using {strategy}")]
    RecoveryExhausted {
        task_id: String,
        strategy: String,
        attempts: u32,
    },

    /// Timeout errors
    #[error("Operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Lookup of a workflow, worker or record failed
    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    /// Cancellation errors
    #[error("Operation was cancelled: {operation}")]
    Cancelled { operation: String },

    /// The external executor reported a failure
    #[error("Execution failed in {component}: {message}")]
    Execution {
        component: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BulwarkError {
    pub fn cyclic_dependency<S: Into<String>>(task_id: S, cycle: Vec<String>) -> Self {
        Self::CyclicDependency {
            task_id: task_id.into(),
            cycle,
        }
    }

    pub fn breaker_open<S: Into<String>>(key: S, retry_after: Duration) -> Self {
        Self::BreakerOpen {
            key: key.into(),
            retry_after,
        }
    }

    pub fn no_worker<S: Into<String>, R: Into<String>>(task_id: S, reason: R) -> Self {
        Self::NoWorkerAvailable {
            task_id: task_id.into(),
            reason: reason.into(),
        }
    }

    pub fn task_failed<S: Into<String>, M: Into<String>>(
        task_id: S,
        record_id: Option<String>,
        message: M,
    ) -> Self {
        Self::TaskFailed {
            task_id: task_id.into(),
            record_id,
            message: message.into(),
        }
    }

    pub fn recovery_exhausted<S: Into<String>, T: Into<String>>(
        task_id: S,
        strategy: T,
        attempts: u32,
    ) -> Self {
        Self::RecoveryExhausted {
            task_id: task_id.into(),
            strategy: strategy.into(),
            attempts,
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn not_found<K: Into<String>, S: Into<String>>(kind: K, id: S) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn execution<S: Into<String>, M: Into<String>>(component: S, message: M) -> Self {
        Self::Execution {
            component: component.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable code surfaced to callers
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::CyclicDependency { .. } => ErrorCode::CyclicDependency,
            Self::BreakerOpen { .. } => ErrorCode::BreakerOpen,
            Self::NoWorkerAvailable { .. } => ErrorCode::NoWorkerAvailable,
            Self::TaskFailed { .. } => ErrorCode::TaskFailed,
            Self::RecoveryExhausted { .. } => ErrorCode::RecoveryExhausted,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Validation { .. } | Self::Configuration { .. } => ErrorCode::InvalidRequest,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::Execution { .. } => ErrorCode::TaskFailed,
            Self::Serialization { .. } | Self::Internal { .. } => ErrorCode::Internal,
        }
    }

    /// Structural errors fail at construction or scheduling time and are never retried
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::CyclicDependency { .. }
                | Self::NoWorkerAvailable { .. }
                | Self::Validation { .. }
                | Self::Configuration { .. }
        )
    }

    /// Check if error is eligible for local recovery
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::BreakerOpen { .. } | Self::Timeout { .. } | Self::Execution { .. }
        )
    }

    /// Suggested wait before the same target may be called again
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::BreakerOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// The failure as reported by the executor, without the component prefix
    pub fn failure_message(&self) -> String {
        match self {
            Self::Execution { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, BulwarkError>;

impl From<serde_json::Error> for BulwarkError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for BulwarkError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<anyhow::Error> for BulwarkError {
    fn from(err: anyhow::Error) -> Self {
        Self::Execution {
            component: "collaborator".to_string(),
            message: format!("{:#}", err),
            source: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_codes() {
        let err = BulwarkError::cyclic_dependency("a", vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.code().as_str(), "CYCLIC_DEPENDENCY");
        assert_eq!(err.to_string(), "Cyclic dependency detected at task a (cycle: a -> b -> a)");

        let err = BulwarkError::breaker_open("worker:w1", Duration::from_millis(1500));
        assert_eq!(err.code(), ErrorCode::BreakerOpen);
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));

        assert_eq!(
            BulwarkError::no_worker("t1", "empty pool").code().to_string(),
            "NO_WORKER_AVAILABLE"
        );
        assert_eq!(
            BulwarkError::recovery_exhausted("t1", "RETRY", 3).code().as_str(),
            "RECOVERY_EXHAUSTED"
        );
        assert_eq!(
            BulwarkError::task_failed("t1", None, "boom").code().as_str(),
            "TASK_FAILED"
        );
    }

    #[test]
    fn test_structural_vs_recoverable() {
        assert!(BulwarkError::cyclic_dependency("a", vec![]).is_structural());
        assert!(BulwarkError::no_worker("a", "none").is_structural());
        assert!(!BulwarkError::no_worker("a", "none").is_recoverable());

        assert!(BulwarkError::timeout("call", Duration::from_secs(1)).is_recoverable());
        assert!(BulwarkError::breaker_open("k", Duration::ZERO).is_recoverable());
        assert!(!BulwarkError::validation("bad").is_recoverable());
    }

    #[test]
    fn test_anyhow_conversion() {
        let err: BulwarkError = anyhow::anyhow!("vendor returned 503").into();
        assert_eq!(err.code(), ErrorCode::TaskFailed);
        assert!(err.to_string().contains("vendor returned 503"));
    }

    #[test]
    fn test_failure_message_drops_component() {
        let err = BulwarkError::execution("database-writer", "boom");
        assert_eq!(err.failure_message(), "boom");
        assert!(err.to_string().contains("database-writer"));

        let err = BulwarkError::timeout("call", Duration::from_millis(20));
        assert_eq!(err.failure_message(), err.to_string());
    }

    #[test]
    fn test_code_serializes_as_stable_string() {
        let json = serde_json::to_string(&ErrorCode::NoWorkerAvailable).unwrap();
        assert_eq!(json, "\"NO_WORKER_AVAILABLE\"");
    }
}
