use crate::core::errors::ErrorCode;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Infrastructure,
    Integration,
    #[serde(alias = "DATABASE")]
    Data,
    Performance,
    Security,
    AgentFailure,
    Application,
    ConstraintViolation,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Infrastructure => "INFRASTRUCTURE",
            Self::Integration => "INTEGRATION",
            Self::Data => "DATA",
            Self::Performance => "PERFORMANCE",
            Self::Security => "SECURITY",
            Self::AgentFailure => "AGENT_FAILURE",
            Self::Application => "APPLICATION",
            Self::ConstraintViolation => "CONSTRAINT_VIOLATION",
        }
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            Self::Infrastructure | Self::Integration | Self::AgentFailure => Severity::High,
            Self::Data | Self::Security | Self::ConstraintViolation => Severity::Critical,
            Self::Performance | Self::Application => Severity::Medium,
        }
    }

    pub fn default_strategy(&self) -> RecoveryStrategy {
        match self {
            Self::Infrastructure => RecoveryStrategy::Restart,
            Self::Integration | Self::AgentFailure => RecoveryStrategy::Failover,
            Self::Data | Self::Security => RecoveryStrategy::Manual,
            Self::Performance | Self::Application => RecoveryStrategy::Retry,
            Self::ConstraintViolation => RecoveryStrategy::Rollback,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// 1 (LOW) to 4 (CRITICAL)
    pub fn rank(&self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }

    /// Weight of this severity in the cascade-risk score
    pub fn cascade_weight(&self) -> f64 {
        match self {
            Self::Low => 0.1,
            Self::Medium => 0.3,
            Self::High => 0.6,
            Self::Critical => 0.8,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryStrategy {
    Retry,
    Failover,
    Rollback,
    Restart,
    Manual,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "RETRY",
            Self::Failover => "FAILOVER",
            Self::Rollback => "ROLLBACK",
            Self::Restart => "RESTART",
            Self::Manual => "MANUAL",
        }
    }

    pub fn is_automated(&self) -> bool {
        !matches!(self, Self::Manual)
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            Self::Critical
        } else if score >= 0.6 {
            Self::High
        } else if score >= 0.4 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

/// Lowercased alphanumeric runs of `text`
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// One keyword rule: a run of whole tokens. A trailing `*` lets the last
/// token match as a prefix, so `deserializ*` covers `deserialize` and
/// `deserialization` while `oom` never matches inside `boom`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Keyword {
    tokens: Vec<String>,
    stem: bool,
}

impl Keyword {
    fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let (body, stem) = match trimmed.strip_suffix('*') {
            Some(body) => (body, true),
            None => (trimmed, false),
        };
        let tokens = tokenize(body);
        if tokens.is_empty() {
            return None;
        }
        Some(Self { tokens, stem })
    }

    fn matches(&self, message: &[String]) -> bool {
        let last = self.tokens.len() - 1;
        message.windows(self.tokens.len()).any(|window| {
            window.iter().zip(&self.tokens).enumerate().all(|(i, (word, want))| {
                if i == last && self.stem {
                    word.starts_with(want.as_str())
                } else {
                    word == want
                }
            })
        })
    }
}

/// Keyword rules mapping failure messages to categories.
///
/// Rules are checked in order; the first category with a matching keyword
/// wins. Messages and keywords are split into lowercase alphanumeric tokens
/// and compared token by token, so `401` does not match `4010`.
#[derive(Debug, Clone)]
pub struct PatternTable {
    pub version: u32,
    rules: Vec<(ErrorCategory, Vec<Keyword>)>,
}

impl Default for PatternTable {
    fn default() -> Self {
        Self::v1()
    }
}

impl PatternTable {
    pub fn v1() -> Self {
        let rules: [(ErrorCategory, &[&str]); 7] = [
            (
                ErrorCategory::Security,
                &["unauthorized", "forbidden", "permission denied", "invalid token", "certificate*", "401", "403"],
            ),
            (
                ErrorCategory::Data,
                &["corrupt*", "integrity", "deserializ*", "malformed", "database", "deadlock*", "duplicate key"],
            ),
            (
                ErrorCategory::ConstraintViolation,
                &["constraint*", "violat*", "quota exceeded", "policy", "policies"],
            ),
            (
                ErrorCategory::Infrastructure,
                &["out of memory", "oom", "oomkilled", "disk full", "connection refused", "process exited", "crash*", "unreachable", "dns"],
            ),
            (
                ErrorCategory::Performance,
                &["timeout*", "timed out", "deadline*", "too slow", "latency"],
            ),
            (
                ErrorCategory::Integration,
                &["rate limit*", "429", "502", "503", "504", "bad gateway", "upstream", "service unavailable"],
            ),
            (
                ErrorCategory::Application,
                &["panic*", "assertion*", "unexpected", "invalid state"],
            ),
        ];
        Self {
            version: 1,
            rules: rules
                .into_iter()
                .map(|(category, words)| {
                    (category, words.iter().filter_map(|w| Keyword::parse(w)).collect())
                })
                .collect(),
        }
    }

    pub fn with_rule<I, S>(mut self, category: ErrorCategory, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules.push((
            category,
            keywords
                .into_iter()
                .filter_map(|k| {
                    let raw: String = k.into();
                    Keyword::parse(&raw)
                })
                .collect(),
        ));
        self
    }

    pub fn match_message(&self, message: &str) -> Option<ErrorCategory> {
        let tokens = tokenize(message);
        self.rules
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| k.matches(&tokens)))
            .map(|(category, _)| *category)
    }

    /// Declared category wins, then the error code, then message patterns.
    /// Anything unmatched is treated as a worker failure.
    pub fn classify(
        &self,
        declared: Option<ErrorCategory>,
        code: Option<ErrorCode>,
        message: &str,
    ) -> ErrorCategory {
        if let Some(category) = declared {
            return category;
        }
        match code {
            Some(ErrorCode::Timeout) => return ErrorCategory::Performance,
            Some(ErrorCode::BreakerOpen) => return ErrorCategory::AgentFailure,
            Some(ErrorCode::NoWorkerAvailable) => return ErrorCategory::Infrastructure,
            _ => {}
        }
        self.match_message(message)
            .unwrap_or(ErrorCategory::AgentFailure)
    }
}
