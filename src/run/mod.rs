//! Run lifecycle types shared by the executor, planner, and store.
//!
//! A run is one attempt-cycle against a job's target, bounded by
//! `max_attempts` and the escalation planner. The status graph is closed:
//! queued → running → (completed | failed | waiting-for-human), and
//! waiting-for-human → queued on intervention resolution. Nothing else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::EngineMode;

/// Engine tier, in escalation (and cost) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineTier {
    Http,
    Browser,
    Provider,
}

impl EngineTier {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Browser => "browser",
            Self::Provider => "provider",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "http" => Some(Self::Http),
            "browser" => Some(Self::Browser),
            "provider" => Some(Self::Provider),
            _ => None,
        }
    }

    /// The next more capable (and more expensive) tier, if any.
    #[must_use]
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Http => Some(Self::Browser),
            Self::Browser => Some(Self::Provider),
            Self::Provider => None,
        }
    }

    /// The tier an explicit engine mode pins a run to.
    #[must_use]
    pub fn from_mode(mode: EngineMode) -> Option<Self> {
        match mode {
            EngineMode::Auto => None,
            EngineMode::Http => Some(Self::Http),
            EngineMode::Browser => Some(Self::Browser),
            EngineMode::Provider => Some(Self::Provider),
        }
    }

    /// Relative cost of one attempt on this tier, in abstract units
    /// (provider calls bill real credits; browser time is CPU-heavy;
    /// plain HTTP is nearly free).
    #[must_use]
    pub fn unit_cost(&self) -> u32 {
        match self {
            Self::Http => 1,
            Self::Browser => 5,
            Self::Provider => 25,
        }
    }
}

impl std::fmt::Display for EngineTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run status. Terminal states are `Completed`, `Failed`, and
/// `WaitingForHuman`; the last one is re-openable through intervention
/// resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    WaitingForHuman,
    Failed,
    Completed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::WaitingForHuman => "waiting_for_human",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "waiting_for_human" => Some(Self::WaitingForHuman),
            "failed" => Some(Self::Failed),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Whether `self → to` is a legal edge in the lifecycle graph.
    #[must_use]
    pub fn can_transition(&self, to: RunStatus) -> bool {
        matches!(
            (self, to),
            (Self::Queued, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::WaitingForHuman)
                | (Self::WaitingForHuman, Self::Queued)
        )
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::WaitingForHuman)
    }
}

/// Machine-readable failure taxonomy carried by failed runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    Blocked,
    RateLimited,
    Timeout,
    Network,
    BadResponse,
    Unknown,
}

impl FailureCode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocked => "blocked",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::BadResponse => "bad_response",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "blocked" => Some(Self::Blocked),
            "rate_limited" => Some(Self::RateLimited),
            "timeout" => Some(Self::Timeout),
            "network" => Some(Self::Network),
            "bad_response" => Some(Self::BadResponse),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Failure codes that earn a rescheduled run with backoff rather than
    /// a hard stop.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::RateLimited | Self::Unknown)
    }
}

/// One engine attempt inside a run, kept for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineAttempt {
    pub engine: EngineTier,
    /// Why the planner chose this tier
    pub bias_reason: String,
    pub response_code: Option<u16>,
    /// Block/gating signals the classifier observed
    pub signals: Vec<String>,
    /// Classifier decision tag for this attempt
    pub decision: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

/// A run row as the executor sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub job_id: String,
    pub status: RunStatus,
    /// Position in the cross-run retry chain (1-based)
    pub attempt: u32,
    pub max_attempts: u32,
    pub requested_strategy: EngineMode,
    /// Tier that actually produced the outcome, once known
    pub resolved_strategy: Option<EngineTier>,
    pub failure_code: Option<FailureCode>,
    /// Free-shape stats blob (records extracted, escalations, durations)
    pub stats: serde_json::Value,
    pub engine_attempts: Vec<EngineAttempt>,
    /// Earliest time a worker may claim this run (backoff lands here)
    pub scheduled_at: i64,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

impl Run {
    /// Number of engine attempts already burned in this run.
    #[must_use]
    pub fn attempts_used(&self) -> u32 {
        self.engine_attempts.len() as u32
    }
}

/// Cross-run retry backoff: min(300, 10 × 3^(attempt−1)) seconds.
///
/// Attempt is the 1-based position of the run that just failed.
#[must_use]
pub fn retry_backoff_secs(attempt: u32) -> i64 {
    let exp = attempt.saturating_sub(1).min(8);
    let delay = 10i64.saturating_mul(3i64.saturating_pow(exp));
    delay.min(300)
}
