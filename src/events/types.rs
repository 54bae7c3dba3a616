//! Run event type definitions.
//!
//! Events are the audit trail: every state transition, engine attempt,
//! escalation, pause, resolution, and record commit produces exactly one
//! event, ordered within a run by a strictly monotonic sequence number.

use serde::{Deserialize, Serialize};

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl EventLevel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Parse the storage representation; unknown strings read as info.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// One persisted run event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Row id in the store
    pub id: i64,
    pub run_id: String,
    /// Strictly monotonic within a run, starting at 1
    pub seq: i64,
    pub level: EventLevel,
    pub message: String,
    /// Structured context (engine, signals, decision, counts)
    pub metadata: serde_json::Value,
    pub created_at: i64,
}

/// Well-known event messages, so subscribers can match without parsing
/// free text.
pub mod messages {
    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_COMPLETED: &str = "run.completed";
    pub const RUN_FAILED: &str = "run.failed";
    pub const RUN_REQUEUED: &str = "run.requeued";
    pub const ENGINE_ATTEMPT: &str = "engine.attempt";
    pub const ENGINE_ESCALATED: &str = "engine.escalated";
    pub const RECORDS_PERSISTED: &str = "records.persisted";
    pub const INTERVENTION_CREATED: &str = "intervention.created";
    pub const INTERVENTION_RESOLVED: &str = "intervention.resolved";
    pub const INTERVENTION_CANCELLED: &str = "intervention.cancelled";
    pub const INTERVENTION_EXPIRED: &str = "intervention.expired";
    pub const SESSION_CAPTURED: &str = "session.captured";
    pub const SESSION_RETIRED: &str = "session.retired";
}
