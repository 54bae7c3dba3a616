//! Persistent store for runs, jobs, records, events, and learned state.
//!
//! SQLite with WAL mode behind an `sqlx` pool:
//! - Concurrent reads during writes
//! - ACID transactions for record commits and event appends
//! - Compare-and-set status flips for the run lease discipline
//!
//! Sessions are deliberately NOT here; the session vault is one JSON file
//! per (domain, proxy-identity) with atomic rename semantics.

mod domains;
mod interventions;
mod jobs;
mod keys;
mod runs;

pub use domains::{DomainAttempt, DomainConfigRow, EngineStatsRow};
pub use interventions::InterventionTaskRow;
pub use keys::ApiKeyRow;

use std::path::Path;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;

/// SQL schema, idempotent (`CREATE TABLE IF NOT EXISTS`).
const SCHEMA_SQL: &str = r#"
-- Declarative jobs (read-only to the core)
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL DEFAULT '',
    target_url TEXT NOT NULL,
    fields TEXT NOT NULL,
    requires_auth INTEGER NOT NULL DEFAULT 0,
    crawl_mode TEXT NOT NULL DEFAULT 'single',
    list_config TEXT,
    engine_mode TEXT NOT NULL DEFAULT 'auto',
    browser_profile TEXT,
    created_at INTEGER NOT NULL
);

-- Selector specs, unique per (job, field)
CREATE TABLE IF NOT EXISTS field_maps (
    job_id TEXT NOT NULL,
    field TEXT NOT NULL,
    spec TEXT NOT NULL,
    position INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (job_id, field)
);

-- One row per run; status flips are compare-and-set
CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL,
    status TEXT NOT NULL,
    attempt INTEGER NOT NULL DEFAULT 1,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    requested_strategy TEXT NOT NULL DEFAULT 'auto',
    resolved_strategy TEXT,
    failure_code TEXT,
    stats TEXT NOT NULL DEFAULT '{}',
    engine_attempts TEXT NOT NULL DEFAULT '[]',
    scheduled_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    finished_at INTEGER
);

-- Worker claim scans: due queued runs in schedule order
CREATE INDEX IF NOT EXISTS idx_runs_status_sched ON runs(status, scheduled_at);

-- Append-only per-run event log; seq is strictly monotonic per run
CREATE TABLE IF NOT EXISTS run_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    UNIQUE(run_id, seq)
);

CREATE INDEX IF NOT EXISTS idx_run_events_run ON run_events(run_id, seq);

-- Extracted records, written once per successful run in one transaction
CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_run ON records(run_id);

-- Cumulative per-(domain, engine) counters
CREATE TABLE IF NOT EXISTS domain_stats (
    domain TEXT NOT NULL,
    engine TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    successes INTEGER NOT NULL DEFAULT 0,
    records_extracted INTEGER NOT NULL DEFAULT 0,
    total_escalations INTEGER NOT NULL DEFAULT 0,
    captcha_hits INTEGER NOT NULL DEFAULT 0,
    first_seen INTEGER NOT NULL,
    last_updated INTEGER NOT NULL,
    PRIMARY KEY (domain, engine)
);

-- Rolling attempt window feeding block-rate computation
CREATE TABLE IF NOT EXISTS domain_attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    domain TEXT NOT NULL,
    engine TEXT NOT NULL,
    success INTEGER NOT NULL,
    response_code INTEGER,
    had_captcha INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_domain_attempts_domain ON domain_attempts(domain, id);

-- Learned per-domain classification
CREATE TABLE IF NOT EXISTS domain_config (
    domain TEXT PRIMARY KEY,
    access_class TEXT NOT NULL DEFAULT 'public',
    requires_session TEXT NOT NULL DEFAULT 'no',
    provider_preferred INTEGER NOT NULL DEFAULT 0,
    block_patterns TEXT,
    updated_at INTEGER NOT NULL
);

-- Human-in-the-loop tasks
CREATE TABLE IF NOT EXISTS intervention_tasks (
    id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL,
    run_id TEXT,
    domain TEXT NOT NULL DEFAULT '',
    task_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    trigger_reason TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT '{}',
    priority INTEGER NOT NULL DEFAULT 0,
    expires_at INTEGER,
    resolution TEXT,
    resolved_by TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON intervention_tasks(status, expires_at);
CREATE INDEX IF NOT EXISTS idx_tasks_job ON intervention_tasks(job_id, status);
CREATE INDEX IF NOT EXISTS idx_tasks_domain ON intervention_tasks(domain, status);

-- Provider API key credit accounting
CREATE TABLE IF NOT EXISTS api_keys (
    key TEXT PRIMARY KEY,
    provider TEXT NOT NULL DEFAULT 'fetch',
    credits_remaining INTEGER NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    last_used INTEGER
);
"#;

/// Typed error at the store seam.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Handle to the SQLite store. Cheap to clone; all clones share the pool.
#[derive(Clone)]
pub struct Store {
    pub(crate) pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database at `path` and bootstrap the schema.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| sqlx::Error::Io(e))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        Ok(Self { pool })
    }

    /// In-memory store for tests and ephemeral tooling.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .journal_mode(SqliteJournalMode::Memory);

        // A single connection: every handle must observe the same
        // in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
