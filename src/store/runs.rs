//! Run rows: lease discipline, attempt audit, records, and the event log.
//!
//! Status flips are compare-and-set (`UPDATE ... WHERE status = ?`), so a
//! duplicate enqueue or a racing worker loses the race cleanly instead of
//! double-executing.

use sqlx::Row;
use uuid::Uuid;

use crate::events::{EventLevel, RunEvent};
use crate::job::EngineMode;
use crate::run::{EngineAttempt, EngineTier, FailureCode, Run, RunStatus};
use crate::utils::now_unix;

use super::{Store, StoreError, StoreResult};

impl Store {
    /// Create a queued run for a job.
    pub async fn create_run(
        &self,
        job_id: &str,
        requested_strategy: EngineMode,
        attempt: u32,
        max_attempts: u32,
        scheduled_at: i64,
    ) -> StoreResult<Run> {
        let id = Uuid::new_v4().to_string();
        let now = now_unix();

        sqlx::query(
            r#"
            INSERT INTO runs
                (id, job_id, status, attempt, max_attempts, requested_strategy,
                 scheduled_at, created_at)
            VALUES (?, ?, 'queued', ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(job_id)
        .bind(attempt as i64)
        .bind(max_attempts as i64)
        .bind(requested_strategy.as_str())
        .bind(scheduled_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.fetch_run(&id).await?.ok_or(StoreError::NotFound {
            entity: "run",
            id,
        })
    }

    pub async fn fetch_run(&self, id: &str) -> StoreResult<Option<Run>> {
        let row = sqlx::query(
            r#"
            SELECT id, job_id, status, attempt, max_attempts, requested_strategy,
                   resolved_strategy, failure_code, stats, engine_attempts,
                   scheduled_at, created_at, started_at, finished_at
            FROM runs WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| parse_run_row(&row)).transpose()
    }

    /// Non-blocking lease: queued → running. Returns false when another
    /// executor already holds the run (or it is not queued at all).
    pub async fn claim_run(&self, id: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE runs SET status = 'running', started_at = ? WHERE id = ? AND status = 'queued'",
        )
        .bind(now_unix())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// waiting_for_human → queued, used by intervention resolution.
    pub async fn requeue_run(&self, id: &str, scheduled_at: i64) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE runs SET status = 'queued', scheduled_at = ?, failure_code = NULL
            WHERE id = ? AND status = 'waiting_for_human'
            "#,
        )
        .bind(scheduled_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// running → waiting_for_human, used when a pause decision lands.
    pub async fn pause_run_row(&self, id: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE runs SET status = 'waiting_for_human', finished_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(now_unix())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// running → completed | failed with outcome columns.
    pub async fn finish_run(
        &self,
        id: &str,
        status: RunStatus,
        failure_code: Option<FailureCode>,
        resolved_strategy: Option<EngineTier>,
        stats: &serde_json::Value,
    ) -> StoreResult<bool> {
        debug_assert!(matches!(status, RunStatus::Completed | RunStatus::Failed));
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = ?, failure_code = ?, resolved_strategy = ?, stats = ?,
                finished_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(failure_code.map(|c| c.as_str()))
        .bind(resolved_strategy.map(|t| t.as_str()))
        .bind(serde_json::to_string(stats)?)
        .bind(now_unix())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Persist the attempt audit list (engine, signals, decision per tier).
    pub async fn update_engine_attempts(
        &self,
        id: &str,
        attempts: &[EngineAttempt],
    ) -> StoreResult<()> {
        sqlx::query("UPDATE runs SET engine_attempts = ? WHERE id = ?")
            .bind(serde_json::to_string(attempts)?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Due queued run ids in schedule order, for the worker poll.
    pub async fn due_queued_runs(&self, now: i64, limit: u32) -> StoreResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM runs
            WHERE status = 'queued' AND scheduled_at <= ?
            ORDER BY scheduled_at, created_at
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Persist every record from a successful attempt in one transaction.
    ///
    /// Either all records land or none do; a failure here aborts the
    /// attempt with no partial commit.
    pub async fn insert_records(
        &self,
        run_id: &str,
        records: &[serde_json::Map<String, serde_json::Value>],
    ) -> StoreResult<usize> {
        let now = now_unix();
        let mut tx = self.pool.begin().await?;

        for record in records {
            sqlx::query("INSERT INTO records (run_id, payload, created_at) VALUES (?, ?, ?)")
                .bind(run_id)
                .bind(serde_json::to_string(record)?)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(records.len())
    }

    pub async fn count_records(&self, run_id: &str) -> StoreResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM records WHERE run_id = ?")
                .bind(run_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn fetch_records(
        &self,
        run_id: &str,
    ) -> StoreResult<Vec<serde_json::Map<String, serde_json::Value>>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT payload FROM records WHERE run_id = ? ORDER BY id")
                .bind(run_id)
                .fetch_all(&self.pool)
                .await?;

        let mut records = Vec::with_capacity(rows.len());
        for (payload,) in rows {
            records.push(serde_json::from_str(&payload)?);
        }
        Ok(records)
    }

    /// Append one event with the next per-run sequence number.
    ///
    /// The MAX(seq)+1 read and the insert share a transaction, so per-run
    /// sequence numbers are strictly monotonic with no gaps.
    pub async fn append_event(
        &self,
        run_id: &str,
        level: EventLevel,
        message: &str,
        metadata: &serde_json::Value,
    ) -> StoreResult<RunEvent> {
        let now = now_unix();
        let mut tx = self.pool.begin().await?;

        let (next_seq,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM run_events WHERE run_id = ?",
        )
        .bind(run_id)
        .fetch_one(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            INSERT INTO run_events (run_id, seq, level, message, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run_id)
        .bind(next_seq)
        .bind(level.as_str())
        .bind(message)
        .bind(serde_json::to_string(metadata)?)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(RunEvent {
            id: result.last_insert_rowid(),
            run_id: run_id.to_string(),
            seq: next_seq,
            level,
            message: message.to_string(),
            metadata: metadata.clone(),
            created_at: now,
        })
    }

    /// Historical events for a run in sequence order.
    pub async fn events_for_run(&self, run_id: &str) -> StoreResult<Vec<RunEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, seq, level, message, metadata, created_at
            FROM run_events WHERE run_id = ? ORDER BY seq
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let metadata: serde_json::Value =
                serde_json::from_str(row.try_get::<String, _>("metadata")?.as_str())?;
            events.push(RunEvent {
                id: row.try_get("id")?,
                run_id: row.try_get("run_id")?,
                seq: row.try_get("seq")?,
                level: EventLevel::parse(row.try_get::<String, _>("level")?.as_str()),
                message: row.try_get("message")?,
                metadata,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(events)
    }
}

fn parse_run_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Run> {
    let status_raw: String = row.try_get("status")?;
    let status = RunStatus::parse(&status_raw).ok_or_else(|| StoreError::Corrupt {
        table: "runs",
        detail: format!("unknown status {status_raw}"),
    })?;

    let engine_attempts: Vec<EngineAttempt> =
        serde_json::from_str(row.try_get::<String, _>("engine_attempts")?.as_str())?;
    let stats: serde_json::Value =
        serde_json::from_str(row.try_get::<String, _>("stats")?.as_str())?;

    Ok(Run {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        status,
        attempt: row.try_get::<i64, _>("attempt")? as u32,
        max_attempts: row.try_get::<i64, _>("max_attempts")? as u32,
        requested_strategy: EngineMode::parse(
            row.try_get::<String, _>("requested_strategy")?.as_str(),
        ),
        resolved_strategy: row
            .try_get::<Option<String>, _>("resolved_strategy")?
            .as_deref()
            .and_then(EngineTier::parse),
        failure_code: row
            .try_get::<Option<String>, _>("failure_code")?
            .as_deref()
            .and_then(FailureCode::parse),
        stats,
        engine_attempts,
        scheduled_at: row.try_get("scheduled_at")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}
