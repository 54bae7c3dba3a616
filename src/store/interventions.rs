//! Intervention task rows: creation, dedup lookups, lifecycle flips.

use sqlx::Row;

use crate::utils::now_unix;

use super::{Store, StoreResult};

/// One human-in-the-loop task as stored.
#[derive(Debug, Clone)]
pub struct InterventionTaskRow {
    pub id: String,
    pub job_id: String,
    pub run_id: Option<String>,
    pub domain: String,
    pub task_type: String,
    pub status: String,
    pub trigger_reason: String,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub expires_at: Option<i64>,
    pub resolution: Option<serde_json::Value>,
    pub resolved_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Store {
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_intervention_task(
        &self,
        id: &str,
        job_id: &str,
        run_id: Option<&str>,
        domain: &str,
        task_type: &str,
        trigger_reason: &str,
        payload: &serde_json::Value,
        priority: i64,
        expires_at: Option<i64>,
    ) -> StoreResult<()> {
        let now = now_unix();
        sqlx::query(
            r#"
            INSERT INTO intervention_tasks
                (id, job_id, run_id, domain, task_type, status, trigger_reason,
                 payload, priority, expires_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(job_id)
        .bind(run_id)
        .bind(domain)
        .bind(task_type)
        .bind(trigger_reason)
        .bind(serde_json::to_string(payload)?)
        .bind(priority)
        .bind(expires_at)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fetch_intervention_task(
        &self,
        id: &str,
    ) -> StoreResult<Option<InterventionTaskRow>> {
        let row = sqlx::query(
            r#"
            SELECT id, job_id, run_id, domain, task_type, status, trigger_reason,
                   payload, priority, expires_at, resolution, resolved_by,
                   created_at, updated_at
            FROM intervention_tasks WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| parse_task_row(&row)).transpose()
    }

    /// An existing pending task for the same run, regardless of type.
    /// Backs pause idempotency on run id.
    pub async fn pending_task_for_run(
        &self,
        run_id: &str,
    ) -> StoreResult<Option<InterventionTaskRow>> {
        let row = sqlx::query(
            r#"
            SELECT id, job_id, run_id, domain, task_type, status, trigger_reason,
                   payload, priority, expires_at, resolution, resolved_by,
                   created_at, updated_at
            FROM intervention_tasks
            WHERE run_id = ? AND status = 'pending'
            ORDER BY created_at LIMIT 1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| parse_task_row(&row)).transpose()
    }

    /// An existing pending task with the same dedup key
    /// (job, type, trigger-reason).
    pub async fn pending_duplicate_task(
        &self,
        job_id: &str,
        task_type: &str,
        trigger_reason: &str,
    ) -> StoreResult<Option<InterventionTaskRow>> {
        let row = sqlx::query(
            r#"
            SELECT id, job_id, run_id, domain, task_type, status, trigger_reason,
                   payload, priority, expires_at, resolution, resolved_by,
                   created_at, updated_at
            FROM intervention_tasks
            WHERE job_id = ? AND task_type = ? AND trigger_reason = ? AND status = 'pending'
            ORDER BY created_at LIMIT 1
            "#,
        )
        .bind(job_id)
        .bind(task_type)
        .bind(trigger_reason)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| parse_task_row(&row)).transpose()
    }

    pub async fn pending_task_count_for_job(&self, job_id: &str) -> StoreResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM intervention_tasks WHERE job_id = ? AND status = 'pending'",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn pending_task_count_for_domain(&self, domain: &str) -> StoreResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM intervention_tasks WHERE domain = ? AND status = 'pending'",
        )
        .bind(domain)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Replace a pending task's payload (used to append dedup evidence).
    pub async fn update_task_payload(
        &self,
        id: &str,
        payload: &serde_json::Value,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE intervention_tasks SET payload = ?, updated_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(serde_json::to_string(payload)?)
        .bind(now_unix())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// pending → resolved with resolution payload; CAS so a second
    /// resolve is a no-op.
    pub async fn resolve_task_row(
        &self,
        id: &str,
        resolution: &serde_json::Value,
        resolver: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE intervention_tasks
            SET status = 'resolved', resolution = ?, resolved_by = ?, updated_at = ?
            WHERE id = ? AND status IN ('pending', 'in_progress')
            "#,
        )
        .bind(serde_json::to_string(resolution)?)
        .bind(resolver)
        .bind(now_unix())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// pending | in_progress → cancelled.
    pub async fn cancel_task_row(&self, id: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE intervention_tasks SET status = 'cancelled', updated_at = ?
            WHERE id = ? AND status IN ('pending', 'in_progress')
            "#,
        )
        .bind(now_unix())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Flip every overdue pending task to expired and return what was
    /// flipped. The runs stay paused.
    pub async fn expire_overdue_tasks(&self, now: i64) -> StoreResult<Vec<InterventionTaskRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, run_id, domain, task_type, status, trigger_reason,
                   payload, priority, expires_at, resolution, resolved_by,
                   created_at, updated_at
            FROM intervention_tasks
            WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at <= ?
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut expired = Vec::with_capacity(rows.len());
        for row in rows {
            let task = parse_task_row(&row)?;
            let result = sqlx::query(
                "UPDATE intervention_tasks SET status = 'expired', updated_at = ? WHERE id = ? AND status = 'pending'",
            )
            .bind(now)
            .bind(&task.id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 1 {
                expired.push(task);
            }
        }
        Ok(expired)
    }
}

fn parse_task_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<InterventionTaskRow> {
    let payload: serde_json::Value =
        serde_json::from_str(row.try_get::<String, _>("payload")?.as_str())?;
    let resolution = row
        .try_get::<Option<String>, _>("resolution")?
        .map(|s| serde_json::from_str(&s))
        .transpose()?;

    Ok(InterventionTaskRow {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        run_id: row.try_get("run_id")?,
        domain: row.try_get("domain")?,
        task_type: row.try_get("task_type")?,
        status: row.try_get("status")?,
        trigger_reason: row.try_get("trigger_reason")?,
        payload,
        priority: row.try_get("priority")?,
        expires_at: row.try_get("expires_at")?,
        resolution,
        resolved_by: row.try_get("resolved_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
