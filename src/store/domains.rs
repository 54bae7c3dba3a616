//! Domain statistics, the attempt window, and learned domain config.

use sqlx::Row;

use crate::run::EngineTier;
use crate::utils::now_unix;

use super::{Store, StoreResult};

/// Attempts kept per domain in the rolling window. Block rates are
/// computed over the most recent slice of this.
const ATTEMPT_WINDOW_KEEP: i64 = 50;

/// Cumulative counters for one (domain, engine) pair.
#[derive(Debug, Clone, Default)]
pub struct EngineStatsRow {
    pub attempts: u32,
    pub successes: u32,
    pub records_extracted: u64,
    pub total_escalations: u32,
    pub captcha_hits: u32,
    pub first_seen: i64,
    pub last_updated: i64,
}

impl EngineStatsRow {
    /// Simple cumulative success rate; no moving average.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        f64::from(self.successes) / f64::from(self.attempts)
    }

    #[must_use]
    pub fn avg_escalations(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        f64::from(self.total_escalations) / f64::from(self.attempts)
    }

    /// Average abstract cost per extracted record on this tier.
    /// Infinite when attempts produced no records at all.
    #[must_use]
    pub fn avg_cost_per_record(&self, tier: EngineTier) -> f64 {
        let spent = f64::from(self.attempts) * f64::from(tier.unit_cost());
        if self.records_extracted == 0 {
            return if spent == 0.0 { 0.0 } else { f64::INFINITY };
        }
        spent / self.records_extracted as f64
    }
}

/// One row of the rolling attempt window.
#[derive(Debug, Clone)]
pub struct DomainAttempt {
    pub engine: Option<EngineTier>,
    pub success: bool,
    pub response_code: Option<u16>,
    pub had_captcha: bool,
}

/// Learned classification row for a domain.
#[derive(Debug, Clone)]
pub struct DomainConfigRow {
    pub domain: String,
    pub access_class: String,
    pub requires_session: String,
    pub provider_preferred: bool,
    pub block_patterns: Option<serde_json::Value>,
    pub updated_at: i64,
}

impl Store {
    /// Record one attempt outcome: bump the cumulative counters and push
    /// the attempt into the rolling window, pruning old rows past the
    /// keep horizon. One statement per table, single transaction.
    pub async fn record_domain_outcome(
        &self,
        domain: &str,
        engine: EngineTier,
        success: bool,
        records_extracted: u64,
        escalations: u32,
        had_captcha: bool,
        response_code: Option<u16>,
    ) -> StoreResult<()> {
        let now = now_unix();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO domain_stats
                (domain, engine, attempts, successes, records_extracted,
                 total_escalations, captcha_hits, first_seen, last_updated)
            VALUES (?, ?, 1, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(domain, engine) DO UPDATE SET
                attempts = attempts + 1,
                successes = successes + excluded.successes,
                records_extracted = records_extracted + excluded.records_extracted,
                total_escalations = total_escalations + excluded.total_escalations,
                captcha_hits = captcha_hits + excluded.captcha_hits,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(domain)
        .bind(engine.as_str())
        .bind(success as i64)
        .bind(records_extracted as i64)
        .bind(escalations as i64)
        .bind(had_captcha as i64)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO domain_attempts (domain, engine, success, response_code, had_captcha, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(domain)
        .bind(engine.as_str())
        .bind(success as i64)
        .bind(response_code.map(i64::from))
        .bind(had_captcha as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM domain_attempts
            WHERE domain = ? AND id NOT IN (
                SELECT id FROM domain_attempts WHERE domain = ? ORDER BY id DESC LIMIT ?
            )
            "#,
        )
        .bind(domain)
        .bind(domain)
        .bind(ATTEMPT_WINDOW_KEEP)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn engine_stats(
        &self,
        domain: &str,
        engine: EngineTier,
    ) -> StoreResult<Option<EngineStatsRow>> {
        let row = sqlx::query(
            r#"
            SELECT attempts, successes, records_extracted, total_escalations,
                   captcha_hits, first_seen, last_updated
            FROM domain_stats WHERE domain = ? AND engine = ?
            "#,
        )
        .bind(domain)
        .bind(engine.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| parse_stats_row(&row)).transpose()
    }

    /// All per-engine counters for a domain.
    pub async fn all_engine_stats(
        &self,
        domain: &str,
    ) -> StoreResult<Vec<(EngineTier, EngineStatsRow)>> {
        let rows = sqlx::query(
            r#"
            SELECT engine, attempts, successes, records_extracted, total_escalations,
                   captcha_hits, first_seen, last_updated
            FROM domain_stats WHERE domain = ?
            "#,
        )
        .bind(domain)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(engine) = EngineTier::parse(row.try_get::<String, _>("engine")?.as_str())
            else {
                continue;
            };
            out.push((engine, parse_stats_row(&row)?));
        }
        Ok(out)
    }

    /// Most recent attempts for a domain, newest first.
    pub async fn recent_domain_attempts(
        &self,
        domain: &str,
        limit: u32,
    ) -> StoreResult<Vec<DomainAttempt>> {
        let rows = sqlx::query(
            r#"
            SELECT engine, success, response_code, had_captcha
            FROM domain_attempts WHERE domain = ? ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(domain)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(DomainAttempt {
                engine: EngineTier::parse(row.try_get::<String, _>("engine")?.as_str()),
                success: row.try_get::<i64, _>("success")? != 0,
                response_code: row
                    .try_get::<Option<i64>, _>("response_code")?
                    .map(|c| c as u16),
                had_captcha: row.try_get::<i64, _>("had_captcha")? != 0,
            });
        }
        Ok(out)
    }

    pub async fn fetch_domain_config(&self, domain: &str) -> StoreResult<Option<DomainConfigRow>> {
        let row = sqlx::query(
            r#"
            SELECT domain, access_class, requires_session, provider_preferred,
                   block_patterns, updated_at
            FROM domain_config WHERE domain = ?
            "#,
        )
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let block_patterns = row
            .try_get::<Option<String>, _>("block_patterns")?
            .map(|s| serde_json::from_str(&s))
            .transpose()?;

        Ok(Some(DomainConfigRow {
            domain: row.try_get("domain")?,
            access_class: row.try_get("access_class")?,
            requires_session: row.try_get("requires_session")?,
            provider_preferred: row.try_get::<i64, _>("provider_preferred")? != 0,
            block_patterns,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    pub async fn upsert_domain_config(
        &self,
        domain: &str,
        access_class: &str,
        requires_session: &str,
        provider_preferred: bool,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO domain_config
                (domain, access_class, requires_session, provider_preferred, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(domain) DO UPDATE SET
                access_class = excluded.access_class,
                requires_session = excluded.requires_session,
                provider_preferred = excluded.provider_preferred,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(domain)
        .bind(access_class)
        .bind(requires_session)
        .bind(provider_preferred as i64)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn parse_stats_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<EngineStatsRow> {
    Ok(EngineStatsRow {
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        successes: row.try_get::<i64, _>("successes")? as u32,
        records_extracted: row.try_get::<i64, _>("records_extracted")? as u64,
        total_escalations: row.try_get::<i64, _>("total_escalations")? as u32,
        captcha_hits: row.try_get::<i64, _>("captcha_hits")? as u32,
        first_seen: row.try_get("first_seen")?,
        last_updated: row.try_get("last_updated")?,
    })
}
