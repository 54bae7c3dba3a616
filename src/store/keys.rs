//! Provider API key credit accounting.
//!
//! Keys are seeded from config at startup; every provider call consumes
//! one credit, and a depleted key is deactivated rather than retried.

use crate::utils::now_unix;

use super::{Store, StoreResult};

/// Credits granted to a key seeded without an explicit balance.
const DEFAULT_SEED_CREDITS: i64 = 1_000;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKeyRow {
    pub key: String,
    pub provider: String,
    pub credits_remaining: i64,
    pub active: i64,
    pub last_used: Option<i64>,
}

impl Store {
    /// Register a key if unseen; existing balances are left alone.
    pub async fn seed_api_key(&self, key: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO api_keys (key, credits_remaining, active)
            VALUES (?, ?, 1)
            ON CONFLICT(key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(DEFAULT_SEED_CREDITS)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The active key with the most credits, if any remain.
    pub async fn next_active_api_key(&self) -> StoreResult<Option<ApiKeyRow>> {
        let row = sqlx::query_as::<_, ApiKeyRow>(
            r#"
            SELECT key, provider, credits_remaining, active, last_used
            FROM api_keys
            WHERE active = 1 AND credits_remaining > 0
            ORDER BY credits_remaining DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Charge one credit; deactivates the key when it hits zero.
    /// Returns the remaining balance.
    pub async fn consume_api_credit(&self, key: &str) -> StoreResult<i64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE api_keys
            SET credits_remaining = MAX(credits_remaining - 1, 0), last_used = ?
            WHERE key = ?
            "#,
        )
        .bind(now_unix())
        .bind(key)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE api_keys SET active = 0 WHERE key = ? AND credits_remaining <= 0")
            .bind(key)
            .execute(&mut *tx)
            .await?;

        let (remaining,): (i64,) =
            sqlx::query_as("SELECT credits_remaining FROM api_keys WHERE key = ?")
                .bind(key)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;
        Ok(remaining)
    }

    pub async fn deactivate_api_key(&self, key: &str) -> StoreResult<()> {
        sqlx::query("UPDATE api_keys SET active = 0 WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
