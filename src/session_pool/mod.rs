//! Trust-scored browser session pool.
//!
//! Sessions are reusable assets keyed by (domain, proxy-identity). The
//! pool keeps live entries in memory behind one async lock (acquire calls
//! on the same key serialize through it, and a second concurrent
//! requester gets `None` rather than a duplicate handle), persists every
//! state change to the vault, and retires deterministically: trust under
//! the floor, three consecutive failures, the use cap, or the age cap.

pub mod trust;
pub mod vault;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::utils::now_unix;

pub use trust::{compute as compute_trust, TrustInputs};
pub use vault::{SessionHealth, SessionRecord, SessionVault};

/// Typed error at the pool seam.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("vault i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type PoolResult<T> = Result<T, PoolError>;

/// Pool key: sessions never cross domains or proxy identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub domain: String,
    pub proxy_identity: String,
}

impl SessionKey {
    #[must_use]
    pub fn new(domain: impl Into<String>, proxy_identity: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            proxy_identity: proxy_identity.into(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.domain, self.proxy_identity)
    }
}

#[derive(Debug)]
struct PoolEntry {
    record: SessionRecord,
    in_use: bool,
}

/// Aggregated pool counters for observability.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub live: usize,
    pub in_use: usize,
    pub avg_trust: f64,
    pub retired_total: u64,
}

/// Retirement knobs, sourced from config.
#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    pub trust_floor: f64,
    pub max_uses: u32,
    pub max_age_secs: i64,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            trust_floor: crate::utils::constants::DEFAULT_SESSION_TRUST_FLOOR,
            max_uses: crate::utils::constants::DEFAULT_SESSION_MAX_USES,
            max_age_secs: crate::utils::constants::DEFAULT_SESSION_MAX_AGE_SECS,
        }
    }
}

/// Consecutive failures that force retirement.
const FAILURE_STREAK_LIMIT: u32 = 3;

/// In-memory session pool backed by the vault.
pub struct SessionPool {
    limits: PoolLimits,
    vault: SessionVault,
    entries: Mutex<HashMap<SessionKey, PoolEntry>>,
    retired_total: AtomicU64,
}

impl SessionPool {
    /// Open the vault, load every persisted session, and drop the ones
    /// the retirement rules already condemn.
    pub async fn open(vault_dir: &std::path::Path, limits: PoolLimits) -> PoolResult<Self> {
        let vault = SessionVault::open(vault_dir).await?;
        let pool = Self {
            limits,
            vault,
            entries: Mutex::new(HashMap::new()),
            retired_total: AtomicU64::new(0),
        };

        let now = now_unix();
        let mut live = 0usize;
        let mut dropped = 0usize;
        {
            let mut entries = pool.entries.lock().await;
            for record in pool.vault.load_all().await? {
                let key = record.key();
                if let Some(reason) = pool.retirement_reason(&record, now) {
                    debug!(key = %key, reason, "dropping vaulted session at boot");
                    pool.vault.delete(&key).await?;
                    dropped += 1;
                    continue;
                }
                entries.insert(
                    key,
                    PoolEntry {
                        record,
                        in_use: false,
                    },
                );
                live += 1;
            }
        }
        pool.retired_total.store(dropped as u64, Ordering::Relaxed);

        info!(live, dropped, "session pool loaded");
        Ok(pool)
    }

    /// Trust score of a record right now.
    #[must_use]
    pub fn trust_of(&self, record: &SessionRecord, now: i64) -> f64 {
        trust::compute(&TrustInputs {
            age_secs: now - record.created_at,
            consecutive_failures: record.consecutive_failures,
            secs_since_success: record.last_success_at.map(|t| now - t),
            total_uses: record.total_uses,
        })
    }

    /// Why a record must be retired right now, if any reason holds.
    #[must_use]
    pub fn retirement_reason(&self, record: &SessionRecord, now: i64) -> Option<&'static str> {
        if record.consecutive_failures >= FAILURE_STREAK_LIMIT {
            return Some("failure streak");
        }
        if record.total_uses >= self.limits.max_uses {
            return Some("use cap");
        }
        if now - record.created_at >= self.limits.max_age_secs {
            return Some("age cap");
        }
        if self.trust_of(record, now) < self.limits.trust_floor {
            return Some("trust below floor");
        }
        None
    }

    /// Hand out the session for a key if it is healthy and not already
    /// held. An unhealthy session is retired on the spot; a held session
    /// yields `None` for the second requester.
    pub async fn acquire(&self, domain: &str, proxy_identity: &str) -> PoolResult<Option<SessionRecord>> {
        let key = SessionKey::new(domain, proxy_identity);
        let now = now_unix();
        let mut entries = self.entries.lock().await;

        let Some(entry) = entries.get_mut(&key) else {
            return Ok(None);
        };

        if entry.in_use {
            debug!(key = %key, "session already held; refusing duplicate acquire");
            return Ok(None);
        }

        if let Some(reason) = self.retirement_reason(&entry.record, now) {
            info!(key = %key, reason, "retiring session on acquire");
            entries.remove(&key);
            drop(entries);
            self.vault.delete(&key).await?;
            self.retired_total.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        entry.in_use = true;
        entry.record.last_used = now;
        Ok(Some(entry.record.clone()))
    }

    /// Register a freshly captured session (after a successful first
    /// extraction) and persist it.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        domain: &str,
        proxy_identity: &str,
        cookies: Vec<serde_json::Value>,
        storage_state: serde_json::Value,
        user_agent: String,
        viewport: (u32, u32),
    ) -> PoolResult<SessionRecord> {
        let now = now_unix();
        let record = SessionRecord {
            domain: domain.to_string(),
            proxy_identity: proxy_identity.to_string(),
            cookies,
            storage_state,
            user_agent,
            viewport,
            created_at: now,
            last_used: now,
            last_success_at: Some(now),
            total_uses: 1,
            consecutive_failures: 0,
            captcha_count: 0,
            health: SessionHealth::Valid,
            expires_at: None,
        };

        self.vault.save(&record).await?;
        let key = record.key();
        self.entries.lock().await.insert(
            key.clone(),
            PoolEntry {
                record: record.clone(),
                in_use: false,
            },
        );

        info!(key = %key, "session captured into pool");
        Ok(record)
    }

    /// Report a successful use: streak resets, counters bump, vault
    /// updates. A session that crosses a hard cap here is retired
    /// immediately so the pool never holds a condemned entry.
    pub async fn mark_success(&self, key: &SessionKey, had_captcha: bool) -> PoolResult<()> {
        let now = now_unix();
        let mut entries = self.entries.lock().await;

        let Some(entry) = entries.get_mut(key) else {
            return Ok(());
        };

        entry.in_use = false;
        entry.record.consecutive_failures = 0;
        entry.record.total_uses += 1;
        if had_captcha {
            entry.record.captcha_count += 1;
        }
        entry.record.last_used = now;
        entry.record.last_success_at = Some(now);
        entry.record.health = SessionHealth::Valid;

        if entry.record.total_uses >= self.limits.max_uses
            || now - entry.record.created_at >= self.limits.max_age_secs
        {
            let record = entries.remove(key).map(|e| e.record);
            drop(entries);
            if record.is_some() {
                info!(key = %key, "retiring session at hard cap after success");
                self.vault.delete(key).await?;
                self.retired_total.fetch_add(1, Ordering::Relaxed);
            }
            return Ok(());
        }

        let record = entry.record.clone();
        drop(entries);
        self.vault.save(&record).await
    }

    /// Report a failed use: streak bumps; three in a row retires.
    pub async fn mark_failure(&self, key: &SessionKey) -> PoolResult<()> {
        let now = now_unix();
        let mut entries = self.entries.lock().await;

        let Some(entry) = entries.get_mut(key) else {
            return Ok(());
        };

        entry.in_use = false;
        entry.record.consecutive_failures += 1;
        entry.record.last_used = now;
        entry.record.health = SessionHealth::Invalid;

        if entry.record.consecutive_failures >= FAILURE_STREAK_LIMIT {
            entries.remove(key);
            drop(entries);
            warn!(key = %key, "retiring session after failure streak");
            self.vault.delete(key).await?;
            self.retired_total.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let record = entry.record.clone();
        drop(entries);
        self.vault.save(&record).await
    }

    /// Remove a session from the pool and from disk.
    pub async fn retire(&self, key: &SessionKey) -> PoolResult<()> {
        let removed = self.entries.lock().await.remove(key).is_some();
        self.vault.delete(key).await?;
        if removed {
            self.retired_total.fetch_add(1, Ordering::Relaxed);
            info!(key = %key, "session retired");
        }
        Ok(())
    }

    /// Whether a healthy session exists for the key (without acquiring).
    pub async fn has_healthy_session(&self, domain: &str, proxy_identity: &str) -> bool {
        let key = SessionKey::new(domain, proxy_identity);
        let now = now_unix();
        let entries = self.entries.lock().await;
        entries
            .get(&key)
            .is_some_and(|e| self.retirement_reason(&e.record, now).is_none())
    }

    /// Aggregated counters for observability.
    pub async fn stats(&self) -> PoolStats {
        let now = now_unix();
        let entries = self.entries.lock().await;
        let live = entries.len();
        let in_use = entries.values().filter(|e| e.in_use).count();
        let avg_trust = if live == 0 {
            0.0
        } else {
            entries
                .values()
                .map(|e| self.trust_of(&e.record, now))
                .sum::<f64>()
                / live as f64
        };

        PoolStats {
            live,
            in_use,
            avg_trust,
            retired_total: self.retired_total.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pool_in(dir: &std::path::Path) -> SessionPool {
        SessionPool::open(dir, PoolLimits::default())
            .await
            .expect("open pool")
    }

    async fn seed(pool: &SessionPool, domain: &str) -> SessionRecord {
        pool.create(
            domain,
            "default",
            vec![serde_json::json!({"name": "sid", "value": "1"})],
            serde_json::json!({}),
            "ua".to_string(),
            (1920, 1080),
        )
        .await
        .expect("create session")
    }

    #[tokio::test]
    async fn acquire_returns_created_session_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = pool_in(dir.path()).await;
        seed(&pool, "ex.com").await;

        let first = pool.acquire("ex.com", "default").await.expect("acquire");
        assert!(first.is_some());

        // Held session is not handed out twice
        let second = pool.acquire("ex.com", "default").await.expect("acquire");
        assert!(second.is_none());

        let key = SessionKey::new("ex.com", "default");
        pool.mark_success(&key, false).await.expect("mark success");

        let third = pool.acquire("ex.com", "default").await.expect("acquire");
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn three_failures_retire_the_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = pool_in(dir.path()).await;
        seed(&pool, "ex.com").await;
        let key = SessionKey::new("ex.com", "default");

        for _ in 0..3 {
            let acquired = pool.acquire("ex.com", "default").await.expect("acquire");
            if acquired.is_some() {
                pool.mark_failure(&key).await.expect("mark failure");
            } else {
                // Already retired mid-loop
                break;
            }
        }

        assert!(pool.acquire("ex.com", "default").await.expect("acquire").is_none());
        assert!(pool.stats().await.retired_total >= 1);
    }

    #[tokio::test]
    async fn use_cap_retires_at_exactly_two_hundred() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = pool_in(dir.path()).await;
        let mut rec = seed(&pool, "ex.com").await;
        let key = rec.key();

        // Fast-forward the counter to one shy of the cap
        {
            let mut entries = pool.entries.lock().await;
            let entry = entries.get_mut(&key).expect("entry");
            entry.record.total_uses = 199;
            rec = entry.record.clone();
        }
        assert!(pool.retirement_reason(&rec, now_unix()).is_none());

        let acquired = pool.acquire("ex.com", "default").await.expect("acquire");
        assert!(acquired.is_some(), "199 uses with recent success is reusable");

        pool.mark_success(&key, false).await.expect("mark success");

        // 200 uses: gone from pool and from disk
        assert!(pool.acquire("ex.com", "default").await.expect("acquire").is_none());
        let reloaded = pool_in(dir.path()).await;
        assert!(reloaded
            .acquire("ex.com", "default")
            .await
            .expect("acquire")
            .is_none());
    }

    #[tokio::test]
    async fn boot_drops_condemned_sessions() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let pool = pool_in(dir.path()).await;
            let key = seed(&pool, "stale.com").await.key();
            let mut entries = pool.entries.lock().await;
            let entry = entries.get_mut(&key).expect("entry");
            entry.record.created_at = now_unix() - 3 * 3600;
            let record = entry.record.clone();
            drop(entries);
            pool.vault.save(&record).await.expect("save stale");
        }

        let pool = pool_in(dir.path()).await;
        assert_eq!(pool.stats().await.live, 0);
    }

    #[tokio::test]
    async fn sessions_survive_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let pool = pool_in(dir.path()).await;
            seed(&pool, "keep.com").await;
        }

        let pool = pool_in(dir.path()).await;
        let acquired = pool.acquire("keep.com", "default").await.expect("acquire");
        assert!(acquired.is_some());
        assert_eq!(acquired.expect("record").domain, "keep.com");
    }
}
