//! Per-domain learned intelligence.
//!
//! Counters per (domain, engine), block rates over a rolling attempt
//! window, and a derived access classification that the planner and the
//! executor consult before spending anything on a fetch. Only the run
//! executor writes outcomes; everything else reads.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::run::EngineTier;
use crate::store::{DomainAttempt, EngineStatsRow, Store, StoreResult};

/// Attempts required before any biasing decision is trusted.
pub const MIN_SAMPLE: u32 = 5;

/// Block rates are computed over this many most-recent attempts (or all
/// of them when fewer exist).
const RATE_WINDOW: usize = 20;

/// Attempts a domain must hold the human class for before a session
/// becomes required rather than preferred.
const REQUIRED_SESSION_ATTEMPTS: usize = 10;

/// Cached snapshots kept per process.
const CACHE_ENTRIES: usize = 512;

/// Learned access class for a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessClass {
    /// Open to plain HTTP fetching
    #[default]
    Public,
    /// Needs provider-grade fetching infrastructure
    Infra,
    /// Needs a human-captured session
    Human,
}

impl AccessClass {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Infra => "infra",
            Self::Human => "human",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "infra" => Self::Infra,
            "human" => Self::Human,
            _ => Self::Public,
        }
    }
}

/// Whether runs against a domain need a pooled session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRequirement {
    #[default]
    No,
    Preferred,
    Required,
}

impl SessionRequirement {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::No => "no",
            Self::Preferred => "preferred",
            Self::Required => "required",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "preferred" => Self::Preferred,
            "required" => Self::Required,
            _ => Self::No,
        }
    }
}

/// Everything the planner and executor want to know about a domain.
#[derive(Debug, Clone, Default)]
pub struct DomainSnapshot {
    pub domain: String,
    pub per_engine: HashMap<EngineTier, EngineStatsRow>,
    pub access_class: AccessClass,
    pub requires_session: SessionRequirement,
    pub provider_preferred: bool,
    /// Share of recent attempts answered 401/403
    pub block_rate_403: f64,
    /// Share of recent attempts answered 429
    pub block_rate_429: f64,
    /// Share of recent attempts that hit a captcha
    pub captcha_rate: f64,
    /// Attempts in the rate window
    pub window_len: usize,
}

impl DomainSnapshot {
    #[must_use]
    pub fn engine(&self, tier: EngineTier) -> Option<&EngineStatsRow> {
        self.per_engine.get(&tier)
    }

    /// Whether a tier has enough history to bias decisions.
    #[must_use]
    pub fn has_sample(&self, tier: EngineTier) -> bool {
        self.engine(tier).is_some_and(|s| s.attempts >= MIN_SAMPLE)
    }
}

/// Store-backed intelligence with an LRU read cache. Writes invalidate.
pub struct DomainIntel {
    store: Store,
    cache: Arc<RwLock<LruCache<String, DomainSnapshot>>>,
}

impl DomainIntel {
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self {
            store,
            cache: Arc::new(RwLock::new(LruCache::new(
                NonZeroUsize::new(CACHE_ENTRIES).expect("nonzero cache size"),
            ))),
        }
    }

    /// Snapshot of a domain's metrics and classification.
    pub async fn lookup(&self, domain: &str) -> StoreResult<DomainSnapshot> {
        {
            let mut cache = self.cache.write().await;
            if let Some(snapshot) = cache.get(domain) {
                return Ok(snapshot.clone());
            }
        }

        let snapshot = self.load_snapshot(domain).await?;

        let mut cache = self.cache.write().await;
        cache.put(domain.to_string(), snapshot.clone());
        Ok(snapshot)
    }

    /// Record an attempt outcome and rederive the domain classification.
    /// All writes are transactional; the snapshot cache is invalidated.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_outcome(
        &self,
        domain: &str,
        engine: EngineTier,
        success: bool,
        records_extracted: u64,
        escalations: u32,
        had_captcha: bool,
        response_code: Option<u16>,
    ) -> StoreResult<()> {
        self.store
            .record_domain_outcome(
                domain,
                engine,
                success,
                records_extracted,
                escalations,
                had_captcha,
                response_code,
            )
            .await?;

        self.reclassify(domain).await?;

        self.cache.write().await.pop(domain);
        Ok(())
    }

    /// Rederive and persist a domain's classification from stored
    /// counters. Pure derivation: same counters, same class.
    pub async fn reclassify(&self, domain: &str) -> StoreResult<()> {
        let window = self
            .store
            .recent_domain_attempts(domain, RATE_WINDOW as u32)
            .await?;
        let provider_stats = self.store.engine_stats(domain, EngineTier::Provider).await?;

        let derived = derive_classification(&window, provider_stats.as_ref());

        self.store
            .upsert_domain_config(
                domain,
                derived.access_class.as_str(),
                derived.requires_session.as_str(),
                derived.provider_preferred,
            )
            .await?;

        debug!(
            domain,
            class = derived.access_class.as_str(),
            requires_session = derived.requires_session.as_str(),
            "domain reclassified"
        );
        Ok(())
    }

    async fn load_snapshot(&self, domain: &str) -> StoreResult<DomainSnapshot> {
        let per_engine: HashMap<EngineTier, EngineStatsRow> = self
            .store
            .all_engine_stats(domain)
            .await?
            .into_iter()
            .collect();

        let window = self
            .store
            .recent_domain_attempts(domain, RATE_WINDOW as u32)
            .await?;
        let rates = WindowRates::from_window(&window);

        let config = self.store.fetch_domain_config(domain).await?;
        let (access_class, requires_session, provider_preferred) = match config {
            Some(row) => (
                AccessClass::parse(&row.access_class),
                SessionRequirement::parse(&row.requires_session),
                row.provider_preferred,
            ),
            None => (AccessClass::Public, SessionRequirement::No, false),
        };

        Ok(DomainSnapshot {
            domain: domain.to_string(),
            per_engine,
            access_class,
            requires_session,
            provider_preferred,
            block_rate_403: rates.rate_403,
            block_rate_429: rates.rate_429,
            captcha_rate: rates.captcha,
            window_len: window.len(),
        })
    }
}

#[derive(Debug, Default)]
struct WindowRates {
    rate_403: f64,
    rate_429: f64,
    captcha: f64,
}

impl WindowRates {
    fn from_window(window: &[DomainAttempt]) -> Self {
        if window.is_empty() {
            return Self::default();
        }
        let len = window.len() as f64;
        let denied = window
            .iter()
            .filter(|a| matches!(a.response_code, Some(401 | 403)))
            .count() as f64;
        let throttled = window
            .iter()
            .filter(|a| a.response_code == Some(429))
            .count() as f64;
        let captcha = window.iter().filter(|a| a.had_captcha).count() as f64;

        Self {
            rate_403: denied / len,
            rate_429: throttled / len,
            captcha: captcha / len,
        }
    }
}

#[derive(Debug)]
struct DerivedClass {
    access_class: AccessClass,
    requires_session: SessionRequirement,
    provider_preferred: bool,
}

/// Pure classification from the attempt window and provider history:
/// - `human` when 401/403 dominates (≥ 0.8) with enough samples
/// - `infra` when denials are common but captchas are not and the
///   provider historically gets through
/// - `public` otherwise
///
/// A session becomes required once the human class is stable across
/// enough attempts; before that it is merely preferred.
fn derive_classification(
    window: &[DomainAttempt],
    provider_stats: Option<&EngineStatsRow>,
) -> DerivedClass {
    let rates = WindowRates::from_window(window);
    let samples = window.len() as u32;

    let provider_succeeds = provider_stats
        .is_some_and(|s| s.attempts >= MIN_SAMPLE && s.success_rate() > 0.5);

    let access_class = if samples >= MIN_SAMPLE && rates.rate_403 >= 0.8 {
        AccessClass::Human
    } else if samples >= MIN_SAMPLE
        && rates.rate_403 >= 0.5
        && rates.captcha < 0.2
        && provider_succeeds
    {
        AccessClass::Infra
    } else {
        AccessClass::Public
    };

    let requires_session = match access_class {
        AccessClass::Human if window.len() >= REQUIRED_SESSION_ATTEMPTS => {
            SessionRequirement::Required
        }
        AccessClass::Human => SessionRequirement::Preferred,
        _ => SessionRequirement::No,
    };

    DerivedClass {
        access_class,
        requires_session,
        provider_preferred: access_class == AccessClass::Infra,
    }
}
