//! Core configuration types for the orchestrator
//!
//! This module contains the main `OrchestratorConfig` struct. Fields are
//! private; construction goes through the builder, reads through getters.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::job::EngineMode;
use crate::utils::constants::{
    DEFAULT_BROWSER_NAV_TIMEOUT_MS, DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_POLITENESS_RATE_RPS, DEFAULT_PROVIDER_TIMEOUT_SECS, DEFAULT_PROXY_IDENTITY,
    DEFAULT_SESSION_MAX_AGE_SECS, DEFAULT_SESSION_MAX_USES, DEFAULT_SESSION_TRUST_FLOOR,
};

/// Per-type TTLs for intervention tasks, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionTtls {
    /// login-refresh: 24 h
    pub login_refresh_secs: i64,
    /// selector-fix: 72 h
    pub selector_fix_secs: i64,
    /// field-confirm: 7 d
    pub field_confirm_secs: i64,
    /// manual-access: 14 d
    pub manual_access_secs: i64,
    /// captcha-solve shares the login-refresh horizon unless overridden
    pub captcha_solve_secs: i64,
}

impl Default for InterventionTtls {
    fn default() -> Self {
        Self {
            login_refresh_secs: 24 * 3600,
            selector_fix_secs: 72 * 3600,
            field_confirm_secs: 7 * 24 * 3600,
            manual_access_secs: 14 * 24 * 3600,
            captcha_solve_secs: 24 * 3600,
        }
    }
}

/// Main configuration for the orchestrator.
///
/// **INVARIANT:** `store_path` and `vault_dir` are absolute paths
/// (normalized in the builder) so the store and the session vault resolve
/// identically from every worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// SQLite database location
    pub(crate) store_path: PathBuf,
    /// Session vault directory (one JSON file per session)
    pub(crate) vault_dir: PathBuf,

    /// Cap on engine attempts within a single run
    pub(crate) max_attempts: u32,
    /// T1 fetch timeout
    pub(crate) http_timeout_secs: u64,
    /// T2 navigation timeout
    pub(crate) browser_nav_timeout_ms: u64,
    /// T3 request timeout
    pub(crate) provider_timeout_secs: u64,

    /// Provider API keys; empty disables the provider tier
    pub(crate) provider_api_keys: Vec<String>,
    /// Provider endpoint (swap for staging or a different vendor)
    pub(crate) provider_endpoint: String,

    /// Domain-level engine-mode overrides (domain → strategy)
    pub(crate) default_strategy: HashMap<String, EngineMode>,

    /// Minimum computed trust to hand a session back out
    pub(crate) session_trust_floor: f64,
    /// Hard retirement cap on total uses
    pub(crate) session_max_uses: u32,
    /// Hard retirement cap on age, seconds
    pub(crate) session_max_age_secs: i64,

    pub(crate) intervention_ttls: InterventionTtls,

    /// Opaque proxy identity used to key sessions
    pub(crate) proxy_identity: String,

    /// Per-domain politeness rate for T1 fetches, requests per second.
    /// Zero or negative disables the limiter.
    pub(crate) politeness_rate_rps: f64,

    /// Run browsers headless
    pub(crate) headless: bool,

    /// Consent/cookie-banner selectors clicked best-effort after navigation
    pub(crate) consent_selectors: Vec<String>,

    /// Number of concurrent run executors per worker process
    pub(crate) worker_concurrency: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("fieldhand.sqlite"),
            vault_dir: PathBuf::from(".fieldhand/sessions"),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            browser_nav_timeout_ms: DEFAULT_BROWSER_NAV_TIMEOUT_MS,
            provider_timeout_secs: DEFAULT_PROVIDER_TIMEOUT_SECS,
            provider_api_keys: Vec::new(),
            provider_endpoint: "https://app.scrapingbee.com/api/v1/".to_string(),
            default_strategy: HashMap::new(),
            session_trust_floor: DEFAULT_SESSION_TRUST_FLOOR,
            session_max_uses: DEFAULT_SESSION_MAX_USES,
            session_max_age_secs: DEFAULT_SESSION_MAX_AGE_SECS,
            intervention_ttls: InterventionTtls::default(),
            proxy_identity: DEFAULT_PROXY_IDENTITY.to_string(),
            politeness_rate_rps: DEFAULT_POLITENESS_RATE_RPS,
            headless: true,
            consent_selectors: crate::utils::constants::DEFAULT_CONSENT_SELECTORS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            worker_concurrency: 4,
        }
    }
}
