//! Read accessors for `OrchestratorConfig`

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::job::EngineMode;

use super::types::{InterventionTtls, OrchestratorConfig};

impl OrchestratorConfig {
    #[must_use]
    pub fn builder() -> super::builder::OrchestratorConfigBuilder {
        super::builder::OrchestratorConfigBuilder::new()
    }

    #[must_use]
    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    #[must_use]
    pub fn vault_dir(&self) -> &Path {
        &self.vault_dir
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    #[must_use]
    pub fn browser_nav_timeout(&self) -> Duration {
        Duration::from_millis(self.browser_nav_timeout_ms)
    }

    #[must_use]
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    #[must_use]
    pub fn provider_api_keys(&self) -> &[String] {
        &self.provider_api_keys
    }

    /// Whether the provider tier is usable at all.
    #[must_use]
    pub fn provider_enabled(&self) -> bool {
        !self.provider_api_keys.is_empty()
    }

    #[must_use]
    pub fn provider_endpoint(&self) -> &str {
        &self.provider_endpoint
    }

    #[must_use]
    pub fn default_strategies(&self) -> &HashMap<String, EngineMode> {
        &self.default_strategy
    }

    /// Domain-level strategy override, if one is configured.
    #[must_use]
    pub fn strategy_override(&self, domain: &str) -> Option<EngineMode> {
        self.default_strategy.get(domain).copied()
    }

    #[must_use]
    pub fn session_trust_floor(&self) -> f64 {
        self.session_trust_floor
    }

    #[must_use]
    pub fn session_max_uses(&self) -> u32 {
        self.session_max_uses
    }

    #[must_use]
    pub fn session_max_age_secs(&self) -> i64 {
        self.session_max_age_secs
    }

    #[must_use]
    pub fn intervention_ttls(&self) -> &InterventionTtls {
        &self.intervention_ttls
    }

    #[must_use]
    pub fn proxy_identity(&self) -> &str {
        &self.proxy_identity
    }

    #[must_use]
    pub fn politeness_rate_rps(&self) -> f64 {
        self.politeness_rate_rps
    }

    #[must_use]
    pub fn headless(&self) -> bool {
        self.headless
    }

    #[must_use]
    pub fn consent_selectors(&self) -> &[String] {
        &self.consent_selectors
    }

    #[must_use]
    pub fn worker_concurrency(&self) -> usize {
        self.worker_concurrency
    }
}
