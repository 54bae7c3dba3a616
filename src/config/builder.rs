//! Fluent builder for `OrchestratorConfig`

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::job::EngineMode;

use super::types::{InterventionTtls, OrchestratorConfig};

/// Builder for [`OrchestratorConfig`]; every setter has a sensible default.
#[derive(Debug, Default, Clone)]
pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
        }
    }

    #[must_use]
    pub fn store_path(mut self, path: impl AsRef<Path>) -> Self {
        self.config.store_path = normalize_path(path.as_ref());
        self
    }

    #[must_use]
    pub fn vault_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.config.vault_dir = normalize_path(path.as_ref());
        self
    }

    #[must_use]
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n.max(1);
        self
    }

    #[must_use]
    pub fn http_timeout_secs(mut self, secs: u64) -> Self {
        self.config.http_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn browser_nav_timeout_ms(mut self, ms: u64) -> Self {
        self.config.browser_nav_timeout_ms = ms;
        self
    }

    #[must_use]
    pub fn provider_timeout_secs(mut self, secs: u64) -> Self {
        self.config.provider_timeout_secs = secs;
        self
    }

    /// Accepts a single key or a comma-separated list, matching the
    /// `provider-api-key(s)` config surface.
    #[must_use]
    pub fn provider_api_keys(mut self, keys: &str) -> Self {
        self.config.provider_api_keys = keys
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(String::from)
            .collect();
        self
    }

    #[must_use]
    pub fn provider_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.provider_endpoint = endpoint.into();
        self
    }

    /// Domain-level strategy override: runs for `domain` start from
    /// `mode` regardless of the job's engine-mode.
    #[must_use]
    pub fn default_strategy(mut self, domain: impl Into<String>, mode: EngineMode) -> Self {
        self.config.default_strategy.insert(domain.into(), mode);
        self
    }

    #[must_use]
    pub fn default_strategies(mut self, map: HashMap<String, EngineMode>) -> Self {
        self.config.default_strategy = map;
        self
    }

    #[must_use]
    pub fn session_trust_floor(mut self, floor: f64) -> Self {
        self.config.session_trust_floor = floor.clamp(0.0, 100.0);
        self
    }

    #[must_use]
    pub fn session_max_uses(mut self, uses: u32) -> Self {
        self.config.session_max_uses = uses;
        self
    }

    #[must_use]
    pub fn session_max_age_secs(mut self, secs: i64) -> Self {
        self.config.session_max_age_secs = secs;
        self
    }

    #[must_use]
    pub fn intervention_ttls(mut self, ttls: InterventionTtls) -> Self {
        self.config.intervention_ttls = ttls;
        self
    }

    #[must_use]
    pub fn proxy_identity(mut self, identity: impl Into<String>) -> Self {
        self.config.proxy_identity = identity.into();
        self
    }

    #[must_use]
    pub fn politeness_rate_rps(mut self, rps: f64) -> Self {
        self.config.politeness_rate_rps = rps;
        self
    }

    #[must_use]
    pub fn headless(mut self, headless: bool) -> Self {
        self.config.headless = headless;
        self
    }

    #[must_use]
    pub fn consent_selectors(mut self, selectors: Vec<String>) -> Self {
        self.config.consent_selectors = selectors;
        self
    }

    #[must_use]
    pub fn worker_concurrency(mut self, n: usize) -> Self {
        self.config.worker_concurrency = n.max(1);
        self
    }

    #[must_use]
    pub fn build(self) -> OrchestratorConfig {
        self.config
    }
}

/// Make a path absolute against the current working directory.
fn normalize_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comma_separated_keys_are_split() {
        let config = OrchestratorConfigBuilder::new()
            .provider_api_keys("key-a, key-b,,key-c")
            .build();
        assert_eq!(config.provider_api_keys(), &["key-a", "key-b", "key-c"]);
    }

    #[test]
    fn paths_are_normalized_to_absolute() {
        let config = OrchestratorConfigBuilder::new()
            .store_path("relative/db.sqlite")
            .build();
        assert!(config.store_path().is_absolute());
    }

    #[test]
    fn max_attempts_never_zero() {
        let config = OrchestratorConfigBuilder::new().max_attempts(0).build();
        assert_eq!(config.max_attempts(), 1);
    }
}
