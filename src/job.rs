//! Declarative job definitions consumed by the run executor.
//!
//! Jobs are read-only to the core: they arrive through the store and
//! describe what to extract, never how the engine tiers go about it.

use serde::{Deserialize, Serialize};

use crate::extract::schema::SelectorSpec;

/// A declarative scrape job: target, fields, and crawl shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Stable identifier, referenced by runs and intervention tasks
    pub id: String,
    /// Human-facing label
    #[serde(default)]
    pub name: String,
    /// Page (single mode) or listing page (list mode) to fetch
    pub target_url: String,
    /// Ordered field names; each must have a field-map entry
    pub fields: Vec<String>,
    /// Whether the target sits behind a login
    #[serde(default)]
    pub requires_auth: bool,
    #[serde(default)]
    pub crawl_mode: CrawlMode,
    /// Present when `crawl_mode` is `List`
    #[serde(default)]
    pub list_config: Option<ListConfig>,
    #[serde(default)]
    pub engine_mode: EngineMode,
    /// Overrides for the stable browser profile used by the browser tier
    #[serde(default)]
    pub browser_profile: Option<BrowserProfileConfig>,
}

/// Whether the job extracts one page or fans out over a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlMode {
    #[default]
    Single,
    List,
}

/// Requested engine strategy. `Auto` lets the planner bias from learned
/// domain statistics; an explicit tier pins the run to that tier with no
/// escalation beyond it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    #[default]
    Auto,
    Http,
    Browser,
    Provider,
}

impl EngineMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Http => "http",
            Self::Browser => "browser",
            Self::Provider => "provider",
        }
    }

    /// Parse the storage representation; unknown strings fall back to auto.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "http" => Self::Http,
            "browser" => Self::Browser,
            "provider" => Self::Provider,
            _ => Self::Auto,
        }
    }
}

/// List-mode crawl shape: where the item links live, how to page, and the
/// hard caps on fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListConfig {
    /// Selector yielding item page links (applied with all-matches on)
    pub item_links: SelectorSpec,
    /// Selector yielding the next-page link, if the listing paginates
    #[serde(default)]
    pub pagination: Option<SelectorSpec>,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_max_items")]
    pub max_items: u32,
}

fn default_max_pages() -> u32 {
    1
}

fn default_max_items() -> u32 {
    50
}

/// Per-job overrides for the stable browser profile.
///
/// Unset fields inherit the orchestrator-wide defaults (UA, 1920×1080
/// viewport, timezone, accept-language).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrowserProfileConfig {
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub viewport: Option<(u32, u32)>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub accept_language: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_mode_round_trips_storage_strings() {
        for mode in [
            EngineMode::Auto,
            EngineMode::Http,
            EngineMode::Browser,
            EngineMode::Provider,
        ] {
            assert_eq!(EngineMode::parse(mode.as_str()), mode);
        }
        assert_eq!(EngineMode::parse("garbage"), EngineMode::Auto);
    }

    #[test]
    fn job_deserializes_with_defaults() {
        let job: Job = serde_json::from_str(
            r#"{"id":"j1","target_url":"https://example.com","fields":["title"]}"#,
        )
        .expect("minimal job json");
        assert_eq!(job.crawl_mode, CrawlMode::Single);
        assert_eq!(job.engine_mode, EngineMode::Auto);
        assert!(!job.requires_auth);
        assert!(job.list_config.is_none());
    }
}
