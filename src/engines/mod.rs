//! Extraction engines: three tiers behind one contract.
//!
//! T1 fetches over plain HTTP, T2 drives a stealth headless browser, T3
//! delegates to a commercial fetch provider. All three produce a
//! [`PageCapture`], all three feed the same parser, and the shared driver
//! in this module turns captures into records for both single-page and
//! list-mode jobs.

pub mod behavior;
pub mod browser;
pub mod http;
pub mod provider;
pub mod stealth;

use std::time::{Duration, Instant};

use scraper::Html;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::OrchestratorConfig;
use crate::extract::schema::FieldMap;
use crate::extract::{self, PageExtraction};
use crate::job::{CrawlMode, Job};
use crate::run::EngineTier;
use crate::session_pool::SessionRecord;
use crate::store::Store;

pub use browser::BrowserProfile;

/// Typed error for engine construction; runtime trouble travels inside
/// [`PageCapture`] so the classifier can see it.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("http client build failed: {0}")]
    ClientBuild(#[from] reqwest::Error),
    #[error("engine configuration error: {0}")]
    Config(String),
}

/// Session material captured by the browser tier on a successful fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedSession {
    pub cookies: Vec<Value>,
    pub storage_state: Value,
    pub user_agent: String,
    pub viewport: (u32, u32),
}

/// Raw result of fetching one page through any tier.
#[derive(Debug, Clone, Default)]
pub struct PageCapture {
    pub status: Option<u16>,
    pub body: Option<String>,
    pub final_url: String,
    pub timed_out: bool,
    /// Hard network-level failure (DNS/TLS/connect/reset/launch)
    pub network_error: Option<String>,
    pub captured_session: Option<CapturedSession>,
}

impl PageCapture {
    /// A capture the crawl driver can keep working with.
    #[must_use]
    pub fn is_ok_2xx(&self) -> bool {
        !self.timed_out
            && self.network_error.is_none()
            && self.status.is_some_and(|s| (200..300).contains(&s))
    }
}

/// Closed, typed per-tier metadata attached to every outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "engine", rename_all = "snake_case")]
pub enum EngineMetadata {
    Http {
        final_url: String,
        content_type: Option<String>,
    },
    Browser {
        final_url: String,
        consent_clicked: bool,
        stealth_scripts: usize,
    },
    Provider {
        endpoint: String,
        credits_remaining: i64,
        render_js: bool,
    },
}

/// What an engine attempt produced, shaped for the classifier and the
/// executor's record commit.
#[derive(Debug, Clone)]
pub struct EngineOutcome {
    pub engine: EngineTier,
    pub records: Vec<Map<String, Value>>,
    pub status: Option<u16>,
    /// Body of the page that decides classification (the blocking page
    /// when a crawl short-circuits, the listing page otherwise)
    pub body: Option<String>,
    pub body_size: usize,
    pub duration: Duration,
    pub timed_out: bool,
    pub network_error: Option<String>,
    /// Best per-page extraction count across fetched pages
    pub extracted_fields: usize,
    pub required_fields: usize,
    pub low_confidence_fields: Vec<String>,
    pub pages_fetched: u32,
    pub captured_session: Option<CapturedSession>,
    pub metadata: EngineMetadata,
}

/// The three engines, constructed once per process and shared by every
/// executor.
pub struct Engines {
    http: http::HttpEngine,
    browser: browser::BrowserEngine,
    provider: provider::ProviderEngine,
}

impl Engines {
    pub fn new(config: &OrchestratorConfig, store: Store) -> Result<Self, EngineError> {
        Ok(Self {
            http: http::HttpEngine::new(config)?,
            browser: browser::BrowserEngine::new(config),
            provider: provider::ProviderEngine::new(config, store)?,
        })
    }

    /// The uniform engine operation: fetch the job's target (and, in
    /// list mode, its item pages) through `tier` and extract records via
    /// the shared field-map semantics.
    pub async fn fetch_and_extract(
        &self,
        tier: EngineTier,
        job: &Job,
        field_map: &FieldMap,
        session: Option<&SessionRecord>,
    ) -> EngineOutcome {
        let started = Instant::now();
        let profile = BrowserProfile::resolve(job.browser_profile.as_ref());

        let mut outcome = match job.crawl_mode {
            CrawlMode::Single => {
                self.run_single(tier, job, field_map, session, &profile).await
            }
            CrawlMode::List => self.run_list(tier, job, field_map, session, &profile).await,
        };

        outcome.duration = started.elapsed();
        outcome
    }

    async fn fetch_page(
        &self,
        tier: EngineTier,
        url: &str,
        session: Option<&SessionRecord>,
        profile: &BrowserProfile,
    ) -> (PageCapture, EngineMetadata) {
        match tier {
            EngineTier::Http => self.http.fetch(url, session).await,
            EngineTier::Browser => self.browser.fetch(url, session, profile).await,
            EngineTier::Provider => self.provider.fetch(url).await,
        }
    }

    async fn run_single(
        &self,
        tier: EngineTier,
        job: &Job,
        field_map: &FieldMap,
        session: Option<&SessionRecord>,
        profile: &BrowserProfile,
    ) -> EngineOutcome {
        let (capture, metadata) = self
            .fetch_page(tier, &job.target_url, session, profile)
            .await;

        let extraction = capture
            .body
            .as_deref()
            .map(|body| extract::extract_fields(&Html::parse_document(body), field_map));

        let mut outcome = outcome_from_capture(tier, capture, metadata, field_map.len());
        outcome.pages_fetched = 1;

        if let Some(extraction) = extraction {
            apply_extraction(&mut outcome, &extraction);
            if outcome.is_committable(&extraction) {
                outcome.records.push(extraction.record);
            }
        }

        outcome
    }

    async fn run_list(
        &self,
        tier: EngineTier,
        job: &Job,
        field_map: &FieldMap,
        session: Option<&SessionRecord>,
        profile: &BrowserProfile,
    ) -> EngineOutcome {
        let Some(list_config) = job.list_config.as_ref() else {
            warn!(job = %job.id, "list mode without list config; treating as single page");
            return self.run_single(tier, job, field_map, session, profile).await;
        };

        let mut pages_fetched = 0u32;
        let mut item_urls: Vec<String> = Vec::new();
        let mut page_url = job.target_url.clone();
        let mut last_listing: Option<(PageCapture, EngineMetadata)> = None;

        // Walk listing pages collecting item links until the caps bite
        for page_index in 0..list_config.max_pages.max(1) {
            let (capture, metadata) = self.fetch_page(tier, &page_url, session, profile).await;
            pages_fetched += 1;

            if !capture.is_ok_2xx() {
                // A blocked or broken listing page decides the outcome
                let mut outcome =
                    outcome_from_capture(tier, capture, metadata, field_map.len());
                outcome.pages_fetched = pages_fetched;
                return outcome;
            }

            let html = Html::parse_document(capture.body.as_deref().unwrap_or_default());
            let mut found =
                extract::extract_link_targets(&html, &list_config.item_links, &page_url);
            debug!(
                page = page_index + 1,
                links = found.len(),
                url = %page_url,
                "listing page scanned"
            );

            // Dedup across pages preserving first occurrence
            found.retain(|u| !item_urls.contains(u));
            item_urls.extend(found);

            let next_page = list_config.pagination.as_ref().and_then(|spec| {
                extract::extract_link_targets(&html, spec, &page_url)
                    .into_iter()
                    .next()
            });

            last_listing = Some((capture, metadata));

            match next_page {
                Some(next) if page_index + 1 < list_config.max_pages => page_url = next,
                _ => break,
            }
        }

        item_urls.truncate(list_config.max_items as usize);

        let (listing_capture, listing_metadata) = match last_listing {
            Some(pair) => pair,
            None => {
                // max_pages clamps to 1 above, so a listing was fetched
                let mut outcome = outcome_from_capture(
                    tier,
                    PageCapture::default(),
                    EngineMetadata::Http {
                        final_url: job.target_url.clone(),
                        content_type: None,
                    },
                    field_map.len(),
                );
                outcome.pages_fetched = pages_fetched;
                return outcome;
            }
        };

        let mut outcome =
            outcome_from_capture(tier, listing_capture, listing_metadata, field_map.len());
        let mut best_extraction: Option<PageExtraction> = None;

        for item_url in &item_urls {
            let (capture, _) = self.fetch_page(tier, item_url, session, profile).await;
            pages_fetched += 1;

            if !capture.is_ok_2xx() {
                // Mid-crawl block: surface the failing page to the
                // classifier and keep whatever records already extracted
                outcome.status = capture.status;
                outcome.timed_out = capture.timed_out;
                outcome.network_error = capture.network_error.clone();
                outcome.body_size = capture.body.as_deref().map_or(0, str::len);
                outcome.body = capture.body;
                break;
            }

            if let Some(session) = capture.captured_session {
                outcome.captured_session = Some(session);
            }

            let Some(body) = capture.body.as_deref() else {
                continue;
            };
            let extraction = extract::extract_fields(&Html::parse_document(body), field_map);
            if extraction.extracted_count() > 0 {
                outcome.records.push(extraction.record.clone());
            }
            let is_better = best_extraction
                .as_ref()
                .map_or(true, |best| extraction.extracted_count() > best.extracted_count());
            if is_better {
                best_extraction = Some(extraction);
            }
        }

        if let Some(best) = best_extraction {
            apply_extraction(&mut outcome, &best);
        }
        outcome.pages_fetched = pages_fetched;
        outcome
    }
}

impl EngineOutcome {
    /// Whether a single-page extraction is worth committing as a record.
    fn is_committable(&self, extraction: &PageExtraction) -> bool {
        self.is_2xx() && extraction.extracted_count() > 0
    }

    #[must_use]
    pub fn is_2xx(&self) -> bool {
        self.status.is_some_and(|s| (200..300).contains(&s))
    }
}

fn outcome_from_capture(
    tier: EngineTier,
    capture: PageCapture,
    metadata: EngineMetadata,
    required_fields: usize,
) -> EngineOutcome {
    EngineOutcome {
        engine: tier,
        records: Vec::new(),
        status: capture.status,
        body_size: capture.body.as_deref().map_or(0, str::len),
        body: capture.body,
        duration: Duration::ZERO,
        timed_out: capture.timed_out,
        network_error: capture.network_error,
        extracted_fields: 0,
        required_fields,
        low_confidence_fields: Vec::new(),
        pages_fetched: 0,
        captured_session: capture.captured_session,
        metadata,
    }
}

fn apply_extraction(outcome: &mut EngineOutcome, extraction: &PageExtraction) {
    outcome.extracted_fields = extraction.extracted_count();
    outcome.low_confidence_fields = extraction.low_confidence_fields();
}
