//! T2: stealth headless browser fetch.
//!
//! Launches a Chromium-compatible browser with a stable profile, injects
//! the stealth startup scripts, paces itself like a person, restores
//! pooled session state, and pulls the rendered HTML back through the
//! same parser as the HTTP tier. On success it captures cookies and
//! storage for the session pool.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::emulation::SetTimezoneOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, EventResponseReceived, ResourceType, SetUserAgentOverrideParams,
};
use chromiumoxide::fetcher::{BrowserFetcher, BrowserFetcherOptions};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::listeners::EventStream;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::job::BrowserProfileConfig;
use crate::session_pool::SessionRecord;
use crate::utils::constants::{
    CHROME_USER_AGENT, DEFAULT_ACCEPT_LANGUAGE, DEFAULT_TIMEZONE, DEFAULT_VIEWPORT,
};

use super::{behavior, stealth, CapturedSession, EngineMetadata, PageCapture};

/// Wait for the document response status after navigation settles.
const STATUS_EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// The stable browser profile applied to every page.
#[derive(Debug, Clone)]
pub struct BrowserProfile {
    pub user_agent: String,
    pub viewport: (u32, u32),
    pub timezone: String,
    pub accept_language: String,
}

impl BrowserProfile {
    /// Merge per-job overrides over the orchestrator defaults.
    #[must_use]
    pub fn resolve(overrides: Option<&BrowserProfileConfig>) -> Self {
        let mut profile = Self {
            user_agent: CHROME_USER_AGENT.to_string(),
            viewport: DEFAULT_VIEWPORT,
            timezone: DEFAULT_TIMEZONE.to_string(),
            accept_language: DEFAULT_ACCEPT_LANGUAGE.to_string(),
        };
        if let Some(o) = overrides {
            if let Some(ua) = &o.user_agent {
                profile.user_agent = ua.clone();
            }
            if let Some(viewport) = o.viewport {
                profile.viewport = viewport;
            }
            if let Some(tz) = &o.timezone {
                profile.timezone = tz.clone();
            }
            if let Some(lang) = &o.accept_language {
                profile.accept_language = lang.clone();
            }
        }
        profile
    }
}

pub struct BrowserEngine {
    headless: bool,
    nav_timeout: Duration,
    consent_selectors: Vec<String>,
}

impl BrowserEngine {
    #[must_use]
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            headless: config.headless(),
            nav_timeout: config.browser_nav_timeout(),
            consent_selectors: config.consent_selectors().to_vec(),
        }
    }

    pub async fn fetch(
        &self,
        url: &str,
        session: Option<&SessionRecord>,
        profile: &BrowserProfile,
    ) -> (PageCapture, EngineMetadata) {
        match self.fetch_inner(url, session, profile).await {
            Ok(result) => result,
            Err(e) => {
                warn!(url, "browser fetch failed: {e:#}");
                let capture = PageCapture {
                    final_url: url.to_string(),
                    network_error: Some(format!("browser: {e:#}")),
                    ..PageCapture::default()
                };
                let metadata = EngineMetadata::Browser {
                    final_url: url.to_string(),
                    consent_clicked: false,
                    stealth_scripts: 0,
                };
                (capture, metadata)
            }
        }
    }

    async fn fetch_inner(
        &self,
        url: &str,
        session: Option<&SessionRecord>,
        profile: &BrowserProfile,
    ) -> Result<(PageCapture, EngineMetadata)> {
        let mut launched = launch_browser(self.headless, profile).await?;

        let result = self
            .drive_page(&launched.browser, url, session, profile)
            .await;

        launched.shutdown().await;
        result
    }

    async fn drive_page(
        &self,
        browser: &Browser,
        url: &str,
        session: Option<&SessionRecord>,
        profile: &BrowserProfile,
    ) -> Result<(PageCapture, EngineMetadata)> {
        // Blank page first: stealth must be in place before the target
        // origin sees any script run
        let page = browser
            .new_page("about:blank")
            .await
            .context("failed to create page")?;

        let stealth_scripts = stealth::inject(&page).await?;
        apply_profile(&page, profile).await?;

        if let Some(session) = session {
            restore_cookies(&page, session).await;
        }

        let mut responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .context("failed to attach response listener")?;

        behavior::pre_navigation_delay().await;

        let navigated =
            tokio::time::timeout(self.nav_timeout, page.goto(url)).await;
        match navigated {
            Err(_) => {
                return Ok(timed_out_capture(url, stealth_scripts));
            }
            Ok(Err(e)) => {
                return Err(anyhow::anyhow!("navigation failed: {e}"));
            }
            Ok(Ok(_)) => {}
        }

        // domcontentloaded is behind us; wait for load, then give the
        // network a short settle window
        if tokio::time::timeout(self.nav_timeout, page.wait_for_navigation())
            .await
            .is_err()
        {
            return Ok(timed_out_capture(url, stealth_scripts));
        }
        behavior::between_actions_delay().await;

        let status = document_status(&mut responses).await;

        if let Some(session) = session {
            if restore_storage(&page, session).await {
                // Storage only applies after a reload on the origin
                let _ = tokio::time::timeout(self.nav_timeout, page.reload()).await;
                behavior::between_actions_delay().await;
            }
        }

        let consent_clicked =
            behavior::dismiss_consent_modals(&page, &self.consent_selectors).await;

        let body = page.content().await.context("failed to read page content")?;
        let final_url = page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| url.to_string());

        let captured_session = capture_session_state(&page, profile).await;

        let capture = PageCapture {
            status: Some(status.unwrap_or(200)),
            body: Some(body),
            final_url: final_url.clone(),
            timed_out: false,
            network_error: None,
            captured_session,
        };
        let metadata = EngineMetadata::Browser {
            final_url,
            consent_clicked,
            stealth_scripts,
        };
        Ok((capture, metadata))
    }
}

fn timed_out_capture(url: &str, stealth_scripts: usize) -> (PageCapture, EngineMetadata) {
    (
        PageCapture {
            final_url: url.to_string(),
            timed_out: true,
            ..PageCapture::default()
        },
        EngineMetadata::Browser {
            final_url: url.to_string(),
            consent_clicked: false,
            stealth_scripts,
        },
    )
}

/// Status of the main document response, best-effort.
async fn document_status(responses: &mut EventStream<EventResponseReceived>) -> Option<u16> {
    let deadline = tokio::time::Instant::now() + STATUS_EVENT_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, responses.next()).await {
            Ok(Some(event)) if event.r#type == ResourceType::Document => {
                return Some(event.response.status as u16);
            }
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

async fn apply_profile(page: &Page, profile: &BrowserProfile) -> Result<()> {
    page.execute(SetUserAgentOverrideParams {
        user_agent: profile.user_agent.clone(),
        accept_language: Some(profile.accept_language.clone()),
        platform: Some("Win32".to_string()),
        user_agent_metadata: None,
    })
    .await
    .context("failed to override user agent")?;

    if let Err(e) = page
        .execute(SetTimezoneOverrideParams {
            timezone_id: profile.timezone.clone(),
        })
        .await
    {
        debug!("timezone override failed: {e}");
    }

    Ok(())
}

/// Replay vaulted cookies into the fresh page. Unconvertible entries are
/// skipped; a stale cookie is strictly better than no session.
async fn restore_cookies(page: &Page, session: &SessionRecord) {
    let params: Vec<CookieParam> = session
        .cookies
        .iter()
        .filter_map(|c| serde_json::from_value(c.clone()).ok())
        .collect();

    if params.is_empty() {
        return;
    }

    let count = params.len();
    match page.set_cookies(params).await {
        Ok(_) => debug!(count, "session cookies restored"),
        Err(e) => warn!("cookie restore failed: {e}"),
    }
}

/// Replay vaulted localStorage/sessionStorage. Returns true when anything
/// was written (caller reloads so page scripts observe it).
async fn restore_storage(page: &Page, session: &SessionRecord) -> bool {
    let state = &session.storage_state;
    let has_entries = ["local", "session"].iter().any(|scope| {
        state
            .get(scope)
            .and_then(|v| v.as_object())
            .is_some_and(|m| !m.is_empty())
    });
    if !has_entries {
        return false;
    }

    let script = format!(
        r#"(() => {{
            const state = {};
            for (const [k, v] of Object.entries(state.local || {{}})) localStorage.setItem(k, v);
            for (const [k, v] of Object.entries(state.session || {{}})) sessionStorage.setItem(k, v);
            return true;
        }})()"#,
        state
    );

    match page.evaluate(script).await {
        Ok(_) => true,
        Err(e) => {
            warn!("storage restore failed: {e}");
            false
        }
    }
}

/// Capture cookies and storage for the session pool.
async fn capture_session_state(page: &Page, profile: &BrowserProfile) -> Option<CapturedSession> {
    let cookies = match page.get_cookies().await {
        Ok(cookies) => cookies
            .into_iter()
            .filter_map(|c| serde_json::to_value(c).ok())
            .collect(),
        Err(e) => {
            debug!("cookie capture failed: {e}");
            Vec::new()
        }
    };

    const STORAGE_SCRIPT: &str = r#"JSON.stringify({
        local: Object.fromEntries(Object.entries(localStorage)),
        session: Object.fromEntries(Object.entries(sessionStorage)),
    })"#;

    let storage_state = match page.evaluate(STORAGE_SCRIPT).await {
        Ok(result) => result
            .into_value::<String>()
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_else(|| serde_json::json!({})),
        Err(e) => {
            debug!("storage capture failed: {e}");
            serde_json::json!({})
        }
    };

    Some(CapturedSession {
        cookies,
        storage_state,
        user_agent: profile.user_agent.clone(),
        viewport: profile.viewport,
    })
}

// =============================================================================
// Launch plumbing
// =============================================================================

/// A launched browser plus the tasks and disk state tied to its lifetime.
struct LaunchedBrowser {
    browser: Browser,
    handler_task: JoinHandle<()>,
    user_data_dir: Option<tempfile::TempDir>,
}

impl LaunchedBrowser {
    /// Close the browser, stop the handler, drop the temp profile.
    async fn shutdown(&mut self) {
        if let Err(e) = self.browser.close().await {
            debug!("browser close failed: {e}");
        }
        let _ = self.browser.wait().await;
        self.handler_task.abort();
        if let Some(dir) = self.user_data_dir.take() {
            if let Err(e) = dir.close() {
                warn!("failed to remove browser profile dir: {e}");
            }
        }
    }
}

impl Drop for LaunchedBrowser {
    fn drop(&mut self) {
        // Fallback when shutdown() was skipped by an early return
        self.handler_task.abort();
    }
}

async fn launch_browser(headless: bool, profile: &BrowserProfile) -> Result<LaunchedBrowser> {
    let chrome_path = match find_browser_executable().await {
        Ok(path) => path,
        Err(_) => download_managed_browser().await?,
    };

    let user_data_dir = tempfile::Builder::new()
        .prefix("fieldhand_chrome_")
        .tempdir()
        .context("failed to create browser profile dir")?;

    let (width, height) = profile.viewport;
    let mut config_builder = BrowserConfigBuilder::default()
        .request_timeout(Duration::from_secs(30))
        .window_size(width, height)
        .viewport(Viewport {
            width,
            height,
            device_scale_factor: Some(1.0),
            emulating_mobile: false,
            is_landscape: true,
            has_touch: false,
        })
        .user_data_dir(user_data_dir.path())
        .chrome_executable(chrome_path);

    if headless {
        config_builder = config_builder.headless_mode(HeadlessMode::default());
    } else {
        config_builder = config_builder.with_head();
    }

    config_builder = config_builder
        .arg(format!("--user-agent={}", profile.user_agent))
        .arg("--disable-blink-features=AutomationControlled")
        .arg("--disable-infobars")
        .arg("--disable-notifications")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--no-sandbox")
        .arg("--disable-setuid-sandbox")
        .arg("--disable-extensions")
        .arg("--disable-popup-blocking")
        .arg("--disable-background-networking")
        .arg("--disable-background-timer-throttling")
        .arg("--disable-backgrounding-occluded-windows")
        .arg("--disable-breakpad")
        .arg("--disable-hang-monitor")
        .arg("--disable-ipc-flooding-protection")
        .arg("--disable-prompt-on-repost")
        .arg("--metrics-recording-only")
        .arg("--password-store=basic")
        .arg("--use-mock-keychain")
        .arg("--hide-scrollbars")
        .arg("--mute-audio");

    let browser_config = config_builder
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))?;

    let (browser, mut handler) = Browser::launch(browser_config)
        .await
        .context("failed to launch browser")?;

    let handler_task = tokio::task::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                debug!("browser handler event error: {e:?}");
            }
        }
    });

    Ok(LaunchedBrowser {
        browser,
        handler_task,
        user_data_dir: Some(user_data_dir),
    })
}

/// Find a Chrome/Chromium executable, preferring the `CHROMIUM_PATH`
/// override, then platform install paths, then `which`.
pub async fn find_browser_executable() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CHROMIUM_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            info!("using browser from CHROMIUM_PATH: {}", path.display());
            return Ok(path);
        }
        warn!(
            "CHROMIUM_PATH points to a non-existent file: {}",
            path.display()
        );
    }

    let paths: Vec<&str> = if cfg!(target_os = "windows") {
        vec![
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files\Chromium\Application\chrome.exe",
        ]
    } else if cfg!(target_os = "macos") {
        vec![
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/opt/homebrew/bin/chromium",
        ]
    } else {
        vec![
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
            "/opt/google/chrome/chrome",
        ]
    };

    for path_str in paths {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("found browser at: {}", path.display());
            return Ok(path);
        }
    }

    if !cfg!(target_os = "windows") {
        for cmd in &["chromium", "chromium-browser", "google-chrome", "chrome"] {
            if let Ok(output) = Command::new("which").arg(cmd).output() {
                if output.status.success() {
                    let path_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    if !path_str.is_empty() {
                        let path = PathBuf::from(path_str);
                        info!("found browser via which: {}", path.display());
                        return Ok(path);
                    }
                }
            }
        }
    }

    Err(anyhow::anyhow!("Chrome/Chromium executable not found"))
}

/// Download a managed Chromium when no system browser exists.
pub async fn download_managed_browser() -> Result<PathBuf> {
    info!("downloading managed Chromium browser");

    let cache_dir = dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("fieldhand")
        .join("chromium");
    std::fs::create_dir_all(&cache_dir).context("failed to create browser cache dir")?;

    let fetcher = BrowserFetcher::new(
        BrowserFetcherOptions::builder()
            .with_path(&cache_dir)
            .build()
            .context("failed to build fetcher options")?,
    );

    let revision_info = fetcher.fetch().await.context("failed to fetch browser")?;
    info!(
        "downloaded Chromium to {}",
        revision_info.folder_path.display()
    );

    Ok(revision_info.executable_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_overrides_merge_over_defaults() {
        let overrides = BrowserProfileConfig {
            user_agent: Some("custom-ua".to_string()),
            viewport: None,
            timezone: Some("Europe/Berlin".to_string()),
            accept_language: None,
        };
        let profile = BrowserProfile::resolve(Some(&overrides));
        assert_eq!(profile.user_agent, "custom-ua");
        assert_eq!(profile.viewport, DEFAULT_VIEWPORT);
        assert_eq!(profile.timezone, "Europe/Berlin");
        assert_eq!(profile.accept_language, DEFAULT_ACCEPT_LANGUAGE);
    }

    #[test]
    fn default_profile_matches_constants() {
        let profile = BrowserProfile::resolve(None);
        assert_eq!(profile.viewport, (1920, 1080));
        assert_eq!(profile.user_agent, CHROME_USER_AGENT);
    }
}
