//! Shared configuration constants for fieldhand
//!
//! This module contains default values and configuration constants used
//! throughout the codebase to ensure consistency and avoid magic numbers.

/// Default politeness rate: 2 requests per second per domain
///
/// Conservative rate that respects server resources while maintaining
/// reasonable throughput. Most servers can handle this rate without issue.
///
/// Users can adjust via the `politeness_rate_rps` config option:
/// - Increase for fast servers or local testing
/// - Decrease for slow servers or rate-limited APIs
pub const DEFAULT_POLITENESS_RATE_RPS: f64 = 2.0;

/// Default cap on engine attempts within a single run
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default T1 (HTTP) fetch timeout in seconds
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 20;

/// Default T2 (browser) navigation timeout in milliseconds
pub const DEFAULT_BROWSER_NAV_TIMEOUT_MS: u64 = 30_000;

/// Default T3 (provider) request timeout in seconds
pub const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 60;

/// Minimum computed trust required to hand a session back out
pub const DEFAULT_SESSION_TRUST_FLOOR: f64 = 40.0;

/// Hard retirement cap on total session uses
pub const DEFAULT_SESSION_MAX_USES: u32 = 200;

/// Hard retirement cap on session age in seconds (2 hours)
pub const DEFAULT_SESSION_MAX_AGE_SECS: i64 = 7_200;

/// Proxy identity used when the caller supplies none.
///
/// Proxy pools are out of scope; the identity is an opaque string that
/// only participates in session keying.
pub const DEFAULT_PROXY_IDENTITY: &str = "default";

/// Chrome user agent string for stealth mode
///
/// Updated: 2025-01-29 to Chrome 132 (current stable)
/// Next update: 2025-04-29 (quarterly schedule)
///
/// Chrome releases new stable versions ~every 4 weeks.
/// Update quarterly to stay within reasonable version window.
///
/// Reference: https://chromiumdash.appspot.com/schedule
pub const CHROME_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.6834.160 Safari/537.36";

/// Default stable browser profile viewport
pub const DEFAULT_VIEWPORT: (u32, u32) = (1920, 1080);

/// Default accept-language header for the stable browser profile
pub const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// Default timezone for the stable browser profile
pub const DEFAULT_TIMEZONE: &str = "America/New_York";

/// Consent/cookie-banner selectors clicked best-effort after navigation.
///
/// Order matters: more specific vendor selectors first, generic text
/// matches last.
pub const DEFAULT_CONSENT_SELECTORS: &[&str] = &[
    "#onetrust-accept-btn-handler",
    "button#truste-consent-button",
    "button[aria-label='Accept all']",
    "button[aria-label='Accept All']",
    "#sp-cc-accept",
    "button.fc-cta-consent",
    "button[mode='primary']",
    "button[title='I Agree']",
    "button[title='Accept']",
];
