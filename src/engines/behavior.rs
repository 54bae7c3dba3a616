//! Human-like interaction pacing for the browser tier.
//!
//! Small randomized delays before navigation and between UI actions, and
//! cursor movement to the target coordinates before any click. Uniformly
//! instant automation is its own fingerprint.

use std::time::Duration;

use chromiumoxide::Page;
use rand::Rng;
use tracing::debug;

/// Delay range applied before navigation, milliseconds.
const PRE_NAV_DELAY_MS: (u64, u64) = (300, 800);

/// Delay range applied between UI actions, milliseconds.
const ACTION_DELAY_MS: (u64, u64) = (500, 1_000);

/// Sleep 0.3–0.8 s before navigating.
pub async fn pre_navigation_delay() {
    sleep_range(PRE_NAV_DELAY_MS).await;
}

/// Sleep 0.5–1.0 s between UI actions.
pub async fn between_actions_delay() {
    sleep_range(ACTION_DELAY_MS).await;
}

async fn sleep_range((lo, hi): (u64, u64)) {
    let ms = rand::rng().random_range(lo..=hi);
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Best-effort dismissal of cookie/consent/"I Agree" modals: click the
/// first matching selector from the configured list, moving the cursor to
/// the element first. Returns true when something was clicked.
pub async fn dismiss_consent_modals(page: &Page, selectors: &[String]) -> bool {
    for selector in selectors {
        let Ok(element) = page.find_element(selector.as_str()).await else {
            continue;
        };
        let Ok(point) = element.clickable_point().await else {
            continue;
        };

        // Cursor travels to the target before the press
        if page.move_mouse(point).await.is_err() {
            continue;
        }
        between_actions_delay().await;

        match page.click(point).await {
            Ok(_) => {
                debug!(selector, "consent modal dismissed");
                between_actions_delay().await;
                return true;
            }
            Err(e) => {
                debug!(selector, "consent click failed: {e}");
            }
        }
    }
    false
}
