//! Shared utilities: URL handling and crate-wide constants.

pub mod constants;
pub mod url_utils;

pub use url_utils::{extract_domain, is_valid_url, resolve_href};

/// Current time as unix seconds, the storage format for every timestamp
/// column in the store.
#[must_use]
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
