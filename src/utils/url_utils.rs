//! URL manipulation utilities.
//!
//! Domain extraction and relative-href resolution used by the planner,
//! the session pool keying, and list-mode crawling.

use url::Url;

/// Extract the registrable host from a URL string.
///
/// Returns the host portion lowercased with a leading `www.` stripped so
/// that `www.example.com` and `example.com` share statistics and sessions.
pub fn extract_domain(url_str: &str) -> Result<String, String> {
    match Url::parse(url_str) {
        Ok(url) => {
            if let Some(host) = url.host_str() {
                Ok(normalize_host(host))
            } else {
                Err(format!("URL has no host: {url_str}"))
            }
        }
        Err(e) => Err(format!("Failed to parse URL {url_str}: {e}")),
    }
}

fn normalize_host(host: &str) -> String {
    let lowered = host.to_lowercase();
    if let Some(stripped) = lowered.strip_prefix("www.") {
        if !stripped.is_empty() {
            return stripped.to_string();
        }
    }
    lowered
}

/// Resolve a possibly-relative href against a base URL.
///
/// Returns `None` for unparsable bases or hrefs, and for non-HTTP schemes
/// (`javascript:`, `mailto:`, `data:` links are navigation noise).
pub fn resolve_href(base: &str, href: &str) -> Option<String> {
    let base = Url::parse(base).ok()?;
    let resolved = base.join(href.trim()).ok()?;
    if !matches!(resolved.scheme(), "http" | "https") {
        return None;
    }
    Some(resolved.to_string())
}

/// Check if a URL is a fetchable HTTP(S) target
#[must_use]
pub fn is_valid_url(url: &str) -> bool {
    if url.is_empty() {
        return false;
    }

    if url.starts_with("data:") || url.starts_with("javascript:") || url.starts_with("mailto:") {
        return false;
    }

    match Url::parse(url) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain() {
        assert_eq!(
            extract_domain("https://example.com/path").expect("valid https url"),
            "example.com"
        );
        assert_eq!(
            extract_domain("https://www.Example.com/path").expect("www-prefixed url"),
            "example.com"
        );
        assert_eq!(
            extract_domain("http://sub.example.com:8080/path?query=1")
                .expect("url with port and query"),
            "sub.example.com"
        );
        assert!(extract_domain("not a url").is_err());
    }

    #[test]
    fn test_resolve_href() {
        assert_eq!(
            resolve_href("https://example.com/books/index.html", "../page2.html").as_deref(),
            Some("https://example.com/page2.html")
        );
        assert_eq!(
            resolve_href("https://example.com/a", "https://other.com/b").as_deref(),
            Some("https://other.com/b")
        );
        assert_eq!(resolve_href("https://example.com/", "javascript:void(0)"), None);
    }

    #[test]
    fn test_is_valid_url() {
        assert!(is_valid_url("https://example.com"));
        assert!(!is_valid_url("mailto:someone@example.com"));
        assert!(!is_valid_url(""));
        assert!(!is_valid_url("ftp://example.com"));
    }
}
