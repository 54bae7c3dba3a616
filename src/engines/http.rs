//! T1: plain HTTP fetch.
//!
//! Follows redirects, decodes by the declared charset (reqwest honors the
//! content-type header), and reuses pooled session cookies when present.
//! Cheap, fast, and the default first tier for unclassified domains.

use reqwest::header::{HeaderValue, COOKIE};
use tracing::debug;

use crate::config::OrchestratorConfig;
use crate::session_pool::SessionRecord;
use crate::utils::constants::CHROME_USER_AGENT;

use super::{EngineError, EngineMetadata, PageCapture};

pub struct HttpEngine {
    client: reqwest::Client,
}

impl HttpEngine {
    pub fn new(config: &OrchestratorConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .user_agent(CHROME_USER_AGENT)
            .timeout(config.http_timeout())
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self { client })
    }

    pub async fn fetch(
        &self,
        url: &str,
        session: Option<&SessionRecord>,
    ) -> (PageCapture, EngineMetadata) {
        let mut request = self.client.get(url);

        if let Some(session) = session {
            if let Some(header) = cookie_header(session) {
                request = request.header(COOKIE, header);
            }
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let capture = capture_from_error(url, &e);
                let metadata = EngineMetadata::Http {
                    final_url: url.to_string(),
                    content_type: None,
                };
                return (capture, metadata);
            }
        };

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        // text() decodes by the charset the server declared
        let body = match response.text().await {
            Ok(body) => Some(body),
            Err(e) => {
                debug!(url, "body decode failed: {e}");
                None
            }
        };

        let capture = PageCapture {
            status: Some(status),
            body,
            final_url: final_url.clone(),
            timed_out: false,
            network_error: None,
            captured_session: None,
        };
        let metadata = EngineMetadata::Http {
            final_url,
            content_type,
        };
        (capture, metadata)
    }
}

fn capture_from_error(url: &str, error: &reqwest::Error) -> PageCapture {
    let mut capture = PageCapture {
        final_url: url.to_string(),
        ..PageCapture::default()
    };
    if error.is_timeout() {
        capture.timed_out = true;
    } else {
        capture.network_error = Some(error.to_string());
    }
    capture
}

/// Build a `Cookie:` header from the vaulted CDP cookie shapes.
fn cookie_header(session: &SessionRecord) -> Option<HeaderValue> {
    let pairs: Vec<String> = session
        .cookies
        .iter()
        .filter_map(|c| {
            let name = c.get("name")?.as_str()?;
            let value = c.get("value")?.as_str()?;
            Some(format!("{name}={value}"))
        })
        .collect();

    if pairs.is_empty() {
        return None;
    }
    HeaderValue::from_str(&pairs.join("; ")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_pool::SessionHealth;

    fn session_with_cookies(cookies: Vec<serde_json::Value>) -> SessionRecord {
        SessionRecord {
            domain: "example.com".to_string(),
            proxy_identity: "default".to_string(),
            cookies,
            storage_state: serde_json::json!({}),
            user_agent: "ua".to_string(),
            viewport: (1920, 1080),
            created_at: 0,
            last_used: 0,
            last_success_at: None,
            total_uses: 0,
            consecutive_failures: 0,
            captcha_count: 0,
            health: SessionHealth::Valid,
            expires_at: None,
        }
    }

    #[test]
    fn cookie_header_joins_pairs() {
        let session = session_with_cookies(vec![
            serde_json::json!({"name": "sid", "value": "abc", "domain": ".example.com"}),
            serde_json::json!({"name": "lang", "value": "en"}),
        ]);
        let header = cookie_header(&session).expect("header");
        assert_eq!(header.to_str().expect("ascii"), "sid=abc; lang=en");
    }

    #[test]
    fn empty_jar_yields_no_header() {
        let session = session_with_cookies(vec![]);
        assert!(cookie_header(&session).is_none());
    }

    #[tokio::test]
    async fn fetch_captures_status_and_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/page")
            .with_status(200)
            .with_header("content-type", "text/html; charset=utf-8")
            .with_body("<html><h1>Example Domain</h1></html>")
            .create_async()
            .await;

        let config = OrchestratorConfig::default();
        let engine = HttpEngine::new(&config).expect("engine");
        let (capture, metadata) = engine.fetch(&format!("{}/page", server.url()), None).await;

        mock.assert_async().await;
        assert_eq!(capture.status, Some(200));
        assert!(capture.body.expect("body").contains("Example Domain"));
        match metadata {
            EngineMetadata::Http { content_type, .. } => {
                assert!(content_type.expect("content type").starts_with("text/html"));
            }
            other => panic!("unexpected metadata: {other:?}"),
        }
    }

    #[tokio::test]
    async fn connection_refused_is_a_network_error() {
        let config = OrchestratorConfig::default();
        let engine = HttpEngine::new(&config).expect("engine");
        // Port 1 is never listening
        let (capture, _) = engine.fetch("http://127.0.0.1:1/", None).await;
        assert!(capture.status.is_none());
        assert!(capture.network_error.is_some());
        assert!(!capture.timed_out);
    }
}
