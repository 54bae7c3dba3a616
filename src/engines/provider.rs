//! T3: commercial fetch provider adapter.
//!
//! One HTTPS call per fetch with JS rendering and premium proxies turned
//! on; the returned HTML goes through exactly the same extraction path as
//! the HTTP tier. Every call consumes one credit from the active API key;
//! depleted keys deactivate and the next key rotates in.

use tracing::{debug, warn};

use crate::config::OrchestratorConfig;
use crate::store::Store;

use super::{EngineError, EngineMetadata, PageCapture};

pub struct ProviderEngine {
    client: reqwest::Client,
    endpoint: String,
    store: Store,
}

impl ProviderEngine {
    pub fn new(config: &OrchestratorConfig, store: Store) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(config.provider_timeout())
            .build()?;
        Ok(Self {
            client,
            endpoint: config.provider_endpoint().to_string(),
            store,
        })
    }

    pub async fn fetch(&self, url: &str) -> (PageCapture, EngineMetadata) {
        let metadata_for = |credits: i64| EngineMetadata::Provider {
            endpoint: self.endpoint.clone(),
            credits_remaining: credits,
            render_js: true,
        };

        let key = match self.store.next_active_api_key().await {
            Ok(Some(key)) => key,
            Ok(None) => {
                warn!("provider tier invoked with no active api key");
                let capture = PageCapture {
                    final_url: url.to_string(),
                    network_error: Some("provider credits exhausted".to_string()),
                    ..PageCapture::default()
                };
                return (capture, metadata_for(0));
            }
            Err(e) => {
                let capture = PageCapture {
                    final_url: url.to_string(),
                    network_error: Some(format!("api key lookup failed: {e}")),
                    ..PageCapture::default()
                };
                return (capture, metadata_for(0));
            }
        };

        let request = self.client.get(&self.endpoint).query(&[
            ("api_key", key.key.as_str()),
            ("url", url),
            ("render_js", "true"),
            ("premium_proxy", "true"),
            ("country_code", "us"),
        ]);

        let response = request.send().await;

        // The call went out; charge the credit regardless of outcome
        let credits_remaining = match self.store.consume_api_credit(&key.key).await {
            Ok(remaining) => {
                if remaining == 0 {
                    warn!("provider api key depleted and deactivated");
                }
                remaining
            }
            Err(e) => {
                warn!("credit accounting failed: {e}");
                key.credits_remaining - 1
            }
        };

        match response {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = match response.text().await {
                    Ok(body) => Some(body),
                    Err(e) => {
                        debug!(url, "provider body decode failed: {e}");
                        None
                    }
                };
                debug!(url, status, credits_remaining, "provider fetch complete");

                let capture = PageCapture {
                    status: Some(status),
                    body,
                    final_url: url.to_string(),
                    timed_out: false,
                    network_error: None,
                    captured_session: None,
                };
                (capture, metadata_for(credits_remaining))
            }
            Err(e) => {
                let mut capture = PageCapture {
                    final_url: url.to_string(),
                    ..PageCapture::default()
                };
                if e.is_timeout() {
                    capture.timed_out = true;
                } else {
                    capture.network_error = Some(e.to_string());
                }
                (capture, metadata_for(credits_remaining))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn engine_with_endpoint(endpoint: &str, keys: &[&str]) -> ProviderEngine {
        let store = Store::open_in_memory().await.expect("store");
        for key in keys {
            store.seed_api_key(key).await.expect("seed key");
        }
        let config = OrchestratorConfig::builder()
            .provider_endpoint(endpoint)
            .build();
        ProviderEngine::new(&config, store).expect("engine")
    }

    #[tokio::test]
    async fn fetch_charges_a_credit_and_returns_html() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body("<html><h1>rendered</h1></html>")
            .create_async()
            .await;

        let engine = engine_with_endpoint(&server.url(), &["key-a"]).await;
        let (capture, metadata) = engine.fetch("https://target.example/page").await;

        mock.assert_async().await;
        assert_eq!(capture.status, Some(200));
        assert!(capture.body.expect("body").contains("rendered"));
        match metadata {
            EngineMetadata::Provider {
                credits_remaining,
                render_js,
                ..
            } => {
                assert!(render_js);
                assert_eq!(credits_remaining, 999);
            }
            other => panic!("unexpected metadata: {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_keys_is_a_network_level_failure() {
        let engine = engine_with_endpoint("http://127.0.0.1:1/", &[]).await;
        let (capture, _) = engine.fetch("https://target.example/page").await;
        assert!(capture.network_error.expect("error").contains("credits exhausted"));
    }
}
