// Safe Fetcher
// Manual-redirect fetch loop with per-hop re-validation and a
// streaming response-size cap

use crate::guard::{FetchPurpose, UrlGuard};
use async_trait::async_trait;
use futures::StreamExt;
use montage_types::{MontageError, Result};
use reqwest::{header, redirect, Client, Response, Url};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub max_redirects: usize,
    /// Enforced on the streamed body regardless of what
    /// `Content-Length` advertises.
    pub max_bytes: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            max_redirects: 3,
            max_bytes: 12 * 1024 * 1024,
        }
    }
}

/// Request primitive the fetch loop runs on. The real transport is
/// reqwest with redirects disabled; tests script canned responses.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &Url) -> Result<Response>;
}

struct ReqwestTransport {
    client: Client,
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &Url) -> Result<Response> {
        self.client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| MontageError::Fetch(e.to_string()))
    }
}

/// Fetches guard-approved URLs. Redirects are never auto-followed:
/// every hop goes back through the guard first, because a clean
/// initial URL says nothing about where its 3xx points.
pub struct SafeFetcher {
    guard: UrlGuard,
    config: FetcherConfig,
    transport: Arc<dyn HttpTransport>,
}

impl SafeFetcher {
    pub fn new(guard: UrlGuard, config: FetcherConfig) -> Result<Self> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(config.timeout)
            .build()
            .map_err(|e| MontageError::Fetch(e.to_string()))?;
        Ok(Self::with_transport(
            guard,
            config,
            Arc::new(ReqwestTransport { client }),
        ))
    }

    pub fn with_transport(
        guard: UrlGuard,
        config: FetcherConfig,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            guard,
            config,
            transport,
        }
    }

    pub fn guard(&self) -> &UrlGuard {
        &self.guard
    }

    /// Validate, fetch, and return the body, capped at
    /// [`FetcherConfig::max_bytes`].
    pub async fn fetch_bytes(&self, raw_url: &str, purpose: FetchPurpose) -> Result<Vec<u8>> {
        let mut url = self.guard.assert_safe(raw_url, purpose)?;

        for hop in 0..=self.config.max_redirects {
            let response = self.transport.get(&url).await?;
            let status = response.status();

            if status.is_redirection() {
                if hop == self.config.max_redirects {
                    return Err(MontageError::Fetch(format!(
                        "more than {} redirects",
                        self.config.max_redirects
                    )));
                }
                url = self.next_hop(&url, &response)?;
                debug!(hop = hop + 1, target = %url, "following validated redirect");
                continue;
            }

            if !status.is_success() {
                return Err(MontageError::Fetch(format!(
                    "request to {url} failed with status {status}"
                )));
            }

            return read_capped(Box::pin(response.bytes_stream()), self.config.max_bytes).await;
        }

        Err(MontageError::Fetch(format!(
            "more than {} redirects",
            self.config.max_redirects
        )))
    }

    fn next_hop(&self, current: &Url, response: &reqwest::Response) -> Result<Url> {
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| MontageError::Fetch("redirect without a usable location".to_string()))?;

        // Relative locations resolve against the current hop first.
        let target = current
            .join(location)
            .map_err(|e| MontageError::Fetch(format!("unresolvable redirect location: {e}")))?;

        if self.guard.is_blocked_redirect_location(target.as_str()) {
            return Err(MontageError::UnsafeUrl(format!(
                "redirect to blocked location {target}"
            )));
        }
        Ok(target)
    }
}

/// Accumulate a byte stream, failing as soon as the running total
/// crosses `max_bytes`. Servers lie about `Content-Length`; the cap is
/// enforced on what actually arrives.
async fn read_capped<S, C, E>(mut stream: S, max_bytes: usize) -> Result<Vec<u8>>
where
    S: futures::Stream<Item = std::result::Result<C, E>> + Unpin,
    C: AsRef<[u8]>,
    E: Display,
{
    let mut body = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| MontageError::Fetch(e.to_string()))?;
        let chunk = chunk.as_ref();
        if body.len() + chunk.len() > max_bytes {
            return Err(MontageError::Fetch(format!(
                "response exceeds {max_bytes} byte cap"
            )));
        }
        body.extend_from_slice(chunk);
    }
    Ok(body)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::UrlGuardPolicy;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    /// Pops one canned response per request, recording every URL asked
    /// for.
    struct ScriptedTransport {
        responses: Mutex<VecDeque<http::Response<String>>>,
        requested: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<http::Response<String>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requested: Mutex::new(Vec::new()),
            })
        }

        async fn seen(&self) -> Vec<String> {
            self.requested.lock().await.clone()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn get(&self, url: &Url) -> Result<Response> {
            self.requested.lock().await.push(url.to_string());
            let canned = self
                .responses
                .lock()
                .await
                .pop_front()
                .ok_or_else(|| MontageError::Fetch("no scripted response left".to_string()))?;
            Ok(Response::from(canned))
        }
    }

    fn redirect_to(location: &str) -> http::Response<String> {
        http::Response::builder()
            .status(302)
            .header("location", location)
            .body(String::new())
            .unwrap()
    }

    fn ok_with(body: &str) -> http::Response<String> {
        http::Response::builder()
            .status(200)
            .body(body.to_string())
            .unwrap()
    }

    fn fetcher_with(transport: Arc<ScriptedTransport>) -> SafeFetcher {
        SafeFetcher::with_transport(UrlGuard::default(), FetcherConfig::default(), transport)
    }

    #[tokio::test]
    async fn redirect_to_metadata_ip_is_rejected_before_the_second_hop() {
        let transport = ScriptedTransport::new(vec![redirect_to("https://169.254.169.254/")]);
        let fetcher = fetcher_with(transport.clone());

        let err = fetcher
            .fetch_bytes("https://assets.example.com/shots/1.png", FetchPurpose::Asset)
            .await
            .unwrap_err();

        assert!(matches!(err, MontageError::UnsafeUrl(_)));
        // The blocked location was never requested.
        assert_eq!(
            transport.seen().await,
            vec!["https://assets.example.com/shots/1.png".to_string()]
        );
    }

    #[tokio::test]
    async fn redirect_chain_over_the_hop_cap_is_rejected() {
        let transport = ScriptedTransport::new(vec![
            redirect_to("https://a.example.com/1"),
            redirect_to("https://b.example.com/2"),
            redirect_to("https://c.example.com/3"),
            redirect_to("https://d.example.com/4"),
        ]);
        let fetcher = fetcher_with(transport.clone());

        let err = fetcher
            .fetch_bytes("https://assets.example.com/a.png", FetchPurpose::Asset)
            .await
            .unwrap_err();

        assert!(matches!(err, MontageError::Fetch(_)));
        // Initial request plus three validated hops; the fourth 302 is
        // where the budget runs out.
        assert_eq!(transport.seen().await.len(), 4);
    }

    #[tokio::test]
    async fn relative_redirect_resolves_against_current_host() {
        let transport =
            ScriptedTransport::new(vec![redirect_to("/moved/a.png"), ok_with("payload")]);
        let fetcher = fetcher_with(transport.clone());

        let body = fetcher
            .fetch_bytes("https://assets.example.com/shots/a.png", FetchPurpose::Asset)
            .await
            .unwrap();

        assert_eq!(body, b"payload");
        assert_eq!(
            transport.seen().await,
            vec![
                "https://assets.example.com/shots/a.png".to_string(),
                "https://assets.example.com/moved/a.png".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn redirect_without_location_is_an_error() {
        let bare_302 = http::Response::builder()
            .status(302)
            .body(String::new())
            .unwrap();
        let fetcher = fetcher_with(ScriptedTransport::new(vec![bare_302]));

        let err = fetcher
            .fetch_bytes("https://assets.example.com/a.png", FetchPurpose::Asset)
            .await
            .unwrap_err();
        assert!(matches!(err, MontageError::Fetch(_)));
    }

    fn chunk_stream(
        chunks: Vec<Vec<u8>>,
    ) -> impl futures::Stream<Item = std::result::Result<Vec<u8>, String>> + Unpin {
        futures::stream::iter(chunks.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn body_under_the_cap_is_collected() {
        let body = read_capped(chunk_stream(vec![vec![1; 4], vec![2; 4]]), 16)
            .await
            .unwrap();
        assert_eq!(body.len(), 8);
    }

    #[tokio::test]
    async fn body_over_the_cap_is_rejected_mid_stream() {
        let err = read_capped(chunk_stream(vec![vec![1; 10], vec![2; 10]]), 16)
            .await
            .unwrap_err();
        assert!(matches!(err, MontageError::Fetch(_)));
    }

    #[tokio::test]
    async fn stream_error_surfaces_as_fetch_error() {
        let stream = futures::stream::iter(vec![
            Ok::<Vec<u8>, String>(vec![1, 2, 3]),
            Err("connection reset".to_string()),
        ]);
        let err = read_capped(stream, 1024).await.unwrap_err();
        assert!(matches!(err, MontageError::Fetch(_)));
    }

    #[tokio::test]
    async fn unsafe_initial_url_never_hits_the_network() {
        let fetcher = SafeFetcher::new(UrlGuard::default(), FetcherConfig::default()).unwrap();
        let err = fetcher
            .fetch_bytes("https://127.0.0.1/secret", FetchPurpose::Generic)
            .await
            .unwrap_err();
        assert!(matches!(err, MontageError::UnsafeUrl(_)));
    }

    #[test]
    fn fetcher_builds_with_a_permissive_guard() {
        let guard = UrlGuard::new(UrlGuardPolicy {
            allow_http: true,
            ..UrlGuardPolicy::default()
        });
        assert!(SafeFetcher::new(guard, FetcherConfig::default()).is_ok());
    }
}
