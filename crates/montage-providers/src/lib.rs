// Montage Providers
// Generation backend seam plus ordered fallback selection

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use montage_observability::{emit_event, ObservabilityEvent, ProcessKind};
use montage_types::{Backoff, MontageError, Result};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    /// Fixed fallback order; preferred provider jumps this list per
    /// request but never removes anyone from it.
    #[serde(default)]
    pub fallback_order: Vec<String>,
}

// ============================================================================
// Request / Handle
// ============================================================================

/// One generation request, provider-agnostic. Providers are
/// interchangeable for the caller; the same request goes to whichever
/// one answers first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub project_id: Uuid,
    pub step_slug: String,
    pub prompt: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Accepted-for-processing receipt from a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub provider_id: String,
    pub task_id: String,
}

// ============================================================================
// Error Classification
// ============================================================================

/// Provider failure, classified for retry policy. Transient errors are
/// worth another attempt at the same provider before switching; the
/// rest mean the request is malformed for that provider and a retry
/// would waste the slot.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("rate limited")]
    RateLimited,

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    pub fn retryable_same_provider(&self) -> bool {
        matches!(
            self,
            ProviderError::Network(_)
                | ProviderError::Timeout
                | ProviderError::RateLimited
                | ProviderError::Server { .. }
        )
    }

    /// Classify an HTTP response status the provider returned.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            429 => ProviderError::RateLimited,
            401 | 403 => ProviderError::Auth(message),
            400..=499 => ProviderError::InvalidRequest(message),
            500..=599 => ProviderError::Server { status, message },
            _ => ProviderError::Other(message),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_connect() || err.is_request() {
            ProviderError::Network(err.to_string())
        } else if let Some(status) = err.status() {
            ProviderError::from_status(status.as_u16(), err.to_string())
        } else {
            ProviderError::Other(err.to_string())
        }
    }
}

// ============================================================================
// Provider Seam
// ============================================================================

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn id(&self) -> &str;

    /// Hand the request to the backend; returns once it is accepted,
    /// not once generation finishes.
    async fn submit(&self, request: &GenerationRequest)
        -> std::result::Result<TaskHandle, ProviderError>;
}

/// HTTP-backed provider speaking a generations endpoint with bearer
/// auth. Concrete backends differ only in base URL, key, and model.
pub struct HttpGenerationProvider {
    id: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    client: Client,
}

impl HttpGenerationProvider {
    pub fn new(id: &str, config: &ProviderConfig, default_url: &str, default_model: &str) -> Self {
        Self {
            id: id.to_string(),
            base_url: config
                .url
                .as_deref()
                .unwrap_or(default_url)
                .trim_end_matches('/')
                .to_string(),
            api_key: config
                .api_key
                .as_deref()
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(str::to_string),
            model: config
                .default_model
                .clone()
                .unwrap_or_else(|| default_model.to_string()),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl GenerationProvider for HttpGenerationProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn submit(
        &self,
        request: &GenerationRequest,
    ) -> std::result::Result<TaskHandle, ProviderError> {
        let url = format!("{}/generations", self.base_url);
        let mut req = self.client.post(url).json(&json!({
            "model": self.model,
            "prompt": request.prompt,
            "parameters": request.parameters,
            "reference": format!("{}:{}", request.project_id, request.step_slug),
        }));
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }

        let value: serde_json::Value = response.json().await?;
        let task_id = value
            .get("task_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ProviderError::Other("provider response carried no task_id".to_string())
            })?;

        Ok(TaskHandle {
            provider_id: self.id.clone(),
            task_id: task_id.to_string(),
        })
    }
}

/// Known backends: id, default endpoint, default model.
const KNOWN_PROVIDERS: &[(&str, &str, &str)] = &[
    ("lumen", "https://api.lumen.video/v1", "lumen-motion-2"),
    ("reverie", "https://api.reverie.studio/v1", "reverie-scene-xl"),
    ("atelier", "https://atelier.render.dev/v1", "atelier-base"),
];

/// Instantiate every configured backend, honoring `fallback_order`
/// when present and the built-in order otherwise.
pub fn build_providers(config: &ProvidersConfig) -> Vec<Arc<dyn GenerationProvider>> {
    let order: Vec<&str> = if config.fallback_order.is_empty() {
        KNOWN_PROVIDERS.iter().map(|(id, _, _)| *id).collect()
    } else {
        config.fallback_order.iter().map(String::as_str).collect()
    };

    let mut providers: Vec<Arc<dyn GenerationProvider>> = Vec::new();
    for id in order {
        let Some((_, default_url, default_model)) =
            KNOWN_PROVIDERS.iter().find(|(known, _, _)| *known == id)
        else {
            warn!(provider = id, "unknown provider in fallback order, skipping");
            continue;
        };
        let Some(entry) = config.providers.get(id) else {
            continue;
        };
        providers.push(Arc::new(HttpGenerationProvider::new(
            id,
            entry,
            default_url,
            default_model,
        )));
    }
    providers
}

// ============================================================================
// Fallback Selection
// ============================================================================

/// One entry of the decision log; never persisted.
#[derive(Debug, Clone)]
pub struct ProviderAttempt {
    pub provider_id: String,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Succeeded,
    Failed {
        error: String,
        retryable_same_provider: bool,
    },
}

#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub handle: TaskHandle,
    /// Every attempt made for this request, in order, success last.
    pub attempts: Vec<ProviderAttempt>,
}

/// Single-pass ordered fallback over interchangeable providers.
///
/// Providers fail independently (capacity, outages, API drift), so the
/// chain moves on after any failure; classification only governs
/// whether [`generate_with_retry`](FallbackSelector::generate_with_retry)
/// spends an extra same-provider attempt first.
pub struct FallbackSelector {
    providers: Vec<Arc<dyn GenerationProvider>>,
}

impl FallbackSelector {
    /// `providers` is the fixed fallback order.
    pub fn new(providers: Vec<Arc<dyn GenerationProvider>>) -> Self {
        Self { providers }
    }

    pub fn from_config(config: &ProvidersConfig) -> Self {
        Self::new(build_providers(config))
    }

    fn ordered(&self, preferred: Option<&str>) -> Vec<Arc<dyn GenerationProvider>> {
        let mut chain: Vec<Arc<dyn GenerationProvider>> = Vec::with_capacity(self.providers.len());
        if let Some(id) = preferred {
            if let Some(first) = self.providers.iter().find(|p| p.id() == id) {
                chain.push(first.clone());
            }
        }
        for provider in &self.providers {
            if chain.iter().all(|c| c.id() != provider.id()) {
                chain.push(provider.clone());
            }
        }
        chain
    }

    /// Try each provider once, in order, returning the first success.
    /// Individual failures are logged and swallowed; only an exhausted
    /// chain raises, carrying the last error.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        preferred: Option<&str>,
    ) -> Result<GenerationOutcome> {
        self.run_chain(request, preferred, 0, None).await
    }

    /// Like [`generate`](FallbackSelector::generate), but spends one
    /// extra immediate attempt on the same provider when its failure
    /// classified as transient, sleeping `backoff` in between.
    pub async fn generate_with_retry(
        &self,
        request: &GenerationRequest,
        preferred: Option<&str>,
        backoff: Backoff,
    ) -> Result<GenerationOutcome> {
        self.run_chain(request, preferred, 1, Some(backoff)).await
    }

    async fn run_chain(
        &self,
        request: &GenerationRequest,
        preferred: Option<&str>,
        same_provider_retries: u32,
        backoff: Option<Backoff>,
    ) -> Result<GenerationOutcome> {
        let chain = self.ordered(preferred);
        let mut attempts: Vec<ProviderAttempt> = Vec::new();
        let mut last_error = "no providers configured".to_string();

        for provider in chain {
            let mut tries_here = 0;
            loop {
                tries_here += 1;
                match provider.submit(request).await {
                    Ok(handle) => {
                        attempts.push(ProviderAttempt {
                            provider_id: provider.id().to_string(),
                            outcome: AttemptOutcome::Succeeded,
                        });
                        log_attempt(request, provider.id(), "accepted", None);
                        return Ok(GenerationOutcome { handle, attempts });
                    }
                    Err(error) => {
                        let retryable = error.retryable_same_provider();
                        last_error = error.to_string();
                        log_attempt(
                            request,
                            provider.id(),
                            if retryable { "failed_retryable" } else { "failed" },
                            Some(&last_error),
                        );
                        attempts.push(ProviderAttempt {
                            provider_id: provider.id().to_string(),
                            outcome: AttemptOutcome::Failed {
                                error: last_error.clone(),
                                retryable_same_provider: retryable,
                            },
                        });

                        if retryable && tries_here <= same_provider_retries {
                            if let Some(backoff) = backoff {
                                tokio::time::sleep(backoff.delay_for_attempt(tries_here)).await;
                            }
                            continue;
                        }
                        break;
                    }
                }
            }
        }

        Err(MontageError::AllProvidersFailed {
            attempts: attempts.len(),
            last_error,
        })
    }
}

/// Audit record for one attempt of the fallback chain.
fn log_attempt(request: &GenerationRequest, provider_id: &str, status: &str, detail: Option<&str>) {
    let project_id = request.project_id.to_string();
    let level = if status == "accepted" {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    emit_event(
        level,
        ProcessKind::Web,
        ObservabilityEvent {
            event: "provider_attempt",
            component: "fallback_selector",
            project_id: Some(&project_id),
            step: None,
            job_id: None,
            provider_id: Some(provider_id),
            tier: None,
            status: Some(status),
            error_code: None,
            detail: detail.or(Some(request.step_slug.as_str())),
        },
    );
}

// ============================================================================
// Tests
// ============================================================================
