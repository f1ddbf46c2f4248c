//! Authenticated access to the remote classification service
//!
//! Two endpoints matter: a lookup endpoint that maps a classification code
//! to the opaque IRI of its concept record, and the concept records
//! themselves, fetched by IRI. Every request carries a bearer token from
//! [`TokenManager`] and runs under a small retry policy tuned for the way
//! this service fails: a 401 means the token aged out server-side and one
//! refresh fixes it, a 429 means the daily quota is gone and retrying only
//! digs the hole deeper, and 5xx or connection trouble deserves a linear
//! backoff.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::error::{Result, TaxonomyError};
use crate::model::Concept;
use crate::token::{CredentialProvider, TokenManager};

/// Endpoints, credentials scope, and retry tuning for one remote service.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Code-to-IRI lookup endpoint, with `{code}` standing in for the
    /// classification code
    pub lookup_url: String,

    /// OAuth2 token endpoint
    pub token_url: String,

    /// OAuth2 scope requested with each token
    pub scope: String,

    /// Per-request timeout
    pub request_timeout: Duration,

    /// Total attempts per request, first try included
    pub max_attempts: u32,

    /// Base delay for the linear backoff between transient failures
    pub retry_base_delay: Duration,

    /// Token age after which a renewal is forced
    pub token_safety_margin: Duration,
}

impl RemoteConfig {
    pub fn new(
        lookup_url: impl Into<String>,
        token_url: impl Into<String>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            lookup_url: lookup_url.into(),
            token_url: token_url.into(),
            scope: scope.into(),
            request_timeout: Duration::from_secs(15),
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(600),
            // tokens last an hour, renew at 43 minutes
            token_safety_margin: Duration::from_secs(2580),
        }
    }

    /// Configuration for the Dewey Decimal linked-data service.
    pub fn dewey_linked_data() -> Self {
        Self::new(
            "https://id.oclc.org/worldcat/ddc/api/url?ddc={code}",
            "https://oauth.oclc.org/token",
            "deweyLinkedData",
        )
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.lookup_url.is_empty() {
            return Err("lookup_url must not be empty".to_string());
        }

        if !self.lookup_url.contains("{code}") {
            return Err("lookup_url must contain a {code} placeholder".to_string());
        }

        if self.token_url.is_empty() {
            return Err("token_url must not be empty".to_string());
        }

        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }

        if self.request_timeout.is_zero() {
            return Err("request_timeout must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self::dewey_linked_data()
    }
}

/// How a failed response should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Token no longer accepted; refresh it and retry immediately
    Auth,
    /// Quota exhausted; retrying would burn more of it
    RateLimited,
    /// Server-side hiccup; retry after a backoff
    Transient,
    /// Request is wrong in a way retrying cannot fix
    Permanent,
}

impl FailureClass {
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::UNAUTHORIZED => FailureClass::Auth,
            StatusCode::TOO_MANY_REQUESTS => FailureClass::RateLimited,
            s if s.is_server_error() => FailureClass::Transient,
            _ => FailureClass::Permanent,
        }
    }
}

/// Attempt count and linear backoff schedule.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Backoff before the attempt after `attempt` (zero-based) failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * (attempt + 1)
    }
}

/// HTTP client for the classification service, with token handling and
/// retries baked into every request.
pub struct RemoteService {
    http: reqwest::Client,
    tokens: TokenManager,
    config: RemoteConfig,
    retry: RetryPolicy,
}

impl RemoteService {
    pub fn new(config: RemoteConfig, provider: Arc<dyn CredentialProvider>) -> Result<Self> {
        config.validate().map_err(TaxonomyError::Config)?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TaxonomyError::Config(format!("failed to build HTTP client: {e}")))?;

        let tokens = TokenManager::new(
            http.clone(),
            config.token_url.clone(),
            config.scope.clone(),
            provider,
            config.token_safety_margin,
        );

        let retry = RetryPolicy::new(config.max_attempts, config.retry_base_delay);

        Ok(Self {
            http,
            tokens,
            config,
            retry,
        })
    }

    /// Concrete lookup URL for a classification code. Also used as the
    /// durable key for negative entries, where no concept IRI exists.
    pub fn lookup_url(&self, code: &str) -> String {
        self.config.lookup_url.replace("{code}", code)
    }

    /// Maps a classification code to its concept IRI. `Ok(None)` means the
    /// service answered and the code has no record.
    pub async fn lookup_code(&self, code: &str) -> Result<Option<String>> {
        let url = self.lookup_url(code);
        let body = match self.request_with_retry(&url, code).await? {
            Some(body) => body,
            None => return Ok(None),
        };

        let mapping: serde_json::Value = serde_json::from_str(&body).map_err(|e| {
            TaxonomyError::Serialization(format!("lookup response for '{code}': {e}"))
        })?;

        Ok(mapping
            .get(code)
            .and_then(serde_json::Value::as_str)
            .map(str::to_string))
    }

    /// Fetches a concept record by IRI, returning both the parsed concept
    /// and the raw body for persistence.
    pub async fn fetch_concept(&self, resource_id: &str) -> Result<(Concept, String)> {
        let body = self
            .request_with_retry(resource_id, resource_id)
            .await?
            .ok_or_else(|| {
                TaxonomyError::remote(resource_id, "resource vanished between lookup and fetch")
            })?;

        let concept = Concept::from_json(&body)?;
        Ok((concept, body))
    }

    /// GET with bearer auth under the retry policy. `Ok(None)` is a 404.
    async fn request_with_retry(&self, url: &str, context: &str) -> Result<Option<String>> {
        for attempt in 0..self.retry.max_attempts {
            let last = attempt + 1 == self.retry.max_attempts;
            let token = self.tokens.bearer().await?;

            let outcome = self.http.get(url).bearer_auth(&token).send().await;
            let response = match outcome {
                Ok(response) => response,
                Err(e) => {
                    if last {
                        return Err(TaxonomyError::remote(
                            context,
                            format!("request failed: {e}"),
                        ));
                    }
                    warn!(context = %context, error = %e, "Request failed, backing off");
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return response
                    .text()
                    .await
                    .map(Some)
                    .map_err(|e| {
                        TaxonomyError::remote(context, format!("reading response body: {e}"))
                    });
            }
            if status == StatusCode::NOT_FOUND {
                return Ok(None);
            }

            match FailureClass::from_status(status) {
                FailureClass::Auth => {
                    self.tokens.invalidate().await;
                    if last {
                        return Err(TaxonomyError::invalid_credentials(format!(
                            "{context}: still unauthorized after a token refresh"
                        )));
                    }
                    // fresh token next loop, no backoff
                    debug!(context = %context, "Token rejected, refreshing and retrying");
                }
                FailureClass::RateLimited => {
                    return Err(TaxonomyError::remote(
                        context,
                        "rate limited (429), daily quota likely exhausted",
                    ));
                }
                FailureClass::Transient => {
                    if last {
                        return Err(TaxonomyError::remote(
                            context,
                            format!("gave up after {} attempts, last status {status}", self.retry.max_attempts),
                        ));
                    }
                    warn!(context = %context, status = %status, "Transient failure, backing off");
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                }
                FailureClass::Permanent => {
                    return Err(TaxonomyError::remote(context, format!("status {status}")));
                }
            }
        }

        Err(TaxonomyError::remote(context, "retries exhausted"))
    }
}
