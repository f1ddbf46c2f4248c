//! OAuth2 client-credentials token management
//!
//! The remote classification service hands out bearer tokens valid for about
//! an hour. `TokenManager` keeps the current token in a shared slot and
//! renews it once its age passes the safety margin, well before the remote
//! end would start rejecting it. Renewal is double-checked: concurrent
//! callers that find the slot stale all wait on one exchange rather than
//! stampeding the token endpoint.
//!
//! Credentials are injected by the caller through [`CredentialProvider`].
//! This crate never reads them from the process environment.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{Result, TaxonomyError};

/// Client id and secret for the remote service.
#[derive(Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Source of client credentials, supplied by the embedding application.
pub trait CredentialProvider: Send + Sync {
    /// Current credentials, or `None` when the application has none
    /// configured.
    fn credentials(&self) -> Option<Credentials>;
}

/// Credentials fixed at construction time.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    inner: Credentials,
}

impl StaticCredentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            inner: Credentials {
                client_id: client_id.into(),
                client_secret: client_secret.into(),
            },
        }
    }
}

impl CredentialProvider for StaticCredentials {
    fn credentials(&self) -> Option<Credentials> {
        Some(self.inner.clone())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// A bearer token and the moment it was acquired.
#[derive(Clone)]
struct Token {
    value: String,
    issued_at: Instant,
}

/// Shared bearer-token slot with double-checked renewal.
pub struct TokenManager {
    http: reqwest::Client,
    token_url: String,
    scope: String,
    provider: Arc<dyn CredentialProvider>,
    /// Token age after which the slot counts as stale
    safety_margin: Duration,
    slot: RwLock<Option<Token>>,
    /// Held across the token exchange so only one runs at a time
    refresh: Mutex<()>,
}

impl TokenManager {
    pub fn new(
        http: reqwest::Client,
        token_url: impl Into<String>,
        scope: impl Into<String>,
        provider: Arc<dyn CredentialProvider>,
        safety_margin: Duration,
    ) -> Self {
        Self {
            http,
            token_url: token_url.into(),
            scope: scope.into(),
            provider,
            safety_margin,
            slot: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    /// Returns a bearer token that is fresh enough to use, acquiring or
    /// renewing one if needed.
    pub async fn bearer(&self) -> Result<String> {
        if let Some(token) = self.current().await {
            return Ok(token);
        }

        let _guard = self.refresh.lock().await;

        // another caller may have refreshed while this one waited
        if let Some(token) = self.current().await {
            return Ok(token);
        }

        let token = match self.exchange().await {
            Ok(token) => token,
            Err(e) => {
                // a failed exchange leaves no token behind
                *self.slot.write().await = None;
                return Err(e);
            }
        };
        let value = token.value.clone();
        *self.slot.write().await = Some(token);
        Ok(value)
    }

    /// Drops the current token. The next `bearer` call acquires a fresh one.
    /// Called when the remote service answers 401 despite a token that
    /// looked fresh locally.
    pub async fn invalidate(&self) {
        debug!("Dropping bearer token after remote rejection");
        *self.slot.write().await = None;
    }

    async fn current(&self) -> Option<String> {
        let slot = self.slot.read().await;
        slot.as_ref()
            .filter(|token| token.issued_at.elapsed() < self.safety_margin)
            .map(|token| token.value.clone())
    }

    async fn exchange(&self) -> Result<Token> {
        let creds = self
            .provider
            .credentials()
            .ok_or_else(|| TaxonomyError::invalid_credentials("no credentials configured"))?;

        debug!(url = %self.token_url, "Requesting bearer token");

        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(&creds.client_id, Some(&creds.client_secret))
            .form(&[
                ("grant_type", "client_credentials"),
                ("scope", self.scope.as_str()),
            ])
            .send()
            .await
            .map_err(|e| TaxonomyError::auth_transient(format!("token request failed: {e}")))?;

        let status = response.status();
        if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
            // 400/401/403 from the token endpoint mean the credentials or
            // scope are wrong and retrying cannot help
            let body = response.text().await.unwrap_or_default();
            return Err(TaxonomyError::invalid_credentials(format!(
                "token endpoint rejected the request ({status}): {body}"
            )));
        }
        if !status.is_success() {
            return Err(TaxonomyError::auth_transient(format!(
                "token endpoint returned {status}"
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| TaxonomyError::auth_transient(format!("malformed token response: {e}")))?;

        if parsed.access_token.is_empty() {
            return Err(TaxonomyError::invalid_credentials(
                "token response carried an empty access token",
            ));
        }

        info!(expires_in = ?parsed.expires_in, "Acquired bearer token");
        Ok(Token {
            value: parsed.access_token,
            issued_at: Instant::now(),
        })
    }
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("token_url", &self.token_url)
            .field("scope", &self.scope)
            .field("safety_margin", &self.safety_margin)
            .finish()
    }
}
