//! Bearer token management for the liveness API.
//!
//! The [`TokenManager`] caches an app access token and refreshes it when it is
//! within [`REFRESH_MARGIN`] of expiry, or unconditionally when a probe reports
//! that the server no longer accepts it.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// Tokens closer than this to expiry are refreshed before use
pub const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Lifetime assumed when the token endpoint does not report one
pub const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Error type for token acquisition
#[derive(Debug, Error)]
pub enum TokenError {
    /// Token endpoint unreachable
    #[error("Token endpoint unreachable: {0}")]
    AuthFetch(String),

    /// Token endpoint rejected the request
    #[error("Token endpoint returned status {0}")]
    Status(u16),

    /// Token endpoint answered with an unexpected body
    #[error("Failed to decode token response: {0}")]
    Decode(String),
}

/// Body returned by the token endpoint
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// An access token with its expiry
#[derive(Clone, PartialEq)]
pub struct Credential {
    pub token: String,
    pub expires_at: Instant,
}

impl Credential {
    pub fn from_grant(grant: TokenGrant, now: Instant) -> Self {
        let lifetime = grant.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        Self {
            token: grant.access_token,
            expires_at: now + Duration::from_secs(lifetime),
        }
    }

    /// True if the remaining lifetime exceeds [`REFRESH_MARGIN`]
    pub fn is_fresh_at(&self, now: Instant) -> bool {
        self.expires_at.saturating_duration_since(now) > REFRESH_MARGIN
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of fresh tokens
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch(&self) -> Result<TokenGrant, TokenError>;
}

/// Client-credentials grant against the Twitch token endpoint
pub struct HelixTokenFetcher {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl HelixTokenFetcher {
    pub fn new(
        client: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

#[async_trait]
impl TokenFetcher for HelixTokenFetcher {
    async fn fetch(&self) -> Result<TokenGrant, TokenError> {
        let response = self
            .client
            .post(&self.token_url)
            .query(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| TokenError::AuthFetch(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TokenError::Status(status.as_u16()));
        }

        response
            .json::<TokenGrant>()
            .await
            .map_err(|e| TokenError::Decode(e.to_string()))
    }
}

/// Owns the current credential. Cheap to share behind an `Arc`.
pub struct TokenManager {
    fetcher: Arc<dyn TokenFetcher>,
    current: Mutex<Option<Credential>>,
}

impl TokenManager {
    pub fn new(fetcher: Arc<dyn TokenFetcher>) -> Self {
        Self {
            fetcher,
            current: Mutex::new(None),
        }
    }

    /// Return the held credential if it is fresh, otherwise fetch a new one.
    pub async fn ensure_valid_token(&self) -> Result<Credential, TokenError> {
        let mut current = self.current.lock().await;
        if let Some(credential) = current.as_ref() {
            if credential.is_fresh_at(Instant::now()) {
                return Ok(credential.clone());
            }
            debug!("Access token near expiry, refreshing");
        }

        let credential = self.fetch_locked().await?;
        *current = Some(credential.clone());
        Ok(credential)
    }

    /// Replace `stale` with a newly fetched credential regardless of its expiry.
    ///
    /// If another task already replaced `stale`, its replacement is returned
    /// without a second fetch.
    pub async fn force_refresh(&self, stale: &Credential) -> Result<Credential, TokenError> {
        let mut current = self.current.lock().await;
        if let Some(credential) = current.as_ref() {
            if credential.token != stale.token {
                return Ok(credential.clone());
            }
        }

        info!("Forcing access token refresh");
        let credential = self.fetch_locked().await?;
        *current = Some(credential.clone());
        Ok(credential)
    }

    /// Drop the held credential so the next call fetches a new one.
    pub async fn invalidate(&self) {
        self.current.lock().await.take();
    }

    async fn fetch_locked(&self) -> Result<Credential, TokenError> {
        let grant = self.fetcher.fetch().await?;
        Ok(Credential::from_grant(grant, Instant::now()))
    }
}
