//! Bearer token handling
//!
//! The drive API authenticates every request with a bearer token. Tokens come
//! from a [`TokenSource`] collaborator: either a fixed token supplied from the
//! outside, or a refreshable OAuth2 session. [`TokenCache`] sits in front of
//! the source and is shared by every request in the process; refreshes are
//! single-flight, so concurrent callers that find the cache empty or stale
//! wait for the same refresh instead of each starting their own.

use async_trait::async_trait;
use oauth2::{basic::BasicClient, ClientId, ClientSecret, EndpointNotSet, EndpointSet, RefreshToken, TokenResponse, TokenUrl};
use secrecy::{ExposeSecret, SecretString};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use super::DriveError;

const REFRESH_TIMEOUT_SECS: u64 = 30;

/// OAuth2 client with only the token endpoint set (v5 typestates)
type RefreshClient = BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// How the token source reacts to a rejected token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Token handed in from outside; a 401 is final
    FixedToken,
    /// Session that can mint a new token after invalidation
    Refreshable,
}

/// An access token with optional expiry
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub secret: SecretString,
    pub expires_at: Option<i64>, // Unix timestamp
}

impl AccessToken {
    pub fn new(secret: impl Into<String>, expires_at: Option<i64>) -> Self {
        Self {
            secret: SecretString::from(secret.into()),
            expires_at,
        }
    }

    /// Check if token is expired (with 5 min buffer)
    pub fn is_expired(&self) -> bool {
        if let Some(expires_at) = self.expires_at {
            let now = chrono::Utc::now().timestamp();
            expires_at <= now + 300
        } else {
            false // No expiry = assume valid
        }
    }
}

/// Collaborator that hands out bearer tokens
#[async_trait]
pub trait TokenSource: Send + Sync {
    fn auth_mode(&self) -> AuthMode;

    /// Produce a token; called by the cache on a miss or after invalidation
    async fn fetch_token(&self) -> Result<AccessToken, DriveError>;
}

/// Externally supplied token that is never refreshed
pub struct StaticToken {
    token: SecretString,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
        }
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    fn auth_mode(&self) -> AuthMode {
        AuthMode::FixedToken
    }

    async fn fetch_token(&self) -> Result<AccessToken, DriveError> {
        Ok(AccessToken {
            secret: self.token.clone(),
            expires_at: None,
        })
    }
}

/// Token endpoint settings for a refreshable session
#[derive(Debug, Clone)]
pub struct OAuthRefreshConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub token_url: String,
}

/// Refreshable session backed by an OAuth2 refresh token
pub struct OAuth2RefreshSource {
    oauth: RefreshClient,
    http: RefreshHttpClient,
    refresh_token: Mutex<SecretString>,
}

impl OAuth2RefreshSource {
    pub fn new(config: OAuthRefreshConfig, refresh_token: impl Into<String>) -> Result<Self, DriveError> {
        let token_url = TokenUrl::new(config.token_url)
            .map_err(|e| DriveError::InvalidConfig(format!("Invalid token URL: {}", e)))?;
        let mut oauth = BasicClient::new(ClientId::new(config.client_id)).set_token_uri(token_url);
        if let Some(secret) = config.client_secret {
            oauth = oauth.set_client_secret(ClientSecret::new(secret));
        }

        // Token endpoints must answer directly, never via redirect
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(REFRESH_TIMEOUT_SECS))
            .build()
            .map_err(|e| DriveError::InvalidConfig(format!("Cannot build token client: {}", e)))?;

        Ok(Self {
            oauth,
            http: RefreshHttpClient { client },
            refresh_token: Mutex::new(SecretString::from(refresh_token.into())),
        })
    }
}

#[async_trait]
impl TokenSource for OAuth2RefreshSource {
    fn auth_mode(&self) -> AuthMode {
        AuthMode::Refreshable
    }

    async fn fetch_token(&self) -> Result<AccessToken, DriveError> {
        let mut refresh_token = self.refresh_token.lock().await;

        let token_result = self
            .oauth
            .exchange_refresh_token(&RefreshToken::new(refresh_token.expose_secret().to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| DriveError::Authentication(format!("Token refresh failed: {}", e)))?;

        let expires_at = token_result
            .expires_in()
            .map(|d| chrono::Utc::now().timestamp() + d.as_secs() as i64);

        // Keep the old refresh token if the server didn't rotate it
        if let Some(rotated) = token_result.refresh_token() {
            *refresh_token = SecretString::from(rotated.secret().clone());
        }

        info!("OAuth2 access token refreshed");
        Ok(AccessToken {
            secret: SecretString::from(token_result.access_token().secret().clone()),
            expires_at,
        })
    }
}

/// oauth2's `AsyncHttpClient` on top of the session's reqwest client
struct RefreshHttpClient {
    client: reqwest::Client,
}

impl<'c> oauth2::AsyncHttpClient<'c> for RefreshHttpClient {
    type Error = oauth2::HttpClientError<reqwest::Error>;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<oauth2::HttpResponse, Self::Error>> + Send + Sync + 'c>,
    >;

    fn call(&'c self, request: oauth2::HttpRequest) -> Self::Future {
        Box::pin(async move {
            let request = reqwest::Request::try_from(request)
                .map_err(|e| oauth2::HttpClientError::Other(e.to_string()))?;
            let response = self
                .client
                .execute(request)
                .await
                .map_err(|e| oauth2::HttpClientError::Other(e.to_string()))?;

            let status = response.status();
            let headers = response.headers().clone();
            let body = response
                .bytes()
                .await
                .map_err(|e| oauth2::HttpClientError::Other(e.to_string()))?;

            let mut http_response = http::Response::new(body.to_vec());
            *http_response.status_mut() = status;
            *http_response.headers_mut() = headers;
            Ok(http_response)
        })
    }
}

/// Process-wide token cache with single-flight refresh
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    cached: Mutex<Option<AccessToken>>,
    fetches: AtomicU64,
}

impl TokenCache {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
            fetches: AtomicU64::new(0),
        }
    }

    pub fn auth_mode(&self) -> AuthMode {
        self.source.auth_mode()
    }

    /// Current token, fetching a new one if the cache is empty or expired.
    ///
    /// The lock is held across the fetch: callers arriving during a refresh
    /// queue on it and then find the fresh token.
    pub async fn get_token(&self) -> Result<SecretString, DriveError> {
        let mut cached = self.cached.lock().await;
        if let Some(ref token) = *cached {
            if !token.is_expired() {
                return Ok(token.secret.clone());
            }
        }
        let fresh = self.source.fetch_token().await?;
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let secret = fresh.secret.clone();
        *cached = Some(fresh);
        Ok(secret)
    }

    /// Drop the cached token if it is still the one that was rejected.
    ///
    /// A token that was already replaced by a concurrent refresh stays put.
    pub async fn invalidate(&self, rejected: &SecretString) {
        let mut cached = self.cached.lock().await;
        let is_current = cached
            .as_ref()
            .map(|t| t.secret.expose_secret() == rejected.expose_secret())
            .unwrap_or(false);
        if is_current {
            *cached = None;
        }
    }

    /// Number of times the source has been asked for a token
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }
}
