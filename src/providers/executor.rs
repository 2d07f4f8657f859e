//! Request executor
//!
//! Turns [`DriveRequest`]s into HTTP calls: fetches a bearer token from the
//! shared [`TokenCache`], builds the headers, dispatches through a
//! [`Transport`] and applies the retry policy.
//!
//! Retry policy:
//! - connection failures: bounded exponential backoff, then `TransientNetwork`
//! - `401` with a refreshable session: invalidate the token and retry once
//! - `401` with a fixed token: `Authentication`
//! - body over the request's response limit: `Integrity`, not retried
//! - everything else (including `404`) is returned to the caller untouched

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::auth::{AuthMode, TokenCache};
use super::http_retry::{calculate_delay, HttpRetryConfig};
use super::request::DriveRequest;
use super::{DriveError, Method};

/// Number of token refreshes a single request may trigger
const MAX_AUTH_REFRESHES: u32 = 1;

fn executor_log(msg: &str) {
    debug!(target: "drivevault::executor", "{}", msg);
}

/// A fully built HTTP request, ready for the wire
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: url::Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Largest response body the caller accepts
    pub max_body_bytes: Option<u64>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Raw HTTP response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum TransportError {
    /// Nothing usable came back from the server
    Connection(String),
    /// The server answered with more than `max_body_bytes`
    BodyTooLarge { limit: u64 },
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Connection(msg) => write!(f, "{}", msg),
            TransportError::BodyTooLarge { limit } => write!(f, "Response body exceeds limit of {} bytes", limit),
        }
    }
}

/// The network seam: production uses [`ReqwestTransport`]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// reqwest-backed transport
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(request_timeout: Duration, connect_timeout: Duration) -> Result<Self, DriveError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| DriveError::InvalidConfig(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self.client.request(request.method.as_reqwest(), request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| {
                TransportError::Connection(format!("{} {} failed: {}", request.method, request.url.path(), e))
            })?;

        let status = response.status().as_u16();
        let limit = request.max_body_bytes.unwrap_or(u64::MAX);
        if response.content_length().is_some_and(|length| length > limit) {
            return Err(TransportError::BodyTooLarge { limit });
        }

        // Declared length may be absent
        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| TransportError::Connection(format!("Response stream error: {}", e)))?;
            if body.len() as u64 + chunk.len() as u64 > limit {
                return Err(TransportError::BodyTooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(HttpResponse { status, body })
    }
}

/// Response handed back to callers of [`RequestExecutor::execute`]
#[derive(Debug, Clone)]
pub struct DriveResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub url: String,
}

impl DriveResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `404` is an ordinary "absent" answer, not an error
    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    pub fn error_for_status(self) -> Result<Self, DriveError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(DriveError::UnexpectedStatus {
                status: self.status,
                url: self.url,
            })
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, DriveError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| DriveError::ParseError(format!("Invalid response from {}: {}", self.url, e)))
    }
}

pub struct RequestExecutor {
    api_base: String,
    user_agent: String,
    tokens: Arc<TokenCache>,
    transport: Arc<dyn Transport>,
    retry: HttpRetryConfig,
}

impl RequestExecutor {
    pub fn new(
        api_base: impl Into<String>,
        tokens: Arc<TokenCache>,
        transport: Arc<dyn Transport>,
        retry: HttpRetryConfig,
    ) -> Self {
        Self {
            api_base: api_base.into(),
            user_agent: format!("drivevault/{}", env!("CARGO_PKG_VERSION")),
            tokens,
            transport,
            retry,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn tokens(&self) -> &Arc<TokenCache> {
        &self.tokens
    }

    fn build(&self, request: &DriveRequest, token: &str) -> Result<HttpRequest, DriveError> {
        let bearer = format!("Bearer {}", token);
        // Token must be a valid header value
        HeaderValue::from_str(&bearer)
            .map_err(|e| DriveError::Authentication(format!("Invalid characters in access token: {}", e)))?;

        let headers = vec![
            (CONTENT_TYPE.as_str().to_string(), request.content_type().as_str().to_string()),
            (AUTHORIZATION.as_str().to_string(), bearer),
            (USER_AGENT.as_str().to_string(), self.user_agent.clone()),
        ];

        let body = match request.method() {
            Method::Get | Method::Delete => None,
            Method::Put => request.body().map(|b| b.to_vec()),
        };

        Ok(HttpRequest {
            method: request.method(),
            url: request.url(&self.api_base, Some(token))?,
            headers,
            body,
            max_body_bytes: request.response_limit(),
        })
    }

    /// Execute a request with token handling and bounded retries
    pub async fn execute(&self, request: &DriveRequest) -> Result<DriveResponse, DriveError> {
        request.validate()?;

        let mut connection_failures: u32 = 0;
        let mut auth_refreshes: u32 = 0;

        loop {
            let token = self.tokens.get_token().await?;
            let http_request = self.build(request, token.expose_secret())?;
            let url = http_request.url.path().to_string();
            executor_log(&format!("Executing {}", request));

            let response = match self.transport.send(http_request).await {
                Ok(response) => response,
                Err(TransportError::BodyTooLarge { limit }) => {
                    return Err(DriveError::Integrity(format!(
                        "Response for {} is larger than {} bytes",
                        request, limit
                    )));
                }
                Err(e) => {
                    if connection_failures >= self.retry.max_retries {
                        return Err(DriveError::TransientNetwork(format!(
                            "{} (gave up after {} retries)",
                            e, connection_failures
                        )));
                    }
                    let delay = calculate_delay(connection_failures, &self.retry);
                    connection_failures += 1;
                    warn!(
                        "Connection error on {}: {}. Retry {}/{} after {:?}",
                        request, e, connection_failures, self.retry.max_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            executor_log(&format!("Received status {} for {}", response.status, request));

            if response.status == 401 {
                match self.tokens.auth_mode() {
                    AuthMode::FixedToken => {
                        return Err(DriveError::Authentication(
                            "Bearer token was rejected (401)".to_string(),
                        ));
                    }
                    AuthMode::Refreshable if auth_refreshes >= MAX_AUTH_REFRESHES => {
                        return Err(DriveError::Authentication(
                            "Refreshed bearer token was rejected again (401)".to_string(),
                        ));
                    }
                    AuthMode::Refreshable => {
                        auth_refreshes += 1;
                        warn!("Token rejected for {}, refreshing", request);
                        self.tokens.invalidate(&token).await;
                        continue;
                    }
                }
            }

            return Ok(DriveResponse {
                status: response.status,
                body: response.body,
                url,
            });
        }
    }
}
