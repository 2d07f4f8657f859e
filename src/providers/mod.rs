//! Drive API client
//!
//! This module talks to the drive REST service. Requests are described by
//! [`DriveRequest`], executed by [`RequestExecutor`] on top of a [`Transport`]
//! and authenticated through a shared [`TokenCache`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              RequestExecutor                │
//! │   headers, 401 handling, bounded retries    │
//! └─────────────────────────────────────────────┘
//!          │                         │
//!          ▼                         ▼
//!   ┌────────────┐          ┌─────────────────┐
//!   │ TokenCache │          │    Transport    │
//!   │ (single-   │          ├────────┬────────┤
//!   │  flight)   │          │reqwest │ memory │
//!   └────────────┘          └────────┴────────┘
//! ```

pub mod auth;
pub mod executor;
pub mod http_retry;
pub mod request;
pub mod types;

#[cfg(test)]
pub mod memory;

pub use auth::{AccessToken, AuthMode, OAuth2RefreshSource, OAuthRefreshConfig, StaticToken, TokenCache, TokenSource};
pub use executor::{DriveResponse, HttpRequest, HttpResponse, ReqwestTransport, RequestExecutor, Transport, TransportError};
pub use http_retry::HttpRetryConfig;
pub use request::{DriveRequest, RequestKind};
pub use types::*;
