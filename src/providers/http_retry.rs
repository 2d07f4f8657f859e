//! Bounded retry policy for drive requests.
//!
//! Connection-level failures are retried with exponential backoff and jitter
//! up to `max_retries` times. Status codes are never retried here: the
//! executor decides about `401` on its own and everything else is handed
//! back to the caller.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for HTTP retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpRetryConfig {
    /// Maximum number of retry attempts after a connection failure (default: 3)
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff (default: 1000)
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds (default: 30000)
    pub max_delay_ms: u64,
    /// Backoff multiplier (default: 2.0)
    pub backoff_multiplier: f64,
}

impl Default for HttpRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl HttpRetryConfig {
    /// Near-zero delays, for tests and local backends
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 1.0,
        }
    }
}

/// Calculate delay for a given retry attempt with jitter
pub fn calculate_delay(attempt: u32, config: &HttpRetryConfig) -> Duration {
    let base = config.base_delay_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let capped = base.min(config.max_delay_ms as f64);
    // 10-30% jitter
    let jitter = capped * (0.1 + rand::random::<f64>() * 0.2);
    Duration::from_millis((capped + jitter) as u64)
}

/// Whether a status/body pair is the flat listing endpoint's server-side timeout signal
pub fn is_timeout_signal(status: u16, body: &[u8]) -> bool {
    if status == 504 {
        return true;
    }
    status == 500
        && String::from_utf8_lossy(body)
            .to_ascii_lowercase()
            .contains("timeout")
}
