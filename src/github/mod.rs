//! GitHub REST API access.
//!
//! Pipelines talk to GitHub through the [`GitHubApi`] trait so the HTTP
//! client can be swapped for a scripted fake in tests. [`GitHubClient`] is the
//! real implementation: bearer auth, conditional requests, adaptive pacing
//! and the retry/backoff loop of [`RetryPolicy`].

mod client;
pub mod payloads;
mod rate_limiter;
mod retry;

pub use client::GitHubClient;
pub use rate_limiter::{QuotaStats, RateLimitConfig, RateLimiter};
pub use retry::{ResponseClass, RetryPolicy};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Errors surfaced by the API client after its own retries are spent.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("rate limit exceeded for {endpoint}")]
    RateLimitExceeded { endpoint: String },
    #[error("transient failure for {endpoint} after retries: {message}")]
    TransientFetchFailure { endpoint: String, message: String },
    #[error("request failed with HTTP {status}: {body}")]
    FetchFailed { status: u16, body: String },
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl FetchError {
    /// Whether the error means "come back later" rather than "this entity is
    /// broken".
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, FetchError::RateLimitExceeded { .. })
    }

    /// Whether the resource does not exist (deleted repository, renamed user).
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::FetchFailed { status: 404, .. })
    }
}

/// A successful (2xx) response.
#[derive(Debug, Clone)]
pub struct FetchedPayload {
    /// Response body, JSON text.
    pub payload: String,
    pub etag: Option<String>,
    pub rate_limit_remaining: Option<u32>,
    /// `Link` header advertises a `rel="next"` page.
    pub has_next_page: bool,
}

/// Result of a conditional GET.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Fetched(FetchedPayload),
    /// 304: the resource did not change since the supplied ETag.
    NotModified,
}

/// Read access to the GitHub REST API.
#[async_trait]
pub trait GitHubApi: Send + Sync {
    /// GET `endpoint` (a path such as `/repos/rust-lang/rust`), sending
    /// `If-None-Match` when `etag` is given.
    async fn fetch(&self, endpoint: &str, etag: Option<&str>) -> Result<FetchOutcome, FetchError>;
}

/// Retry budget of the API client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, prefer::FromValue)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after a primary (quota exhausted) rate limit.
    pub primary_rate_limit_retries: u32,
    /// Retries after a secondary (abuse detection) rate limit.
    pub secondary_rate_limit_retries: u32,
    /// Retries after 5xx responses and network errors.
    pub server_error_retries: u32,
    /// Base of the exponential backoff, in milliseconds.
    pub backoff_base_ms: u64,
    /// Longest single rate-limit sleep, in seconds.
    pub max_rate_limit_wait_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            primary_rate_limit_retries: 2,
            secondary_rate_limit_retries: 1,
            server_error_retries: 3,
            backoff_base_ms: 1000,
            max_rate_limit_wait_secs: 900,
        }
    }
}
