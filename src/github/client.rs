//! HTTP client for the GitHub REST API with ETag and conditional request
//! support.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Instant;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{ACCEPT, IF_NONE_MATCH};
use reqwest::Client;
use tracing::debug;

use super::rate_limiter::RateLimiter;
use super::retry::{RawResponse, RetryPolicy};
use super::{FetchError, FetchOutcome, FetchedPayload, GitHubApi};
use crate::config::Settings;

const GITHUB_API_VERSION: &str = "2022-11-28";

/// GitHub API client backed by reqwest.
#[derive(Clone)]
pub struct GitHubClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    rate_limiter: RateLimiter,
    policy: RetryPolicy,
}

impl GitHubClient {
    /// Create a client from settings (base URL, token, timeout, retry budget).
    pub fn new(settings: &Settings) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(&settings.user_agent)
            .timeout(settings.request_timeout())
            .gzip(true)
            .brotli(true)
            .build()?;

        Ok(Self {
            client,
            base_url: settings.api_base_url.trim_end_matches('/').to_string(),
            token: settings.github_token.clone(),
            rate_limiter: RateLimiter::new(),
            policy: RetryPolicy::new(settings.retry.clone()),
        })
    }

    /// Use a shared (or custom-configured) rate limiter.
    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    /// Get the rate limiter for this client.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    fn url_for(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
        }
    }

    /// One attempt: pace, send, and report the reply to the limiter.
    async fn send_once(
        &self,
        url: &str,
        etag: Option<&str>,
    ) -> Result<RawResponse, reqwest::Error> {
        self.rate_limiter.acquire().await;

        let mut request = self
            .client
            .get(url)
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let start = Instant::now();
        let response = request.send().await?;
        let status = response.status().as_u16();

        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), v.to_string());
            }
        }
        let body = response.text().await?;
        debug!("GET {} -> {} in {:?}", url, status, start.elapsed());

        let remaining = headers
            .get("x-ratelimit-remaining")
            .and_then(|v| v.parse::<u32>().ok());
        let reset = headers
            .get("x-ratelimit-reset")
            .and_then(|v| v.parse::<i64>().ok());
        self.rate_limiter.observe_quota(remaining, reset).await;

        if status == 403 || status == 429 {
            self.rate_limiter.report_rate_limit(status).await;
        } else if (200..300).contains(&status) || status == 304 {
            self.rate_limiter.report_success().await;
        }

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl GitHubApi for GitHubClient {
    async fn fetch(&self, endpoint: &str, etag: Option<&str>) -> Result<FetchOutcome, FetchError> {
        let url = self.url_for(endpoint);
        let response = self
            .policy
            .execute(endpoint, || self.send_once(&url, etag))
            .await?;

        if response.status == 304 {
            return Ok(FetchOutcome::NotModified);
        }

        Ok(FetchOutcome::Fetched(FetchedPayload {
            etag: response.header("etag").map(str::to_string),
            rate_limit_remaining: response
                .header("x-ratelimit-remaining")
                .and_then(|v| v.parse().ok()),
            has_next_page: response.header("link").and_then(next_page_url).is_some(),
            payload: response.body,
        }))
    }
}

/// Target of the `rel="next"` entry of a `Link` header.
pub fn next_page_url(link_header: &str) -> Option<String> {
    static NEXT: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = NEXT
        .get_or_init(|| Regex::new(r#"<([^>]+)>\s*;\s*rel="next""#).ok())
        .as_ref()?;
    pattern
        .captures(link_header)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}
