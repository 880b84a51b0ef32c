//! Response classification and the retry/backoff loop.
//!
//! GitHub signals two kinds of rate limiting. The primary limit is the hourly
//! quota (`x-ratelimit-remaining: 0`, wait until `x-ratelimit-reset`). The
//! secondary limit is abuse detection (`retry-after`, or a 403 whose body
//! mentions it). Each has its own retry budget; 5xx and network errors share
//! an exponential backoff budget.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use super::{FetchError, RetryConfig};

/// Fallback wait when a rate-limit reply carries no usable hint.
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

/// One HTTP reply, reduced to what classification needs.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    /// Header names lowercased.
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|s| s.as_str())
    }

    fn header_number(&self, name: &str) -> Option<i64> {
        self.header(name).and_then(|v| v.trim().parse().ok())
    }
}

/// What a reply means for the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    NotModified,
    PrimaryRateLimit(Duration),
    SecondaryRateLimit(Duration),
    ServerError,
    Permanent,
}

/// Retry policy shared by every request of a client.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Classify a reply. `now_epoch` is the current Unix time, used against
    /// `x-ratelimit-reset`.
    pub fn classify(&self, response: &RawResponse, now_epoch: i64) -> ResponseClass {
        match response.status {
            304 => ResponseClass::NotModified,
            200..=299 => ResponseClass::Success,
            403 | 429 => {
                let retry_after = response
                    .header_number("retry-after")
                    .map(|secs| Duration::from_secs(secs.max(0) as u64));

                if response.header_number("x-ratelimit-remaining") == Some(0) {
                    let until_reset = response
                        .header_number("x-ratelimit-reset")
                        .map(|reset| Duration::from_secs((reset - now_epoch).max(0) as u64));
                    let wait = until_reset.or(retry_after).unwrap_or(DEFAULT_RATE_LIMIT_WAIT);
                    return ResponseClass::PrimaryRateLimit(self.cap_wait(wait));
                }

                let mentions_secondary = response
                    .body
                    .to_ascii_lowercase()
                    .contains("secondary rate limit");
                if retry_after.is_some() || mentions_secondary || response.status == 429 {
                    let wait = retry_after.unwrap_or(DEFAULT_RATE_LIMIT_WAIT);
                    return ResponseClass::SecondaryRateLimit(self.cap_wait(wait));
                }

                ResponseClass::Permanent
            }
            500..=599 => ResponseClass::ServerError,
            _ => ResponseClass::Permanent,
        }
    }

    /// Exponential backoff for the given (zero-based) transient retry.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.config.backoff_base_ms.saturating_mul(factor))
    }

    fn cap_wait(&self, wait: Duration) -> Duration {
        wait.min(Duration::from_secs(self.config.max_rate_limit_wait_secs))
    }

    /// Drive `send` until it yields a 2xx/304 reply or a budget runs out.
    pub async fn execute<F, Fut, E>(
        &self,
        endpoint: &str,
        mut send: F,
    ) -> Result<RawResponse, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<RawResponse, E>>,
        E: Display,
    {
        let mut primary_retries = 0;
        let mut secondary_retries = 0;
        let mut transient_retries = 0;

        loop {
            let response = match send().await {
                Ok(response) => response,
                Err(err) => {
                    if transient_retries >= self.config.server_error_retries {
                        return Err(FetchError::TransientFetchFailure {
                            endpoint: endpoint.to_string(),
                            message: err.to_string(),
                        });
                    }
                    let delay = self.backoff(transient_retries);
                    transient_retries += 1;
                    debug!("Request to {} failed ({}), retrying in {:?}", endpoint, err, delay);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            match self.classify(&response, chrono::Utc::now().timestamp()) {
                ResponseClass::Success | ResponseClass::NotModified => return Ok(response),
                ResponseClass::PrimaryRateLimit(wait) => {
                    if primary_retries >= self.config.primary_rate_limit_retries {
                        return Err(FetchError::RateLimitExceeded {
                            endpoint: endpoint.to_string(),
                        });
                    }
                    primary_retries += 1;
                    warn!("Primary rate limit hit on {}, sleeping {:?}", endpoint, wait);
                    tokio::time::sleep(wait).await;
                }
                ResponseClass::SecondaryRateLimit(wait) => {
                    if secondary_retries >= self.config.secondary_rate_limit_retries {
                        return Err(FetchError::RateLimitExceeded {
                            endpoint: endpoint.to_string(),
                        });
                    }
                    secondary_retries += 1;
                    warn!("Secondary rate limit hit on {}, sleeping {:?}", endpoint, wait);
                    tokio::time::sleep(wait).await;
                }
                ResponseClass::ServerError => {
                    if transient_retries >= self.config.server_error_retries {
                        return Err(FetchError::TransientFetchFailure {
                            endpoint: endpoint.to_string(),
                            message: format!("HTTP {}", response.status),
                        });
                    }
                    let delay = self.backoff(transient_retries);
                    transient_retries += 1;
                    debug!(
                        "HTTP {} from {}, retrying in {:?}",
                        response.status, endpoint, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                ResponseClass::Permanent => {
                    return Err(FetchError::FetchFailed {
                        status: response.status,
                        body: response.body,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn instant_policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            backoff_base_ms: 0,
            max_rate_limit_wait_secs: 0,
            ..Default::default()
        })
    }

    fn response(status: u16, headers: &[(&str, &str)], body: &str) -> RawResponse {
        RawResponse {
            status,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: body.to_string(),
        }
    }

    #[test]
    fn test_classify() {
        let policy = RetryPolicy::new(RetryConfig::default());
        let now = 1_700_000_000;

        assert_eq!(policy.classify(&response(200, &[], "{}"), now), ResponseClass::Success);
        assert_eq!(policy.classify(&response(304, &[], ""), now), ResponseClass::NotModified);
        assert_eq!(
            policy.classify(
                &response(
                    403,
                    &[("x-ratelimit-remaining", "0"), ("x-ratelimit-reset", "1700000042")],
                    "",
                ),
                now
            ),
            ResponseClass::PrimaryRateLimit(Duration::from_secs(42))
        );
        assert_eq!(
            policy.classify(&response(403, &[("retry-after", "5")], ""), now),
            ResponseClass::SecondaryRateLimit(Duration::from_secs(5))
        );
        assert_eq!(
            policy.classify(
                &response(403, &[], "You have exceeded a secondary rate limit"),
                now
            ),
            ResponseClass::SecondaryRateLimit(DEFAULT_RATE_LIMIT_WAIT)
        );
        assert_eq!(
            policy.classify(&response(403, &[], "Resource not accessible"), now),
            ResponseClass::Permanent
        );
        assert_eq!(policy.classify(&response(502, &[], ""), now), ResponseClass::ServerError);
        assert_eq!(policy.classify(&response(404, &[], ""), now), ResponseClass::Permanent);
    }

    #[test]
    fn test_waits_are_capped() {
        let policy = RetryPolicy::new(RetryConfig {
            max_rate_limit_wait_secs: 10,
            ..Default::default()
        });
        assert_eq!(
            policy.classify(&response(429, &[("retry-after", "3600")], ""), 0),
            ResponseClass::SecondaryRateLimit(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(RetryConfig::default());
        assert_eq!(policy.backoff(0), Duration::from_millis(1000));
        assert_eq!(policy.backoff(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff(3), Duration::from_millis(8000));
    }

    async fn run_script(policy: &RetryPolicy, script: Vec<RawResponse>) -> (Result<RawResponse, FetchError>, u32) {
        let calls = Arc::new(AtomicU32::new(0));
        let script = Arc::new(script);
        let result = policy
            .execute("/test", || {
                let calls = calls.clone();
                let script = script.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) as usize;
                    let reply = script.get(n).or(script.last()).cloned();
                    reply.ok_or_else(|| "empty script".to_string())
                }
            })
            .await;
        (result, calls.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_primary_limit_budget() {
        let exhausted = response(403, &[("x-ratelimit-remaining", "0")], "");
        let (result, calls) = run_script(&instant_policy(), vec![exhausted]).await;
        assert!(matches!(result, Err(FetchError::RateLimitExceeded { .. })));
        // One try plus two retries.
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_secondary_limit_budget() {
        let limited = response(403, &[("retry-after", "1")], "");
        let (result, calls) = run_script(&instant_policy(), vec![limited]).await;
        assert!(matches!(result, Err(FetchError::RateLimitExceeded { .. })));
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn test_server_errors_then_success() {
        let script = vec![
            response(502, &[], ""),
            response(503, &[], ""),
            response(200, &[], "{\"ok\":true}"),
        ];
        let (result, calls) = run_script(&instant_policy(), script).await;
        assert_eq!(result.unwrap().body, "{\"ok\":true}");
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_server_error_budget() {
        let (result, calls) = run_script(&instant_policy(), vec![response(500, &[], "")]).await;
        assert!(matches!(result, Err(FetchError::TransientFetchFailure { .. })));
        assert_eq!(calls, 4);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_immediate() {
        let (result, calls) =
            run_script(&instant_policy(), vec![response(404, &[], "Not Found")]).await;
        match result {
            Err(FetchError::FetchFailed { status, body }) => {
                assert_eq!(status, 404);
                assert_eq!(body, "Not Found");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(calls, 1);
    }
}
