//! Adaptive request pacing against the GitHub quota.
//!
//! Spaces requests by a base delay and widens the delay when the remaining
//! quota runs low, so a long enrichment run spreads its calls over the reset
//! window instead of hitting the wall. Backs off on rate-limit replies and
//! gradually recovers on success.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Configuration for pacing behavior.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Base delay between requests.
    pub base_delay: Duration,
    /// Maximum delay (ceiling for backoff).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff on rate limit.
    pub backoff_multiplier: f64,
    /// Multiplier for recovery on success (< 1.0 to decrease delay).
    pub recovery_multiplier: f64,
    /// Number of consecutive successes before reducing delay.
    pub recovery_threshold: u32,
    /// Remaining quota under which requests are spread over the reset window.
    pub low_water_mark: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            recovery_multiplier: 0.8,
            recovery_threshold: 5,
            low_water_mark: 100,
        }
    }
}

#[derive(Debug, Clone)]
struct QuotaState {
    current_delay: Duration,
    last_request: Option<Instant>,
    consecutive_successes: u32,
    in_backoff: bool,
    remaining: Option<u32>,
    reset_epoch: Option<i64>,
    total_requests: u64,
    rate_limit_hits: u64,
}

impl QuotaState {
    fn new(base_delay: Duration) -> Self {
        Self {
            current_delay: base_delay,
            last_request: None,
            consecutive_successes: 0,
            in_backoff: false,
            remaining: None,
            reset_epoch: None,
            total_requests: 0,
            rate_limit_hits: 0,
        }
    }

    fn time_until_ready(&self) -> Duration {
        match self.last_request {
            Some(last) => self.current_delay.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }
}

/// Snapshot of the limiter for logging.
#[derive(Debug, Clone)]
pub struct QuotaStats {
    pub current_delay: Duration,
    pub in_backoff: bool,
    pub remaining: Option<u32>,
    pub total_requests: u64,
    pub rate_limit_hits: u64,
}

/// Shared pacing state of one API host. Clones share state.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Arc<RwLock<QuotaState>>,
}

impl RateLimiter {
    /// Create a new rate limiter with default config.
    pub fn new() -> Self {
        Self::with_config(RateLimitConfig::default())
    }

    /// Create a new rate limiter with custom config.
    pub fn with_config(config: RateLimitConfig) -> Self {
        let state = QuotaState::new(config.base_delay);
        Self {
            config,
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Wait until the next request may go out, then mark it as started.
    pub async fn acquire(&self) {
        let wait = self.state.read().await.time_until_ready();
        if wait > Duration::ZERO {
            debug!("Pacing GitHub requests: waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }

        let mut state = self.state.write().await;
        state.last_request = Some(Instant::now());
        state.total_requests += 1;
    }

    /// Record the quota headers of a reply and re-derive the delay.
    pub async fn observe_quota(&self, remaining: Option<u32>, reset_epoch: Option<i64>) {
        let mut state = self.state.write().await;
        if remaining.is_some() {
            state.remaining = remaining;
        }
        if reset_epoch.is_some() {
            state.reset_epoch = reset_epoch;
        }

        let (Some(remaining), Some(reset)) = (state.remaining, state.reset_epoch) else {
            return;
        };
        if remaining >= self.config.low_water_mark || state.in_backoff {
            return;
        }

        let window = (reset - chrono::Utc::now().timestamp()).max(0) as u64;
        let spread = Duration::from_secs(window) / remaining.max(1);
        let delay = spread.clamp(self.config.base_delay, self.config.max_delay);
        if delay > state.current_delay {
            debug!(
                "Quota low ({} left, reset in {}s), spacing requests by {:?}",
                remaining, window, delay
            );
            state.current_delay = delay;
        }
    }

    /// Report a successful request; may decrease delay.
    pub async fn report_success(&self) {
        let mut state = self.state.write().await;
        state.consecutive_successes += 1;

        let quota_low = state
            .remaining
            .is_some_and(|r| r < self.config.low_water_mark);
        if state.consecutive_successes < self.config.recovery_threshold || quota_low {
            return;
        }

        let reduced = Duration::from_secs_f64(
            state.current_delay.as_secs_f64() * self.config.recovery_multiplier,
        );
        state.current_delay = reduced.max(self.config.base_delay);
        state.consecutive_successes = 0;

        if state.in_backoff && state.current_delay <= self.config.base_delay {
            state.in_backoff = false;
            info!("GitHub requests recovered from rate limit backoff");
        }
    }

    /// Report a rate-limit reply (403/429); increases delay.
    pub async fn report_rate_limit(&self, status_code: u16) {
        let mut state = self.state.write().await;
        state.rate_limit_hits += 1;
        state.consecutive_successes = 0;
        state.in_backoff = true;

        let widened = Duration::from_secs_f64(
            state.current_delay.max(Duration::from_millis(1)).as_secs_f64()
                * self.config.backoff_multiplier,
        );
        state.current_delay = widened.min(self.config.max_delay);

        warn!(
            "Rate limited by GitHub (HTTP {}), backing off to {:?}",
            status_code, state.current_delay
        );
    }

    pub async fn stats(&self) -> QuotaStats {
        let state = self.state.read().await;
        QuotaStats {
            current_delay: state.current_delay,
            in_backoff: state.in_backoff,
            remaining: state.remaining,
            total_requests: state.total_requests,
            rate_limit_hits: state.rate_limit_hits,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backoff_on_rate_limit() {
        let limiter = RateLimiter::with_config(RateLimitConfig {
            base_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            ..Default::default()
        });

        limiter.acquire().await;
        limiter.report_rate_limit(429).await;

        let stats = limiter.stats().await;
        assert!(stats.current_delay >= Duration::from_millis(200));
        assert!(stats.in_backoff);
        assert_eq!(stats.rate_limit_hits, 1);
        assert_eq!(stats.total_requests, 1);
    }

    #[tokio::test]
    async fn test_recovers_after_successes() {
        let limiter = RateLimiter::with_config(RateLimitConfig {
            base_delay: Duration::from_millis(10),
            recovery_multiplier: 0.1,
            recovery_threshold: 2,
            ..Default::default()
        });

        limiter.report_rate_limit(403).await;
        limiter.report_success().await;
        limiter.report_success().await;

        let stats = limiter.stats().await;
        assert!(!stats.in_backoff);
        assert_eq!(stats.current_delay, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_low_quota_spreads_requests() {
        let limiter = RateLimiter::with_config(RateLimitConfig {
            base_delay: Duration::ZERO,
            max_delay: Duration::from_secs(600),
            low_water_mark: 100,
            ..Default::default()
        });

        let reset = chrono::Utc::now().timestamp() + 1000;
        limiter.observe_quota(Some(4000), Some(reset)).await;
        assert_eq!(limiter.stats().await.current_delay, Duration::ZERO);

        limiter.observe_quota(Some(10), Some(reset)).await;
        let stats = limiter.stats().await;
        assert_eq!(stats.remaining, Some(10));
        // Roughly 1000s spread over 10 calls.
        assert!(stats.current_delay >= Duration::from_secs(90));
        assert!(stats.current_delay <= Duration::from_secs(100));
    }
}
