//! Rate limit state management for coordinated backoff.
//!
//! When an LLM endpoint returns 429 (rate limited), every in-flight task
//! sharing that endpoint must back off globally to prevent hammering the
//! provider. This module provides shared state for coordinated rate
//! limiting across the planner, reranker, responder, and summarizer calls.

use std::time::{Duration, Instant};

/// Global rate limit state shared across all tasks bound to one endpoint.
#[derive(Debug)]
pub struct RateLimitState {
    /// When we can resume API calls (None = no active limit).
    pub backoff_until: Option<Instant>,
    /// Number of consecutive rate limit hits.
    pub consecutive_hits: u32,
    /// Last successful API call time.
    pub last_success: Option<Instant>,
    config: RateLimitConfig,
}

impl RateLimitState {
    /// Create a new rate limit state using default backoff bounds.
    pub fn new() -> Self {
        Self::with_config(RateLimitConfig::default())
    }

    /// Create a new rate limit state bound by `config`'s backoff bounds.
    pub fn with_config(config: RateLimitConfig) -> Self {
        Self {
            backoff_until: None,
            consecutive_hits: 0,
            last_success: None,
            config,
        }
    }

    /// Check if we are currently rate limited.
    pub fn is_rate_limited(&self) -> bool {
        self.backoff_until.map(|until| Instant::now() < until).unwrap_or(false)
    }

    /// Get remaining backoff duration if rate limited.
    pub fn remaining_backoff(&self) -> Option<Duration> {
        self.backoff_until.and_then(|until| {
            let now = Instant::now();
            if now < until { Some(until - now) } else { None }
        })
    }

    /// Record a rate limit response.
    ///
    /// Uses exponential backoff: the delay is the maximum of:
    /// - The API's suggested retry_after
    /// - `initial_backoff_secs * 2^(hits - 1)`, capped at `max_backoff_secs`
    pub fn record_rate_limit(&mut self, retry_after: Duration) {
        self.consecutive_hits += 1;

        let exponent = (self.consecutive_hits - 1).min(20);
        let exp_backoff_secs = self.config.initial_backoff_secs.saturating_mul(1u64 << exponent);
        let exp_backoff = Duration::from_secs(exp_backoff_secs.min(self.config.max_backoff_secs));

        // Use max of API's retry_after and our calculated delay
        let delay = retry_after.max(exp_backoff);

        self.backoff_until = Some(Instant::now() + delay);

        tracing::warn!(
            retry_after_secs = delay.as_secs(),
            consecutive_hits = self.consecutive_hits,
            "Rate limited, backing off globally"
        );
    }

    /// Record a successful API call.
    ///
    /// Resets the consecutive hit counter and clears the backoff.
    pub fn record_success(&mut self) {
        self.consecutive_hits = 0;
        self.backoff_until = None;
        self.last_success = Some(Instant::now());
    }

    /// Reset the rate limit state.
    pub fn reset(&mut self) {
        self.backoff_until = None;
        self.consecutive_hits = 0;
        // Keep last_success for metrics
    }

    /// Get time since last successful call.
    pub fn time_since_success(&self) -> Option<Duration> {
        self.last_success.map(|t| t.elapsed())
    }

    /// The soft cap on concurrent API calls this state's config was built with.
    pub fn max_concurrency(&self) -> usize {
        self.config.max_concurrent_api_calls
    }
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self::new()
    }
}

/// Rate limit configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Initial backoff on first rate limit (seconds).
    pub initial_backoff_secs: u64,
    /// Maximum backoff (seconds).
    pub max_backoff_secs: u64,
    /// How long to wait after backoff before resuming full speed.
    pub recovery_period_secs: u64,
    /// Max concurrent API calls (soft limit to prevent rate limits).
    pub max_concurrent_api_calls: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            initial_backoff_secs: 5,
            max_backoff_secs: 120,
            recovery_period_secs: 30,
            max_concurrent_api_calls: 10,
        }
    }
}

impl RateLimitConfig {
    /// Create config with custom values.
    pub fn new(
        initial_backoff_secs: u64,
        max_backoff_secs: u64,
        recovery_period_secs: u64,
        max_concurrent_api_calls: usize,
    ) -> Self {
        Self {
            initial_backoff_secs,
            max_backoff_secs,
            recovery_period_secs,
            max_concurrent_api_calls,
        }
    }
}
