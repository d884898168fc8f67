//! Loader configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tiered_core::Version;

/// Loader configuration
///
/// Deserialises from camelCase JSON; every field is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoaderConfig {
    /// Retries after the first attempt for transient failures
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay
    pub max_delay_ms: u64,
    /// Growth factor per attempt
    pub backoff_multiplier: f64,
    /// Randomise each delay in `[delay/2, delay]`
    pub jitter: bool,
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Time an open breaker waits before probing
    pub reset_timeout_ms: u64,
    /// Successful probes needed to close a half-open breaker
    pub success_threshold: u32,
    /// Concurrent probes admitted while half-open
    pub max_half_open_requests: u32,
    /// Lifetime of a cached handle
    pub cache_ttl_ms: u64,
    /// Version served, flagged as degraded, when the requested one fails
    pub fallback_version: Option<Version>,
}

impl LoaderConfig {
    /// Create a config with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set retry count
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set backoff parameters
    #[must_use]
    pub fn with_backoff(mut self, initial_delay_ms: u64, max_delay_ms: u64, multiplier: f64) -> Self {
        self.initial_delay_ms = initial_delay_ms;
        self.max_delay_ms = max_delay_ms;
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set breaker thresholds
    #[must_use]
    pub fn with_breaker(mut self, failure_threshold: u32, reset_timeout_ms: u64, success_threshold: u32) -> Self {
        self.failure_threshold = failure_threshold;
        self.reset_timeout_ms = reset_timeout_ms;
        self.success_threshold = success_threshold;
        self
    }

    /// Set half-open probe limit
    #[must_use]
    pub fn with_max_half_open_requests(mut self, max: u32) -> Self {
        self.max_half_open_requests = max;
        self
    }

    /// Set cache TTL
    #[must_use]
    pub fn with_cache_ttl(mut self, ttl_ms: u64) -> Self {
        self.cache_ttl_ms = ttl_ms;
        self
    }

    /// Set the degradation fallback version
    #[must_use]
    pub fn with_fallback_version(mut self, version: Version) -> Self {
        self.fallback_version = Some(version);
        self
    }

    /// Cache TTL as a duration
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    /// Breaker reset timeout as a duration
    #[must_use]
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter: true,
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            success_threshold: 2,
            max_half_open_requests: 1,
            cache_ttl_ms: 60_000,
            fallback_version: None,
        }
    }
}
