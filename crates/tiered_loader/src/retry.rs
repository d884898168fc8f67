//! Exponential backoff schedule.

use crate::config::LoaderConfig;
use rand::Rng;
use std::time::Duration;

/// Retry policy for transient storage failures
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Cap on a single delay
    pub max_delay_ms: u64,
    /// Growth factor
    pub multiplier: f64,
    /// Randomise delays
    pub jitter: bool,
}

impl RetryPolicy {
    /// Build from loader config
    #[must_use]
    pub fn from_config(config: &LoaderConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay_ms: config.initial_delay_ms,
            max_delay_ms: config.max_delay_ms,
            multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }

    /// Deterministic delay before retry number `attempt` (0-based):
    /// `min(initial * multiplier^attempt, max)`.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Delay before retry number `attempt`, with jitter applied if enabled.
    ///
    /// Jittered delays fall in `[base/2, base]` so the cap still holds.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let millis = base.as_millis() as u64;
        let low = millis / 2;
        Duration::from_millis(rand::thread_rng().gen_range(low..=millis))
    }

    /// Whether another retry is allowed after `retries_done` retries
    #[must_use]
    pub const fn can_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&LoaderConfig::default())
    }
}
