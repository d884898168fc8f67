//! Per-function circuit breaker.
//!
//! `closed --failure_threshold--> open --reset_timeout--> half-open`,
//! `half-open --success_threshold--> closed`, `half-open --failure--> open`.
//! The breaker is plain data; the loader keeps one per function id in a
//! sharded map and never holds the entry across an await point.

use crate::config::LoaderConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected without touching storage
    Open,
    /// A limited number of probe calls are admitted
    HalfOpen,
}

impl CircuitState {
    /// Wire name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Admitted while closed
    Normal,
    /// Admitted as one of the half-open probes
    Probe,
}

/// Serializable view of a breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerState {
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures while closed
    pub failure_count: u32,
    /// Successful probes while half-open
    pub success_count: u32,
    /// When the breaker last opened
    pub opened_at: Option<DateTime<Utc>>,
    /// When the last failure was recorded
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Circuit breaker for one function id
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    function_id: String,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    failure_threshold: u32,
    success_threshold: u32,
    max_half_open: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    /// Create a closed breaker
    #[must_use]
    pub fn new(function_id: impl Into<String>, config: &LoaderConfig) -> Self {
        Self {
            function_id: function_id.into(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_in_flight: 0,
            opened_at: None,
            opened_at_wall: None,
            last_failure_at: None,
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            max_half_open: config.max_half_open_requests.max(1),
            reset_timeout: config.reset_timeout(),
        }
    }

    /// State as last recorded, ignoring any elapsed reset timeout
    #[must_use]
    pub const fn state(&self) -> CircuitState {
        self.state
    }

    /// State as a caller arriving at `now` would see it
    #[must_use]
    pub fn state_at(&self, now: Instant) -> CircuitState {
        if self.state == CircuitState::Open && self.reset_elapsed(now) {
            CircuitState::HalfOpen
        } else {
            self.state
        }
    }

    fn reset_elapsed(&self, now: Instant) -> bool {
        self.opened_at
            .map_or(true, |opened| now.saturating_duration_since(opened) >= self.reset_timeout)
    }

    /// Ask to make a storage call.
    ///
    /// # Errors
    ///
    /// Returns the blocking state when the call must fail fast.
    pub fn try_acquire(&mut self, now: Instant) -> Result<Permit, CircuitState> {
        if self.state == CircuitState::Open {
            if !self.reset_elapsed(now) {
                return Err(CircuitState::Open);
            }
            self.transition(CircuitState::HalfOpen);
        }

        match self.state {
            CircuitState::Closed => Ok(Permit::Normal),
            CircuitState::HalfOpen => {
                if self.half_open_in_flight >= self.max_half_open {
                    Err(CircuitState::HalfOpen)
                } else {
                    self.half_open_in_flight += 1;
                    Ok(Permit::Probe)
                }
            }
            CircuitState::Open => Err(CircuitState::Open),
        }
    }

    /// Record a successful resolution
    pub fn on_success(&mut self, permit: Permit) {
        self.release(permit);
        match self.state {
            CircuitState::Closed => self.failure_count = 0,
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.success_threshold {
                    self.transition(CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Count a cache hit as a successful probe while half-open.
    ///
    /// Loads served from a handle cached by a probe never reach
    /// [`Self::try_acquire`].
    pub fn on_cache_hit(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.on_success(Permit::Normal);
        }
    }

    /// Record a failed resolution (retries exhausted)
    pub fn on_failure(&mut self, permit: Permit, now: Instant) {
        self.release(permit);
        self.last_failure_at = Some(Utc::now());
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.failure_threshold {
                    self.open(now);
                }
            }
            CircuitState::HalfOpen => self.open(now),
            CircuitState::Open => {}
        }
    }

    /// Give a permit back without recording an outcome
    pub fn release(&mut self, permit: Permit) {
        if permit == Permit::Probe && self.state == CircuitState::HalfOpen {
            self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Force the breaker closed with clean counters
    pub fn reset(&mut self) {
        self.transition(CircuitState::Closed);
        self.last_failure_at = None;
    }

    fn open(&mut self, now: Instant) {
        self.opened_at = Some(now);
        self.opened_at_wall = Some(Utc::now());
        self.transition(CircuitState::Open);
    }

    fn transition(&mut self, to: CircuitState) {
        let from = self.state;
        self.state = to;
        self.success_count = 0;
        self.half_open_in_flight = 0;
        if to == CircuitState::Closed {
            self.failure_count = 0;
            self.opened_at = None;
            self.opened_at_wall = None;
        }
        if from != to {
            tracing::info!(
                function_id = %self.function_id,
                from = %from,
                to = %to,
                "Circuit breaker transition"
            );
        }
    }

    /// Serializable snapshot
    #[must_use]
    pub fn snapshot(&self) -> CircuitBreakerState {
        CircuitBreakerState {
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            opened_at: self.opened_at_wall,
            last_failure_at: self.last_failure_at,
        }
    }
}
