//! TIERED Loader
//!
//! Resolves a function id (optionally pinned to a version) into an invocable
//! handle. Concurrent loads of the same function share one resolution,
//! transient storage failures are retried with exponential backoff, and a
//! per-function circuit breaker stops hammering a failing backend.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod breaker;
pub mod cache;
pub mod config;
pub mod loader;
pub mod metrics;
pub mod retry;
pub mod runtime;

pub use breaker::{CircuitBreaker, CircuitBreakerState, CircuitState, Permit};
pub use cache::{CacheKey, HandleCache};
pub use config::LoaderConfig;
pub use loader::{HealthStatus, LoadReport, LoaderError, LoaderHealth, ResilientLoader};
pub use metrics::{CacheStats, LoaderMetrics};
pub use retry::RetryPolicy;
pub use runtime::{CodeRuntime, FunctionHandle, Invocable, TemplateRuntime};
