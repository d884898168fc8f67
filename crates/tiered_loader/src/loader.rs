//! Resilient function loader.
//!
//! A load walks: cache, coalescing, breaker gate, resolve with retry, then
//! optional degradation to the configured fallback version. Resolution runs
//! in a spawned task shared by every concurrent caller of the same key, so a
//! caller that gives up never cancels work other callers are waiting on.

use crate::breaker::{CircuitBreaker, CircuitBreakerState, CircuitState};
use crate::cache::{CacheKey, HandleCache};
use crate::config::LoaderConfig;
use crate::metrics::{CacheStats, LoaderMetrics, MetricsRecorder};
use crate::retry::RetryPolicy;
use crate::runtime::{CodeRuntime, FunctionHandle};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tiered_core::{CoreError, CoreResult, Version};
use tiered_registry::FunctionStore;
use tokio::time::Instant;

/// Load failure with the context needed to diagnose it from any caller
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{error}")]
pub struct LoaderError {
    /// Underlying error
    pub error: CoreError,
    /// Retries performed by the shared resolution
    pub retry_count: u32,
    /// Breaker state when the load failed
    pub circuit_state: CircuitState,
    /// Whether this caller joined a resolution started by another caller
    pub is_coalesced_request: bool,
}

impl LoaderError {
    /// Create an error seen by the originating caller
    #[must_use]
    pub fn new(error: CoreError, retry_count: u32, circuit_state: CircuitState) -> Self {
        Self {
            error,
            retry_count,
            circuit_state,
            is_coalesced_request: false,
        }
    }

    /// HTTP-convention status of the underlying error
    #[must_use]
    pub fn status_code(&self) -> u16 {
        self.error.status_code()
    }
}

impl From<LoaderError> for CoreError {
    fn from(err: LoaderError) -> Self {
        err.error
    }
}

/// Non-throwing load outcome
#[derive(Debug, Clone)]
pub struct LoadReport {
    /// Resolved handle on success
    pub handle: Option<Arc<FunctionHandle>>,
    /// Whether a handle was produced
    pub success: bool,
    /// Served from cache without touching storage
    pub from_cache: bool,
    /// Wall time spent in the load
    pub load_time_ms: u64,
    /// Retries performed
    pub retry_count: u32,
    /// Served from the fallback version
    pub degraded: bool,
    /// Why the result is degraded
    pub degradation_reason: Option<String>,
    /// Failure, if any
    pub error: Option<LoaderError>,
}

/// Overall loader health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every breaker is closed
    Healthy,
    /// At least one breaker is open or probing
    Degraded,
}

/// Health report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoaderHealth {
    /// Summary status
    pub status: HealthStatus,
    /// Function ids with an open breaker
    pub open_circuits: Vec<String>,
    /// Function ids with a half-open breaker
    pub half_open_circuits: Vec<String>,
    /// Cached handles
    pub cache_entries: usize,
    /// Resolutions currently in flight
    pub in_flight: usize,
}

#[derive(Debug, Clone)]
struct Resolved {
    handle: Arc<FunctionHandle>,
    retry_count: u32,
    degradation_reason: Option<String>,
}

#[derive(Debug)]
struct Loaded {
    resolved: Resolved,
    from_cache: bool,
}

type SharedLoad = Shared<BoxFuture<'static, Result<Resolved, LoaderError>>>;

struct LoaderInner {
    store: Arc<dyn FunctionStore>,
    runtime: Arc<dyn CodeRuntime>,
    config: LoaderConfig,
    retry: RetryPolicy,
    breakers: DashMap<String, CircuitBreaker>,
    cache: HandleCache,
    inflight: Mutex<HashMap<CacheKey, SharedLoad>>,
    generations: DashMap<String, u64>,
    pins: DashMap<String, Version>,
    metrics: MetricsRecorder,
}

/// Resilient function loader
///
/// Cheap to clone; clones share breakers, cache and metrics.
#[derive(Clone)]
pub struct ResilientLoader {
    inner: Arc<LoaderInner>,
}

impl ResilientLoader {
    /// Create a loader over a store and a code runtime
    #[must_use]
    pub fn new(
        store: Arc<dyn FunctionStore>,
        runtime: Arc<dyn CodeRuntime>,
        config: LoaderConfig,
    ) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                store,
                runtime,
                retry: RetryPolicy::from_config(&config),
                cache: HandleCache::new(config.cache_ttl()),
                breakers: DashMap::new(),
                inflight: Mutex::new(HashMap::new()),
                generations: DashMap::new(),
                pins: DashMap::new(),
                metrics: MetricsRecorder::default(),
                config,
            }),
        }
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    /// Resolve a function into an invocable handle.
    ///
    /// `version: None` means the current version, or the rolled-back version
    /// if a rollback pinned one.
    ///
    /// # Errors
    ///
    /// `NotFound` and `Compile` fail without retry; `CircuitOpen` fails
    /// without contacting storage; transient storage errors surface only
    /// after retries are exhausted.
    pub async fn load(
        &self,
        id: &str,
        version: Option<Version>,
    ) -> Result<Arc<FunctionHandle>, LoaderError> {
        self.load_inner(id, version, None)
            .await
            .map(|loaded| loaded.resolved.handle)
    }

    /// Resolve an exact version
    ///
    /// # Errors
    ///
    /// Same as [`Self::load`].
    pub async fn load_version(
        &self,
        id: &str,
        version: Version,
    ) -> Result<Arc<FunctionHandle>, LoaderError> {
        self.load(id, Some(version)).await
    }

    /// Resolve a function, giving up after `timeout`.
    ///
    /// If this call starts the resolution, backoff sleeps that would overrun
    /// the deadline are skipped and the resolution fails instead.
    ///
    /// # Errors
    ///
    /// Same as [`Self::load`], plus `DeadlineExceeded`.
    pub async fn load_with_deadline(
        &self,
        id: &str,
        version: Option<Version>,
        timeout: Duration,
    ) -> Result<Arc<FunctionHandle>, LoaderError> {
        let deadline = Instant::now() + timeout;
        self.load_inner(id, version, Some(deadline))
            .await
            .map(|loaded| loaded.resolved.handle)
    }

    /// Resolve a function and report diagnostics instead of failing
    pub async fn load_with_result(&self, id: &str, version: Option<Version>) -> LoadReport {
        self.report(id, version, None).await
    }

    /// [`Self::load_with_result`] bounded by `deadline`; an overrun is
    /// reported as `DeadlineExceeded`
    pub async fn load_with_result_until(
        &self,
        id: &str,
        version: Option<Version>,
        deadline: Instant,
    ) -> LoadReport {
        self.report(id, version, Some(deadline)).await
    }

    async fn report(
        &self,
        id: &str,
        version: Option<Version>,
        deadline: Option<Instant>,
    ) -> LoadReport {
        let started = Instant::now();
        let outcome = self.load_inner(id, version, deadline).await;
        let load_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(Loaded {
                resolved,
                from_cache,
            }) => LoadReport {
                handle: Some(resolved.handle),
                success: true,
                from_cache,
                load_time_ms,
                retry_count: resolved.retry_count,
                degraded: resolved.degradation_reason.is_some(),
                degradation_reason: resolved.degradation_reason,
                error: None,
            },
            Err(error) => LoadReport {
                handle: None,
                success: false,
                from_cache: false,
                load_time_ms,
                retry_count: error.retry_count,
                degraded: false,
                degradation_reason: None,
                error: Some(error),
            },
        }
    }

    async fn load_inner(
        &self,
        id: &str,
        version: Option<Version>,
        deadline: Option<Instant>,
    ) -> Result<Loaded, LoaderError> {
        let inner = &self.inner;
        inner.metrics.record_load();

        let version = version.or_else(|| inner.pins.get(id).map(|pin| pin.value().clone()));
        let key = CacheKey::new(id, version);

        if let Some(handle) = inner.cache.get(&key, Instant::now()) {
            tracing::debug!(function_id = %id, key = %key, "Loader cache hit");
            if let Some(mut breaker) = inner.breakers.get_mut(id) {
                breaker.on_cache_hit();
            }
            inner.metrics.record_cache_hit();
            inner.metrics.record_success();
            return Ok(Loaded {
                resolved: Resolved {
                    handle,
                    retry_count: 0,
                    degradation_reason: None,
                },
                from_cache: true,
            });
        }
        inner.metrics.record_cache_miss();

        let (shared, coalesced) = self.join_or_start(key, deadline);
        let outcome = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, shared).await {
                Ok(outcome) => outcome,
                Err(_) => Err(LoaderError::new(
                    CoreError::DeadlineExceeded { id: id.to_string() },
                    0,
                    inner.breaker_state(id),
                )),
            },
            None => shared.await,
        };

        match outcome {
            Ok(resolved) => {
                inner.metrics.record_success();
                if resolved.degradation_reason.is_some() {
                    inner.metrics.record_degraded();
                }
                Ok(Loaded {
                    resolved,
                    from_cache: false,
                })
            }
            Err(mut error) => {
                inner.metrics.record_failure();
                error.is_coalesced_request = coalesced;
                Err(error)
            }
        }
    }

    fn join_or_start(&self, key: CacheKey, deadline: Option<Instant>) -> (SharedLoad, bool) {
        let mut inflight = self
            .inner
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = inflight.get(&key) {
            tracing::debug!(key = %key, "Joining in-flight load");
            self.inner.metrics.record_coalesced();
            return (existing.clone(), true);
        }

        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let generation = inner.generation(&key.id);
        let task = tokio::spawn(async move {
            let outcome = inner.resolve(&task_key, deadline).await;
            let mut inflight = inner.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            // Invalidation already dropped this load's in-flight entry and
            // may have let a newer load take the key.
            if inner.generation(&task_key.id) != generation {
                tracing::debug!(key = %task_key, "Discarding load that raced an invalidation");
                return outcome;
            }
            if let Ok(resolved) = &outcome {
                if resolved.degradation_reason.is_none() {
                    inner
                        .cache
                        .insert(task_key.clone(), Arc::clone(&resolved.handle), Instant::now());
                }
            }
            inflight.remove(&task_key);
            outcome
        });

        let id = key.id.clone();
        let shared = async move {
            task.await.unwrap_or_else(|join_error| {
                Err(LoaderError::new(
                    CoreError::Execution {
                        message: format!("load task for {id} failed: {join_error}"),
                    },
                    0,
                    CircuitState::Closed,
                ))
            })
        }
        .boxed()
        .shared();

        inflight.insert(key, shared.clone());
        (shared, false)
    }

    /// Drop cached handles for every version of `id`.
    ///
    /// Loads of `id` already in flight still answer their callers, but they
    /// no longer accept joiners and their handles are not cached.
    pub fn invalidate(&self, id: &str) -> usize {
        let mut inflight = self
            .inner
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *self.inner.generations.entry(id.to_string()).or_insert(0) += 1;
        inflight.retain(|key, _| key.id != id);
        let removed = self.inner.cache.invalidate(id);
        drop(inflight);

        tracing::debug!(function_id = %id, removed, "Invalidated cached handles");
        removed
    }

    /// Serve `version` for `id` from now on.
    ///
    /// Resets the breaker, drops cached handles, resolves `version` and pins
    /// it so loads without a version get it.
    ///
    /// # Errors
    ///
    /// Fails like [`Self::load`] if `version` cannot be resolved; the pin is
    /// only set on success.
    pub async fn rollback(
        &self,
        id: &str,
        version: Version,
    ) -> Result<Arc<FunctionHandle>, LoaderError> {
        self.reset_circuit_breaker(id);
        self.invalidate(id);

        let handle = self.load(id, Some(version.clone())).await?;
        tracing::info!(function_id = %id, version = %version, "Rolled back function");
        self.inner.pins.insert(id.to_string(), version);
        self.inner.metrics.record_rollback();
        Ok(handle)
    }

    /// Remove a rollback pin; returns the version that was pinned
    pub fn clear_rollback(&self, id: &str) -> Option<Version> {
        let (_, version) = self.inner.pins.remove(id)?;
        self.invalidate(id);
        tracing::info!(function_id = %id, version = %version, "Cleared rollback pin");
        Some(version)
    }

    /// Version pinned by a rollback, if any
    #[must_use]
    pub fn pinned_version(&self, id: &str) -> Option<Version> {
        self.inner.pins.get(id).map(|pin| pin.value().clone())
    }

    /// Breaker snapshot for `id`; `None` if no load has touched it since the
    /// last reset
    #[must_use]
    pub fn circuit_breaker_state(&self, id: &str) -> Option<CircuitBreakerState> {
        let breaker = self.inner.breakers.get(id)?;
        let mut snapshot = breaker.snapshot();
        snapshot.state = breaker.state_at(Instant::now());
        Some(snapshot)
    }

    /// Force the breaker for `id` closed; returns whether one existed
    pub fn reset_circuit_breaker(&self, id: &str) -> bool {
        let Some(mut breaker) = self.inner.breakers.get_mut(id) else {
            return false;
        };
        breaker.reset();
        tracing::info!(function_id = %id, "Circuit breaker reset");
        true
    }

    /// Counter snapshot
    #[must_use]
    pub fn metrics(&self) -> LoaderMetrics {
        self.inner.metrics.snapshot()
    }

    /// Zero every counter
    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
    }

    /// Cache statistics
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        let metrics = self.inner.metrics.snapshot();
        CacheStats {
            entries: self.inner.cache.len(),
            hits: metrics.cache_hits,
            misses: metrics.cache_misses,
            hit_rate: metrics.cache_hit_rate(),
            ttl_ms: u64::try_from(self.inner.cache.ttl().as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Health report
    #[must_use]
    pub fn health_check(&self) -> LoaderHealth {
        let now = Instant::now();
        let mut open_circuits = Vec::new();
        let mut half_open_circuits = Vec::new();
        for entry in &self.inner.breakers {
            match entry.value().state_at(now) {
                CircuitState::Open => open_circuits.push(entry.key().clone()),
                CircuitState::HalfOpen => half_open_circuits.push(entry.key().clone()),
                CircuitState::Closed => {}
            }
        }
        open_circuits.sort();
        half_open_circuits.sort();

        let status = if open_circuits.is_empty() && half_open_circuits.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        let in_flight = self
            .inner
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();

        LoaderHealth {
            status,
            open_circuits,
            half_open_circuits,
            cache_entries: self.inner.cache.len(),
            in_flight,
        }
    }
}

impl LoaderInner {
    fn generation(&self, id: &str) -> u64 {
        self.generations.get(id).map_or(0, |g| *g)
    }

    fn breaker_state(&self, id: &str) -> CircuitState {
        self.breakers
            .get(id)
            .map_or(CircuitState::Closed, |b| b.state_at(Instant::now()))
    }

    fn settle(&self, id: &str, update: impl FnOnce(&mut CircuitBreaker)) -> CircuitState {
        match self.breakers.get_mut(id) {
            Some(mut breaker) => {
                update(&mut breaker);
                breaker.state()
            }
            None => CircuitState::Closed,
        }
    }

    async fn resolve(
        &self,
        key: &CacheKey,
        deadline: Option<Instant>,
    ) -> Result<Resolved, LoaderError> {
        let id = key.id.as_str();
        let admission = self
            .breakers
            .entry(id.to_string())
            .or_insert_with(|| CircuitBreaker::new(id, &self.config))
            .try_acquire(Instant::now());

        let permit = match admission {
            Ok(permit) => permit,
            Err(state) => {
                self.metrics.record_rejection();
                tracing::debug!(function_id = %id, state = %state, "Load rejected by circuit breaker");
                return Err(LoaderError::new(
                    CoreError::CircuitOpen {
                        id: id.to_string(),
                        state: state.to_string(),
                    },
                    0,
                    state,
                ));
            }
        };

        let (outcome, mut retry_count) = self
            .resolve_with_retry(id, key.version.as_ref(), deadline)
            .await;

        let error = match outcome {
            Ok(handle) => {
                self.settle(id, |b| b.on_success(permit));
                return Ok(Resolved {
                    handle,
                    retry_count,
                    degradation_reason: None,
                });
            }
            Err(error) => error,
        };

        if let Some(fallback) = self.fallback_for(key) {
            let (degraded, fallback_retries) =
                self.resolve_with_retry(id, Some(&fallback), deadline).await;
            retry_count += fallback_retries;
            if let Ok(handle) = degraded {
                self.settle(id, |b| b.release(permit));
                let reason = format!("served fallback version {fallback}: {error}");
                tracing::warn!(function_id = %id, version = %fallback, error = %error, "Degraded to fallback version");
                return Ok(Resolved {
                    handle,
                    retry_count,
                    degradation_reason: Some(reason),
                });
            }
        }

        let now = Instant::now();
        let state = if error.is_retryable() {
            self.settle(id, |b| b.on_failure(permit, now))
        } else {
            self.settle(id, |b| b.release(permit))
        };
        Err(LoaderError::new(error, retry_count, state))
    }

    fn fallback_for(&self, key: &CacheKey) -> Option<Version> {
        let fallback = self.config.fallback_version.as_ref()?;
        (key.version.as_ref() != Some(fallback)).then(|| fallback.clone())
    }

    async fn resolve_with_retry(
        &self,
        id: &str,
        version: Option<&Version>,
        deadline: Option<Instant>,
    ) -> (CoreResult<Arc<FunctionHandle>>, u32) {
        let mut retries = 0;
        loop {
            let error = match self.resolve_once(id, version).await {
                Ok(handle) => {
                    self.metrics.record_retries(retries);
                    return (Ok(handle), retries);
                }
                Err(error) => error,
            };

            if !error.is_retryable() || !self.retry.can_retry(retries) {
                self.metrics.record_retries(retries);
                return (Err(error), retries);
            }

            let delay = self.retry.delay(retries);
            if deadline.is_some_and(|deadline| Instant::now() + delay > deadline) {
                self.metrics.record_retries(retries);
                return (
                    Err(CoreError::DeadlineExceeded { id: id.to_string() }),
                    retries,
                );
            }

            tracing::warn!(
                function_id = %id,
                attempt = retries + 1,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Retrying function load"
            );
            tokio::time::sleep(delay).await;
            retries += 1;
        }
    }

    async fn resolve_once(
        &self,
        id: &str,
        version: Option<&Version>,
    ) -> CoreResult<Arc<FunctionHandle>> {
        let metadata = self.store.get_metadata(id, version).await?;
        let source = self.store.get_code(id, Some(&metadata.version)).await?;
        let invocable = self.runtime.instantiate(&metadata, &source)?;
        tracing::debug!(function_id = %id, version = %metadata.version, "Resolved function");
        Ok(Arc::new(FunctionHandle::new(metadata, invocable)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TemplateRuntime;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tiered_core::FunctionMetadata;
    use tiered_registry::MemoryStore;

    /// Store that fails a configurable number of metadata reads
    struct FlakyStore {
        inner: MemoryStore,
        failures_left: AtomicU32,
        delay: Duration,
        metadata_calls: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32, delay: Duration) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures_left: AtomicU32::new(failures),
                delay,
                metadata_calls: AtomicU32::new(0),
            }
        }

        fn deploy(&self, id: &str, version: Version, source: &str) {
            self.inner
                .deploy(
                    FunctionMetadata::code(id, version, "json"),
                    Some(source.to_string()),
                )
                .unwrap();
        }

        fn heal(&self) {
            self.failures_left.store(0, Ordering::SeqCst);
        }

        fn calls(&self) -> u32 {
            self.metadata_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FunctionStore for FlakyStore {
        async fn get_metadata(
            &self,
            id: &str,
            version: Option<&Version>,
        ) -> CoreResult<FunctionMetadata> {
            self.metadata_calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(CoreError::transient("backend unavailable"));
            }
            self.inner.get_metadata(id, version).await
        }

        async fn get_code(&self, id: &str, version: Option<&Version>) -> CoreResult<String> {
            self.inner.get_code(id, version).await
        }
    }

    /// Store that reads metadata and then stalls before answering
    struct StallAfterRead {
        inner: MemoryStore,
        stall: Duration,
    }

    #[async_trait]
    impl FunctionStore for StallAfterRead {
        async fn get_metadata(
            &self,
            id: &str,
            version: Option<&Version>,
        ) -> CoreResult<FunctionMetadata> {
            let metadata = self.inner.get_metadata(id, version).await;
            tokio::time::sleep(self.stall).await;
            metadata
        }

        async fn get_code(&self, id: &str, version: Option<&Version>) -> CoreResult<String> {
            self.inner.get_code(id, version).await
        }
    }

    fn config() -> LoaderConfig {
        LoaderConfig::default()
            .with_jitter(false)
            .with_backoff(100, 1_000, 2.0)
    }

    fn loader(store: &Arc<FlakyStore>, config: LoaderConfig) -> ResilientLoader {
        ResilientLoader::new(store.clone(), Arc::new(TemplateRuntime::new()), config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_caches_handle() {
        let store = Arc::new(FlakyStore::new(0, Duration::ZERO));
        store.deploy("echo", Version::new(1, 0, 0), r#"{"echo": "$input"}"#);
        let loader = loader(&store, config());

        let handle = loader.load("echo", None).await.unwrap();
        assert_eq!(handle.call(json!(7)).await.unwrap(), json!({ "echo": 7 }));

        let report = loader.load_with_result("echo", None).await;
        assert!(report.success);
        assert!(report.from_cache);
        assert_eq!(store.calls(), 1);

        let stats = loader.cache_stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_loads_are_coalesced() {
        let store = Arc::new(FlakyStore::new(0, Duration::from_millis(50)));
        store.deploy("f", Version::new(1, 0, 0), "{}");
        let loader = loader(&store, config());

        let loads = (0..10).map(|_| loader.load("f", None));
        let results = futures::future::join_all(loads).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(store.calls(), 1);
        let metrics = loader.metrics();
        assert_eq!(metrics.coalesced_requests, 9);
        assert_eq!(metrics.successful_loads, 10);
        assert_eq!(loader.health_check().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesced_failure_is_annotated_per_caller() {
        let store = Arc::new(FlakyStore::new(u32::MAX, Duration::from_millis(10)));
        let loader = loader(&store, config().with_max_retries(1));

        let (first, second) = tokio::join!(loader.load("f", None), loader.load("f", None));
        let first = first.unwrap_err();
        let second = second.unwrap_err();

        assert!(!first.is_coalesced_request);
        assert!(second.is_coalesced_request);
        assert_eq!(first.retry_count, 1);
        assert_eq!(second.retry_count, 1);
        assert_eq!(first.error, second.error);
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_not_retried() {
        let store = Arc::new(FlakyStore::new(0, Duration::ZERO));
        let loader = loader(&store, config());

        let err = loader.load("missing", None).await.unwrap_err();
        assert!(err.error.is_not_found());
        assert_eq!(err.retry_count, 0);
        assert_eq!(store.calls(), 1);
        assert_eq!(
            loader.circuit_breaker_state("missing").unwrap().failure_count,
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let store = Arc::new(FlakyStore::new(2, Duration::ZERO));
        store.deploy("f", Version::new(1, 0, 0), "{}");
        let loader = loader(&store, config());

        let started = Instant::now();
        let report = loader.load_with_result("f", None).await;
        assert!(report.success);
        assert_eq!(report.retry_count, 2);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(loader.metrics().total_retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_and_recovers() {
        let store = Arc::new(FlakyStore::new(u32::MAX, Duration::ZERO));
        store.deploy("f", Version::new(1, 0, 0), "{}");
        let loader = loader(
            &store,
            config().with_max_retries(0).with_breaker(2, 1_000, 1),
        );

        for _ in 0..2 {
            let err = loader.load("f", None).await.unwrap_err();
            assert!(matches!(err.error, CoreError::TransientStorage { .. }));
        }
        assert_eq!(
            loader.circuit_breaker_state("f").unwrap().state,
            CircuitState::Open
        );

        let err = loader.load("f", None).await.unwrap_err();
        assert!(matches!(err.error, CoreError::CircuitOpen { .. }));
        assert_eq!(err.circuit_state, CircuitState::Open);
        assert_eq!(store.calls(), 2);
        assert_eq!(loader.metrics().circuit_rejections, 1);

        let health = loader.health_check();
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.open_circuits, vec!["f".to_string()]);

        store.heal();
        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(loader.load("f", None).await.is_ok());
        assert_eq!(
            loader.circuit_breaker_state("f").unwrap().state,
            CircuitState::Closed
        );
        assert_eq!(loader.health_check().status, HealthStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degrades_to_fallback_version() {
        let store = Arc::new(FlakyStore::new(0, Duration::ZERO));
        store.deploy("f", Version::new(1, 0, 0), r#"{"v": 1}"#);
        store.deploy("f", Version::new(2, 0, 0), "{broken");
        let loader = loader(
            &store,
            config().with_fallback_version(Version::new(1, 0, 0)),
        );

        let report = loader.load_with_result("f", None).await;
        assert!(report.success);
        assert!(report.degraded);
        assert!(report.degradation_reason.unwrap().contains("1.0.0"));
        assert_eq!(report.handle.unwrap().version(), &Version::new(1, 0, 0));
        assert_eq!(loader.cache_stats().entries, 0);
        assert_eq!(loader.metrics().degraded_loads, 1);
        assert_eq!(
            loader.circuit_breaker_state("f").unwrap().failure_count,
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_pins_version() {
        let store = Arc::new(FlakyStore::new(0, Duration::ZERO));
        store.deploy("f", Version::new(1, 0, 0), r#"{"v": 1}"#);
        store.deploy("f", Version::new(2, 0, 0), r#"{"v": 2}"#);
        let loader = loader(&store, config());

        assert_eq!(
            loader.load("f", None).await.unwrap().version(),
            &Version::new(2, 0, 0)
        );

        let handle = loader.rollback("f", Version::new(1, 0, 0)).await.unwrap();
        assert_eq!(handle.version(), &Version::new(1, 0, 0));
        assert!(loader.circuit_breaker_state("f").is_some_and(|s| s.state == CircuitState::Closed));

        let handle = loader.load("f", None).await.unwrap();
        assert_eq!(handle.call(json!(null)).await.unwrap(), json!({ "v": 1 }));
        assert_eq!(loader.metrics().rollback_count, 1);
        assert_eq!(loader.pinned_version("f"), Some(Version::new(1, 0, 0)));

        assert_eq!(loader.clear_rollback("f"), Some(Version::new(1, 0, 0)));
        assert_eq!(
            loader.load("f", None).await.unwrap().version(),
            &Version::new(2, 0, 0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_backoff() {
        let store = Arc::new(FlakyStore::new(u32::MAX, Duration::ZERO));
        let loader = loader(
            &store,
            config().with_max_retries(5).with_backoff(1_000, 5_000, 2.0),
        );

        let err = loader
            .load_with_deadline("f", None, Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err.error, CoreError::DeadlineExceeded { .. }));
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_and_reset_metrics() {
        let store = Arc::new(FlakyStore::new(0, Duration::ZERO));
        store.deploy("f", Version::new(1, 0, 0), "{}");
        let loader = loader(&store, config());

        loader.load("f", None).await.unwrap();
        assert_eq!(loader.invalidate("f"), 1);
        let report = loader.load_with_result("f", None).await;
        assert!(!report.from_cache);
        assert_eq!(store.calls(), 2);

        loader.reset_metrics();
        assert_eq!(loader.metrics(), LoaderMetrics::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expires_after_ttl() {
        let store = Arc::new(FlakyStore::new(0, Duration::ZERO));
        store.deploy("f", Version::new(1, 0, 0), "{}");
        let loader = loader(&store, config().with_cache_ttl(500));

        loader.load("f", None).await.unwrap();
        tokio::time::advance(Duration::from_millis(501)).await;
        loader.load("f", None).await.unwrap();
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_handles_are_swept() {
        let store = Arc::new(FlakyStore::new(0, Duration::ZERO));
        let ids: Vec<String> = (0..20).map(|i| format!("f{i}")).collect();
        for id in &ids {
            store.deploy(id, Version::new(1, 0, 0), "{}");
        }
        let loader = loader(&store, config().with_cache_ttl(1_000));

        for id in &ids {
            loader.load(id, None).await.unwrap();
        }
        assert_eq!(loader.cache_stats().entries, 20);

        tokio::time::advance(Duration::from_secs(3_600)).await;
        loader.load("f0", None).await.unwrap();
        assert_eq!(loader.cache_stats().entries, 1);
        assert_eq!(loader.cache_stats().ttl_ms, 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_discards_racing_load() {
        let store = Arc::new(StallAfterRead {
            inner: MemoryStore::new(),
            stall: Duration::from_millis(100),
        });
        store
            .inner
            .deploy(
                FunctionMetadata::code("f", Version::new(1, 0, 0), "json"),
                Some(r#"{"v": 1}"#.to_string()),
            )
            .unwrap();
        let loader = ResilientLoader::new(store.clone(), Arc::new(TemplateRuntime::new()), config());

        let racing = tokio::spawn({
            let loader = loader.clone();
            async move { loader.load("f", None).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        store
            .inner
            .deploy(
                FunctionMetadata::code("f", Version::new(2, 0, 0), "json"),
                Some(r#"{"v": 2}"#.to_string()),
            )
            .unwrap();
        loader.invalidate("f");

        let stale = racing.await.unwrap().unwrap();
        assert_eq!(stale.version(), &Version::new(1, 0, 0));
        assert_eq!(loader.cache_stats().entries, 0);

        let fresh = loader.load("f", None).await.unwrap();
        assert_eq!(fresh.version(), &Version::new(2, 0, 0));
        assert_eq!(loader.cache_stats().entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_concurrent_loads() {
        let store = Arc::new(FlakyStore::new(1, Duration::from_millis(50)));
        store.deploy("f", Version::new(1, 0, 0), "{}");
        let loader = loader(
            &store,
            config()
                .with_max_retries(0)
                .with_breaker(1, 1_000, 1)
                .with_max_half_open_requests(1),
        );

        assert!(loader.load("f", None).await.is_err());
        tokio::time::advance(Duration::from_millis(1_000)).await;

        // Different keys, so neither load coalesces onto the other.
        let (latest, exact) = tokio::join!(
            loader.load("f", None),
            loader.load_version("f", Version::new(1, 0, 0))
        );
        let (admitted, rejected) = match (latest, exact) {
            (Ok(handle), Err(err)) | (Err(err), Ok(handle)) => (handle, err),
            other => panic!("expected one admitted load and one rejection, got {other:?}"),
        };
        assert_eq!(admitted.version(), &Version::new(1, 0, 0));
        assert!(matches!(rejected.error, CoreError::CircuitOpen { .. }));
        assert_eq!(rejected.circuit_state, CircuitState::HalfOpen);
        assert_eq!(store.calls(), 2);
        assert_eq!(loader.metrics().circuit_rejections, 1);
        assert_eq!(
            loader.circuit_breaker_state("f").unwrap().state,
            CircuitState::Closed
        );

        let exact = loader.load_version("f", Version::new(1, 0, 0)).await.unwrap();
        assert_eq!(exact.version(), &Version::new(1, 0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hits_close_half_open_breaker() {
        let store = Arc::new(FlakyStore::new(1, Duration::ZERO));
        store.deploy("f", Version::new(1, 0, 0), "{}");
        let loader = loader(
            &store,
            config().with_max_retries(0).with_breaker(1, 1_000, 2),
        );

        assert!(loader.load("f", None).await.is_err());
        tokio::time::advance(Duration::from_millis(1_000)).await;

        loader.load("f", None).await.unwrap();
        assert_eq!(
            loader.circuit_breaker_state("f").unwrap().state,
            CircuitState::HalfOpen
        );
        assert_eq!(loader.health_check().half_open_circuits, vec!["f".to_string()]);

        assert!(loader.load_with_result("f", None).await.from_cache);
        assert_eq!(
            loader.circuit_breaker_state("f").unwrap().state,
            CircuitState::Closed
        );
        assert_eq!(loader.health_check().status, HealthStatus::Healthy);
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_circuit_breaker_closes_in_place() {
        let store = Arc::new(FlakyStore::new(u32::MAX, Duration::ZERO));
        let loader = loader(
            &store,
            config().with_max_retries(0).with_breaker(1, 60_000, 1),
        );
        assert!(!loader.reset_circuit_breaker("f"));

        assert!(loader.load("f", None).await.is_err());
        assert_eq!(
            loader.circuit_breaker_state("f").unwrap().state,
            CircuitState::Open
        );

        assert!(loader.reset_circuit_breaker("f"));
        let state = loader.circuit_breaker_state("f").unwrap();
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.failure_count, 0);
        assert!(state.opened_at.is_none());

        let err = loader.load("f", None).await.unwrap_err();
        assert!(matches!(err.error, CoreError::TransientStorage { .. }));
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_is_bounded_by_deadline() {
        let store = Arc::new(FlakyStore::new(0, Duration::from_secs(600)));
        store.deploy("f", Version::new(1, 0, 0), "{}");
        let loader = loader(&store, config());

        let started = Instant::now();
        let report = loader
            .load_with_result_until("f", None, started + Duration::from_secs(5))
            .await;
        assert!(!report.success);
        assert!(matches!(
            report.error.unwrap().error,
            CoreError::DeadlineExceeded { .. }
        ));
        assert!(started.elapsed() < Duration::from_secs(6));
        assert_eq!(loader.metrics().failed_loads, 1);
    }
}
