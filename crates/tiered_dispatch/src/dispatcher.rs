//! Tier routing.
//!
//! [`Dispatcher::dispatch`] is the one place that branches on a function's
//! tier. Every tier call runs under that tier's budget and every outcome,
//! including timeouts and missing backends, comes back as a
//! [`DispatchResult`].

use crate::config::DispatchConfig;
use crate::executor::{Executors, HumanTask, TaskStatus};
use crate::result::{DispatchMeta, DispatchResult};
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tiered_core::{CoreError, CoreResult, FunctionMetadata, HumanSpec, TierKind, TierSpec, Version};
use tiered_loader::{CodeRuntime, FunctionHandle, ResilientLoader};
use tiered_registry::FunctionStore;
use tokio::time::Instant;

/// Routes invocations to tiers
pub struct Dispatcher {
    pub(crate) registry: Arc<dyn FunctionStore>,
    loader: Option<ResilientLoader>,
    runtime: Option<Arc<dyn CodeRuntime>>,
    executors: Executors,
    pub(crate) config: DispatchConfig,
}

impl Dispatcher {
    /// Create a dispatcher with no code tier and no external executors
    #[must_use]
    pub fn new(registry: Arc<dyn FunctionStore>) -> Self {
        Self {
            registry,
            loader: None,
            runtime: None,
            executors: Executors::new(),
            config: DispatchConfig::default(),
        }
    }

    /// Serve the code tier through a loader
    #[must_use]
    pub fn with_loader(mut self, loader: ResilientLoader) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Runtime used for source overrides
    #[must_use]
    pub fn with_runtime(mut self, runtime: Arc<dyn CodeRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Set external executors
    #[must_use]
    pub fn with_executors(mut self, executors: Executors) -> Self {
        self.executors = executors;
        self
    }

    /// Set budgets and limits
    #[must_use]
    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Loader serving the code tier, if any
    #[must_use]
    pub fn loader(&self) -> Option<&ResilientLoader> {
        self.loader.as_ref()
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Run one invocation of already-resolved metadata.
    ///
    /// `source_override` only applies to `code` functions: the source is
    /// instantiated directly, bypassing the loader and its cache.
    pub async fn dispatch(
        &self,
        metadata: &FunctionMetadata,
        input: Value,
        source_override: Option<&str>,
    ) -> DispatchResult {
        self.dispatch_at(metadata, input, source_override, 0).await
    }

    /// Resolve metadata from the registry, then dispatch.
    ///
    /// # Errors
    ///
    /// Returns the registry error if the metadata cannot be fetched.
    pub async fn invoke(
        &self,
        id: &str,
        version: Option<&Version>,
        input: Value,
    ) -> CoreResult<DispatchResult> {
        let metadata = self.registry.get_metadata(id, version).await?;
        Ok(self.dispatch(&metadata, input, None).await)
    }

    pub(crate) fn dispatch_at<'a>(
        &'a self,
        metadata: &'a FunctionMetadata,
        input: Value,
        source_override: Option<&'a str>,
        depth: usize,
    ) -> BoxFuture<'a, DispatchResult> {
        async move {
            let started = Instant::now();
            tracing::debug!(function_id = %metadata.id, tier = %metadata.kind(), depth, "Dispatching");

            let mut result = match &metadata.spec {
                TierSpec::Code(_) => self.run_code(metadata, input, source_override).await,
                TierSpec::Generative(_) | TierSpec::Agentic(_) => {
                    self.run_external(metadata, &input).await
                }
                TierSpec::Human(spec) => self.run_human(metadata, spec, &input).await,
                TierSpec::Cascade(spec) => self.run_cascade(metadata, spec, input, depth).await,
            };

            result.meta_mut().duration_ms =
                u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            result
        }
        .boxed()
    }

    fn deadline_for(&self, tier: TierKind) -> Option<Instant> {
        self.config.timeout_for(tier).map(|budget| Instant::now() + budget)
    }

    async fn within_budget<T>(
        &self,
        function_id: &str,
        tier: TierKind,
        call: impl Future<Output = CoreResult<T>>,
    ) -> CoreResult<T> {
        self.until_deadline(function_id, tier, self.deadline_for(tier), call)
            .await
    }

    async fn until_deadline<T>(
        &self,
        function_id: &str,
        tier: TierKind,
        deadline: Option<Instant>,
        call: impl Future<Output = CoreResult<T>>,
    ) -> CoreResult<T> {
        let Some(deadline) = deadline else {
            return call.await;
        };
        match tokio::time::timeout_at(deadline, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(self.timed_out(function_id, tier)),
        }
    }

    fn timed_out(&self, function_id: &str, tier: TierKind) -> CoreError {
        let timeout_ms = self
            .config
            .timeout_for(tier)
            .map_or(0, |budget| u64::try_from(budget.as_millis()).unwrap_or(u64::MAX));
        tracing::warn!(function_id = %function_id, tier = %tier, timeout_ms, "Tier timed out");
        CoreError::TierTimeout {
            tier: tier.to_string(),
            timeout_ms,
        }
    }

    async fn run_code(
        &self,
        metadata: &FunctionMetadata,
        input: Value,
        source_override: Option<&str>,
    ) -> DispatchResult {
        let mut meta = DispatchMeta::new(TierKind::Code);
        // One budget covers resolving the handle and calling it.
        let deadline = self.deadline_for(TierKind::Code);

        let handle = match source_override {
            Some(source) => match self.instantiate_override(metadata, source) {
                Ok(handle) => handle,
                Err(error) => return DispatchResult::failure(&error, meta),
            },
            None => {
                let Some(loader) = &self.loader else {
                    let error = CoreError::CodeTierUnavailable {
                        reason: "no function loader configured".to_string(),
                    };
                    return DispatchResult::failure(&error, meta);
                };

                // A rollback pin overrides the version the metadata names.
                let version = match loader.pinned_version(&metadata.id) {
                    Some(pinned) => {
                        tracing::debug!(function_id = %metadata.id, version = %pinned, "Using rolled-back version");
                        pinned
                    }
                    None => metadata.version.clone(),
                };
                let report = match deadline {
                    Some(deadline) => {
                        loader
                            .load_with_result_until(&metadata.id, Some(version), deadline)
                            .await
                    }
                    None => loader.load_with_result(&metadata.id, Some(version)).await,
                };
                meta.from_cache = Some(report.from_cache);
                meta.retry_count = Some(report.retry_count);
                meta.degraded = report.degraded;
                meta.degradation_reason = report.degradation_reason;

                match (report.handle, report.error) {
                    (Some(handle), _) => handle,
                    (None, Some(error)) => {
                        let error = match error.error {
                            CoreError::DeadlineExceeded { .. } => {
                                self.timed_out(&metadata.id, TierKind::Code)
                            }
                            other => other,
                        };
                        return DispatchResult::failure(&error, meta);
                    }
                    (None, None) => {
                        let error = CoreError::Execution {
                            message: format!("loader returned no handle for {}", metadata.id),
                        };
                        return DispatchResult::failure(&error, meta);
                    }
                }
            }
        };

        match self
            .until_deadline(&metadata.id, TierKind::Code, deadline, handle.call(input))
            .await
        {
            Ok(output) => DispatchResult::ok(output, meta),
            Err(error) => DispatchResult::failure(&error, meta),
        }
    }

    fn instantiate_override(
        &self,
        metadata: &FunctionMetadata,
        source: &str,
    ) -> CoreResult<Arc<FunctionHandle>> {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| CoreError::CodeTierUnavailable {
                reason: "no code runtime configured for source overrides".to_string(),
            })?;
        let invocable = runtime.instantiate(metadata, source)?;
        Ok(Arc::new(FunctionHandle::new(metadata.clone(), invocable)))
    }

    async fn run_external(&self, metadata: &FunctionMetadata, input: &Value) -> DispatchResult {
        let tier = metadata.kind();
        let mut meta = DispatchMeta::new(tier);
        let Some(executor) = self.executors.get(tier) else {
            let error = CoreError::ExecutorUnavailable {
                tier: tier.to_string(),
            };
            return DispatchResult::failure(&error, meta);
        };

        match self
            .within_budget(&metadata.id, tier, executor.execute(metadata, input))
            .await
        {
            Ok(response) => {
                meta.agentic_execution = response.agentic;
                DispatchResult::ok(response.output, meta)
            }
            Err(error) => DispatchResult::failure(&error, meta),
        }
    }

    async fn run_human(
        &self,
        metadata: &FunctionMetadata,
        spec: &HumanSpec,
        input: &Value,
    ) -> DispatchResult {
        let meta = DispatchMeta::new(TierKind::Human);
        let Some(executor) = self.executors.get(TierKind::Human) else {
            let error = CoreError::ExecutorUnavailable {
                tier: TierKind::Human.to_string(),
            };
            return DispatchResult::failure(&error, meta);
        };

        let response = match self
            .within_budget(&metadata.id, TierKind::Human, executor.execute(metadata, input))
            .await
        {
            Ok(response) => response,
            Err(error) => return DispatchResult::failure(&error, meta),
        };

        let task = response
            .human_task
            .unwrap_or_else(|| self.pending_task(spec));
        tracing::info!(function_id = %metadata.id, task_id = %task.task_id, "Human task created");
        match serde_json::to_value(&task) {
            Ok(output) => DispatchResult::with_status(202, output, meta),
            Err(error) => DispatchResult::failure(&CoreError::from(error), meta),
        }
    }

    fn pending_task(&self, spec: &HumanSpec) -> HumanTask {
        let ttl = chrono::Duration::from_std(self.config.human_task_ttl())
            .unwrap_or_else(|_| chrono::Duration::days(1));
        HumanTask {
            task_id: uuid::Uuid::new_v4().to_string(),
            status: TaskStatus::Pending,
            assignees: spec.assignees.clone(),
            expires_at: Utc::now() + ttl,
        }
    }
}
