//! Cascade execution.
//!
//! Steps run strictly in order; each one is a full dispatch of its own
//! function, so nested cascades recurse. A successful step's output becomes
//! the next step's input as `{ "output": ... }`. A failed step may be rescued
//! by its `fallbackTo` function, which receives the same input the step did.

use crate::dispatcher::Dispatcher;
use crate::result::{DispatchMeta, DispatchResult};
use crate::validate::ensure_valid;
use serde_json::{Value, json};
use tiered_core::{CascadeSpec, CoreError, ErrorHandling, FunctionMetadata, TierKind};

/// Progress of one cascade instance
#[derive(Debug, Default)]
struct Progress {
    tiers_attempted: Vec<String>,
    steps_executed: usize,
    succeeded: bool,
}

impl Progress {
    fn attempt(&mut self, label: String) {
        self.tiers_attempted.push(label);
        self.steps_executed += 1;
    }

    fn annotate(&self, result: &mut DispatchResult) {
        let meta = result.meta_mut();
        meta.tiers_attempted = Some(self.tiers_attempted.clone());
        meta.steps_executed = Some(self.steps_executed);
    }
}

fn carried(result: &DispatchResult) -> Value {
    json!({ "output": result.output().cloned().unwrap_or(Value::Null) })
}

impl Dispatcher {
    pub(crate) async fn run_cascade(
        &self,
        metadata: &FunctionMetadata,
        spec: &CascadeSpec,
        input: Value,
        depth: usize,
    ) -> DispatchResult {
        let mut progress = Progress::default();
        let meta = DispatchMeta::new(TierKind::Cascade).with_cascade(Vec::new(), 0);

        let limit = self.config.max_cascade_depth;
        if depth >= limit {
            tracing::warn!(function_id = %metadata.id, depth, limit, "Cascade nesting too deep");
            let error = CoreError::CascadeDepthExceeded {
                depth: depth + 1,
                limit,
            };
            return DispatchResult::failure(&error, meta);
        }

        if let Some(schema) = &metadata.input_schema {
            if let Err(error) = ensure_valid(&input, schema) {
                return DispatchResult::failure(&error, meta);
            }
        }

        let mut current = input;
        for (index, step) in spec.steps.iter().enumerate() {
            progress.attempt(step.tier.to_string());
            let primary = self.run_step(&step.function_id, step.tier, current.clone(), depth).await;
            if primary.is_success() {
                current = carried(&primary);
                progress.succeeded = true;
                continue;
            }

            tracing::debug!(
                cascade = %metadata.id,
                step = index,
                function_id = %step.function_id,
                status = primary.status,
                "Cascade step failed"
            );
            let mut failure = primary;

            if let Some(fallback_id) = &step.fallback_to {
                match self.registry.get_metadata(fallback_id, None).await {
                    Ok(fallback) => {
                        progress.attempt(format!("{}:fallback", step.tier));
                        let rescued = self
                            .dispatch_at(&fallback, current.clone(), None, depth + 1)
                            .await;
                        if rescued.is_success() {
                            tracing::info!(
                                cascade = %metadata.id,
                                step = index,
                                fallback = %fallback_id,
                                "Cascade step rescued by fallback"
                            );
                            current = carried(&rescued);
                            progress.succeeded = true;
                            continue;
                        }
                        failure = rescued;
                    }
                    Err(error) => {
                        tracing::warn!(
                            cascade = %metadata.id,
                            fallback = %fallback_id,
                            error = %error,
                            "Fallback function unavailable"
                        );
                    }
                }
            }

            match spec.error_handling {
                ErrorHandling::FailFast => {
                    progress.annotate(&mut failure);
                    return failure;
                }
                ErrorHandling::Fallback => {
                    tracing::warn!(
                        cascade = %metadata.id,
                        step = index,
                        error = failure.error().unwrap_or_default(),
                        "Continuing cascade past failed step"
                    );
                }
            }
        }

        let meta = meta.with_cascade(progress.tiers_attempted.clone(), progress.steps_executed);
        if progress.succeeded {
            DispatchResult::ok(current, meta)
        } else {
            let error = CoreError::CascadeExhausted {
                attempted: progress.steps_executed,
            };
            DispatchResult::failure(&error, meta)
        }
    }

    async fn run_step(
        &self,
        function_id: &str,
        tier: TierKind,
        input: Value,
        depth: usize,
    ) -> DispatchResult {
        match self.registry.get_metadata(function_id, None).await {
            Ok(metadata) => self.dispatch_at(&metadata, input, None, depth + 1).await,
            Err(error) => DispatchResult::failure(&error, DispatchMeta::new(tier)),
        }
    }
}
