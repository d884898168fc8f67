//! Dispatch results.
//!
//! Every path, success or failure, produces a [`DispatchResult`] whose
//! `_meta` block says what was attempted and how long it took.

use crate::executor::AgenticExecution;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tiered_core::{CoreError, TierKind};

/// Diagnostic envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchMeta {
    /// Tier that handled the invocation
    pub executor_type: TierKind,
    /// Wall time in milliseconds
    #[serde(rename = "duration")]
    pub duration_ms: u64,
    /// Tier number (code 1, generative 2, agentic 3, human 4)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<u8>,
    /// The tier budget ran out
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
    /// Tier names attempted by a cascade, fallbacks tagged `:fallback`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tiers_attempted: Option<Vec<String>>,
    /// Step and fallback executions performed by a cascade
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps_executed: Option<usize>,
    /// Agentic loop diagnostics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agentic_execution: Option<AgenticExecution>,
    /// Code handle came from the loader cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_cache: Option<bool>,
    /// Loader retries spent resolving the code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    /// Code was served from the fallback version
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
    /// Why the code is degraded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degradation_reason: Option<String>,
}

impl DispatchMeta {
    /// Envelope for a tier, tier number filled in
    #[must_use]
    pub fn new(executor_type: TierKind) -> Self {
        Self {
            executor_type,
            duration_ms: 0,
            tier: executor_type.tier_number(),
            timed_out: false,
            tiers_attempted: None,
            steps_executed: None,
            agentic_execution: None,
            from_cache: None,
            retry_count: None,
            degraded: false,
            degradation_reason: None,
        }
    }

    /// Set the duration
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Set cascade progress
    #[must_use]
    pub fn with_cascade(mut self, tiers_attempted: Vec<String>, steps_executed: usize) -> Self {
        self.tiers_attempted = Some(tiers_attempted);
        self.steps_executed = Some(steps_executed);
        self
    }
}

/// Response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchBody {
    /// Output on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error text on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// One entry per violated input constraint
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Diagnostics
    #[serde(rename = "_meta")]
    pub meta: DispatchMeta,
}

/// Outcome of a dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResult {
    /// HTTP-convention status
    pub status: u16,
    /// Body
    pub body: DispatchBody,
}

impl DispatchResult {
    /// 200 with an output
    #[must_use]
    pub fn ok(output: Value, meta: DispatchMeta) -> Self {
        Self::with_status(200, output, meta)
    }

    /// 2xx with an output
    #[must_use]
    pub fn with_status(status: u16, output: Value, meta: DispatchMeta) -> Self {
        Self {
            status,
            body: DispatchBody {
                output: Some(output),
                error: None,
                errors: Vec::new(),
                meta,
            },
        }
    }

    /// Failure; status comes from the error
    #[must_use]
    pub fn failure(error: &CoreError, mut meta: DispatchMeta) -> Self {
        let errors = match error {
            CoreError::InputValidation { errors } => errors.clone(),
            _ => Vec::new(),
        };
        if matches!(error, CoreError::TierTimeout { .. }) {
            meta.timed_out = true;
        }
        Self {
            status: error.status_code(),
            body: DispatchBody {
                output: None,
                error: Some(error.to_string()),
                errors,
                meta,
            },
        }
    }

    /// Whether the status is 2xx
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Output, if any
    #[must_use]
    pub fn output(&self) -> Option<&Value> {
        self.body.output.as_ref()
    }

    /// Error text, if any
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.body.error.as_deref()
    }

    /// Diagnostics
    #[must_use]
    pub fn meta(&self) -> &DispatchMeta {
        &self.body.meta
    }

    /// Mutable diagnostics
    pub fn meta_mut(&mut self) -> &mut DispatchMeta {
        &mut self.body.meta
    }
}
