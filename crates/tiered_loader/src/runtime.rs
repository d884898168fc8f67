//! Code runtime seam and invocable handles.
//!
//! The loader only resolves metadata and source; turning source into
//! something callable is the job of a [`CodeRuntime`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tiered_core::{CoreError, CoreResult, FunctionMetadata, TierSpec, Version};

/// Something that answers a request with a response
#[async_trait]
pub trait Invocable: Send + Sync {
    /// Handle one request
    async fn call(&self, input: Value) -> CoreResult<Value>;
}

/// Turns resolved source into an [`Invocable`]
pub trait CodeRuntime: Send + Sync {
    /// Compile or otherwise prepare `source`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Compile`] if the source cannot be used. Compile
    /// errors are terminal: the loader does not retry them.
    fn instantiate(&self, metadata: &FunctionMetadata, source: &str)
        -> CoreResult<Arc<dyn Invocable>>;
}

/// Resolved, invocable function
pub struct FunctionHandle {
    metadata: FunctionMetadata,
    loaded_at: DateTime<Utc>,
    invocable: Arc<dyn Invocable>,
}

impl FunctionHandle {
    /// Wrap an invocable with the metadata it was built from
    #[must_use]
    pub fn new(metadata: FunctionMetadata, invocable: Arc<dyn Invocable>) -> Self {
        Self {
            metadata,
            loaded_at: Utc::now(),
            invocable,
        }
    }

    /// Function id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    /// Resolved version
    #[must_use]
    pub fn version(&self) -> &Version {
        &self.metadata.version
    }

    /// Metadata the handle was built from
    #[must_use]
    pub fn metadata(&self) -> &FunctionMetadata {
        &self.metadata
    }

    /// When the handle was resolved
    #[must_use]
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Invoke the function
    ///
    /// # Errors
    ///
    /// Returns whatever error the user code raises
    pub async fn call(&self, input: Value) -> CoreResult<Value> {
        self.invocable.call(input).await
    }
}

impl fmt::Debug for FunctionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionHandle")
            .field("id", &self.metadata.id)
            .field("version", &self.metadata.version.to_string())
            .field("loaded_at", &self.loaded_at)
            .finish_non_exhaustive()
    }
}

/// Runtime for `language: "json"` functions.
///
/// The source is a JSON template. String leaves equal to `"$input"` are
/// replaced by the whole input; `"$input.a.b"` is replaced by that path of the
/// input, or `null` if absent.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateRuntime;

impl TemplateRuntime {
    /// Language handled by this runtime
    pub const LANGUAGE: &'static str = "json";

    /// Create the runtime
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl CodeRuntime for TemplateRuntime {
    fn instantiate(
        &self,
        metadata: &FunctionMetadata,
        source: &str,
    ) -> CoreResult<Arc<dyn Invocable>> {
        let compile_error = |reason: String| CoreError::Compile {
            id: metadata.id.clone(),
            reason,
        };

        match &metadata.spec {
            TierSpec::Code(code) if code.language == Self::LANGUAGE => {}
            TierSpec::Code(code) => {
                return Err(compile_error(format!("unsupported language '{}'", code.language)))
            }
            other => {
                return Err(compile_error(format!(
                    "{} functions have no code",
                    other.kind()
                )))
            }
        }

        let template: Value =
            serde_json::from_str(source).map_err(|e| compile_error(e.to_string()))?;
        Ok(Arc::new(Template { template }))
    }
}

struct Template {
    template: Value,
}

impl Template {
    fn render(node: &Value, input: &Value) -> Value {
        match node {
            Value::String(s) if s == "$input" => input.clone(),
            Value::String(s) if s.starts_with("$input.") => {
                let mut current = input;
                for segment in s["$input.".len()..].split('.') {
                    match current.get(segment) {
                        Some(next) => current = next,
                        None => return Value::Null,
                    }
                }
                current.clone()
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| Self::render(v, input)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::render(v, input)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

#[async_trait]
impl Invocable for Template {
    async fn call(&self, input: Value) -> CoreResult<Value> {
        Ok(Self::render(&self.template, &input))
    }
}
