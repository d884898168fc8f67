//! Function metadata.
//!
//! Metadata is immutable per version. The tier-specific part is a sum type,
//! [`TierSpec`], tagged by the `type` field on the wire.

use crate::schema::JsonSchema;
use crate::version::Version;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Execution tier of a function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    /// Deterministic compiled code
    Code,
    /// Single generative-AI call
    Generative,
    /// Multi-step agentic loop
    Agentic,
    /// Human-in-the-loop task
    Human,
    /// Composite of other functions with fallback
    Cascade,
}

impl TierKind {
    /// Wire name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Generative => "generative",
            Self::Agentic => "agentic",
            Self::Human => "human",
            Self::Cascade => "cascade",
        }
    }

    /// Tier number reported in diagnostics; cascades have none
    #[must_use]
    pub const fn tier_number(&self) -> Option<u8> {
        match self {
            Self::Code => Some(1),
            Self::Generative => Some(2),
            Self::Agentic => Some(3),
            Self::Human => Some(4),
            Self::Cascade => None,
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields for `code` functions
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeSpec {
    /// Source language understood by the code runtime
    pub language: String,
    /// Exported entry point
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    /// Declared dependencies, name to version requirement
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub dependencies: IndexMap<String, String>,
}

/// Fields for `generative` functions
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerativeSpec {
    /// Model identifier
    pub model: String,
    /// Optional system prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Prompt template
    pub user_prompt: String,
    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

fn default_max_iterations() -> u32 {
    10
}

/// Fields for `agentic` functions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgenticSpec {
    /// Model identifier
    #[serde(default)]
    pub model: String,
    /// Goal the agent pursues
    pub goal: String,
    /// Tools the agent may call
    #[serde(default)]
    pub tools: Vec<String>,
    /// Iteration ceiling
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

/// Fields for `human` functions
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HumanSpec {
    /// Users or groups the task is offered to
    #[serde(default)]
    pub assignees: Vec<String>,
    /// Service-level target, e.g. `"4h"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sla: Option<String>,
    /// Instructions shown to the assignee
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// How a cascade reacts to an unrecovered step failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorHandling {
    /// Abort the cascade
    #[default]
    FailFast,
    /// Record the failure and continue with the next step
    Fallback,
}

/// One step of a cascade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeStep {
    /// Function invoked by this step
    pub function_id: String,
    /// Declared tier of that function
    pub tier: TierKind,
    /// Function invoked with the same input if this step fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_to: Option<String>,
}

impl CascadeStep {
    /// Create a step without fallback
    #[must_use]
    pub fn new(function_id: impl Into<String>, tier: TierKind) -> Self {
        Self {
            function_id: function_id.into(),
            tier,
            fallback_to: None,
        }
    }

    /// Set the fallback function
    #[must_use]
    pub fn with_fallback(mut self, function_id: impl Into<String>) -> Self {
        self.fallback_to = Some(function_id.into());
        self
    }
}

/// Fields for `cascade` functions
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeSpec {
    /// Steps in execution order
    pub steps: Vec<CascadeStep>,
    /// Failure policy
    #[serde(default)]
    pub error_handling: ErrorHandling,
}

/// Tier-specific part of the metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TierSpec {
    /// Deterministic code
    Code(CodeSpec),
    /// Generative call
    Generative(GenerativeSpec),
    /// Agentic loop
    Agentic(AgenticSpec),
    /// Human task
    Human(HumanSpec),
    /// Cascade of steps
    Cascade(CascadeSpec),
}

impl TierSpec {
    /// Tier of this spec
    #[must_use]
    pub const fn kind(&self) -> TierKind {
        match self {
            Self::Code(_) => TierKind::Code,
            Self::Generative(_) => TierKind::Generative,
            Self::Agentic(_) => TierKind::Agentic,
            Self::Human(_) => TierKind::Human,
            Self::Cascade(_) => TierKind::Cascade,
        }
    }
}

/// Description of one version of a function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionMetadata {
    /// Function id, unique within a tenant
    pub id: String,
    /// Version of this snapshot
    pub version: Version,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Schema the input must satisfy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<JsonSchema>,
    /// Declared output shape, carried through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Free-form tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Set once when the function is first deployed
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Changed on every write
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Tier-specific fields
    #[serde(flatten)]
    pub spec: TierSpec,
}

impl FunctionMetadata {
    /// Create metadata stamped with the current time
    #[must_use]
    pub fn new(id: impl Into<String>, version: Version, spec: TierSpec) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            version,
            name: None,
            description: None,
            input_schema: None,
            output_schema: None,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
            spec,
        }
    }

    /// Shorthand for a `code` function
    #[must_use]
    pub fn code(id: impl Into<String>, version: Version, language: impl Into<String>) -> Self {
        Self::new(
            id,
            version,
            TierSpec::Code(CodeSpec {
                language: language.into(),
                ..CodeSpec::default()
            }),
        )
    }

    /// Shorthand for a `cascade` function
    #[must_use]
    pub fn cascade(
        id: impl Into<String>,
        version: Version,
        steps: Vec<CascadeStep>,
        error_handling: ErrorHandling,
    ) -> Self {
        Self::new(
            id,
            version,
            TierSpec::Cascade(CascadeSpec {
                steps,
                error_handling,
            }),
        )
    }

    /// Set the input schema
    #[must_use]
    pub fn with_input_schema(mut self, schema: JsonSchema) -> Self {
        self.input_schema = Some(schema);
        self
    }

    /// Set the description
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Tier of this function
    #[must_use]
    pub const fn kind(&self) -> TierKind {
        self.spec.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tier_numbers() {
        assert_eq!(TierKind::Code.tier_number(), Some(1));
        assert_eq!(TierKind::Human.tier_number(), Some(4));
        assert_eq!(TierKind::Cascade.tier_number(), None);
        assert_eq!(TierKind::Agentic.to_string(), "agentic");
    }

    #[test]
    fn test_deserialize_code_metadata() {
        let meta: FunctionMetadata = serde_json::from_value(json!({
            "id": "resize",
            "version": "1.0.0",
            "type": "code",
            "language": "json",
            "entryPoint": "handler",
            "createdAt": "2026-01-01T00:00:00Z",
            "updatedAt": "2026-01-02T00:00:00Z"
        }))
        .unwrap();

        assert_eq!(meta.kind(), TierKind::Code);
        assert_eq!(meta.version, Version::new(1, 0, 0));
        match &meta.spec {
            TierSpec::Code(code) => {
                assert_eq!(code.language, "json");
                assert_eq!(code.entry_point.as_deref(), Some("handler"));
            }
            other => panic!("unexpected spec {:?}", other),
        }
        assert!(meta.created_at < meta.updated_at);
    }

    #[test]
    fn test_deserialize_cascade_metadata() {
        let meta: FunctionMetadata = serde_json::from_value(json!({
            "id": "pipeline",
            "version": "2.1.0",
            "type": "cascade",
            "steps": [
                { "functionId": "f", "tier": "code", "fallbackTo": "fallback-f" },
                { "functionId": "g", "tier": "generative" }
            ],
            "errorHandling": "fallback"
        }))
        .unwrap();

        let TierSpec::Cascade(cascade) = &meta.spec else {
            panic!("expected cascade");
        };
        assert_eq!(cascade.error_handling, ErrorHandling::Fallback);
        assert_eq!(cascade.steps.len(), 2);
        assert_eq!(cascade.steps[0].fallback_to.as_deref(), Some("fallback-f"));
        assert_eq!(cascade.steps[1].tier, TierKind::Generative);
    }

    #[test]
    fn test_error_handling_defaults_to_fail_fast() {
        let meta: FunctionMetadata = serde_json::from_value(json!({
            "id": "p",
            "version": "1.0.0",
            "type": "cascade",
            "steps": []
        }))
        .unwrap();
        let TierSpec::Cascade(cascade) = meta.spec else {
            panic!("expected cascade");
        };
        assert_eq!(cascade.error_handling, ErrorHandling::FailFast);
    }

    #[test]
    fn test_serialize_tags_type() {
        let meta = FunctionMetadata::code("f", Version::new(1, 0, 0), "json");
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["type"], "code");
        assert_eq!(value["language"], "json");
        assert_eq!(value["version"], "1.0.0");
        assert!(value.get("inputSchema").is_none());
    }

    #[test]
    fn test_agentic_defaults() {
        let meta: FunctionMetadata = serde_json::from_value(json!({
            "id": "researcher",
            "version": "0.1.0",
            "type": "agentic",
            "goal": "summarise"
        }))
        .unwrap();
        let TierSpec::Agentic(agentic) = meta.spec else {
            panic!("expected agentic");
        };
        assert_eq!(agentic.max_iterations, 10);
        assert!(agentic.tools.is_empty());
    }
}
