//! Structural input schemas.
//!
//! A deliberately small subset of JSON Schema: `type`, `required`, `enum`,
//! `properties` and `items`. Unknown keywords are ignored so schemas written
//! for richer validators still load.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Primitive JSON types a schema can demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    /// JSON object
    Object,
    /// JSON array
    Array,
    /// JSON string
    String,
    /// JSON number (numeric strings are accepted)
    Number,
    /// JSON boolean
    Boolean,
    /// JSON null
    Null,
}

impl SchemaType {
    /// Name as written in schemas
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::Array => "array",
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Null => "null",
        }
    }

    /// Name of the JSON type of a value
    #[must_use]
    pub const fn name_of(value: &Value) -> &'static str {
        match value {
            Value::Object(_) => "object",
            Value::Array(_) => "array",
            Value::String(_) => "string",
            Value::Number(_) => "number",
            Value::Bool(_) => "boolean",
            Value::Null => "null",
        }
    }

    /// Check whether `value` satisfies this type.
    ///
    /// Numbers coerce from numeric strings; every other check is exact.
    #[must_use]
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Object, Value::Object(_))
            | (Self::Array, Value::Array(_))
            | (Self::String, Value::String(_))
            | (Self::Number, Value::Number(_))
            | (Self::Boolean, Value::Bool(_))
            | (Self::Null, Value::Null) => true,
            (Self::Number, Value::String(s)) => {
                s.trim().parse::<f64>().map(f64::is_finite).unwrap_or(false)
            }
            _ => false,
        }
    }
}

impl fmt::Display for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Schema for a function input
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonSchema {
    /// Required JSON type
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<SchemaType>,
    /// Required object fields, in declaration order
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    /// Allowed values
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    /// Per-property schemas for objects
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub properties: IndexMap<String, JsonSchema>,
    /// Element schema for arrays
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<JsonSchema>>,
}

impl JsonSchema {
    /// Create an unconstrained schema
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a schema demanding a type
    #[must_use]
    pub fn of_type(schema_type: SchemaType) -> Self {
        Self {
            schema_type: Some(schema_type),
            ..Self::default()
        }
    }

    /// Add a required field
    #[must_use]
    pub fn with_required(mut self, field: impl Into<String>) -> Self {
        self.required.push(field.into());
        self
    }

    /// Add a property schema
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, schema: JsonSchema) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    /// Set the element schema
    #[must_use]
    pub fn with_items(mut self, schema: JsonSchema) -> Self {
        self.items = Some(Box::new(schema));
        self
    }

    /// Restrict to a set of values
    #[must_use]
    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }
}
