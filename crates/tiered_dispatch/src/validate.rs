//! Structural input validation.
//!
//! A type mismatch at any level reports one error and stops descending into
//! that value. Required fields are all reported, in declaration order.

use serde_json::Value;
use tiered_core::{CoreError, CoreResult, JsonSchema, SchemaType};

/// Check `value` against `schema`, returning one message per violation
#[must_use]
pub fn validate_input(value: &Value, schema: &JsonSchema) -> Vec<String> {
    let mut errors = Vec::new();
    validate_at(value, schema, "input", &mut errors);
    errors
}

/// Like [`validate_input`], as a result.
///
/// # Errors
///
/// Returns [`CoreError::InputValidation`] carrying every violation.
pub fn ensure_valid(value: &Value, schema: &JsonSchema) -> CoreResult<()> {
    let errors = validate_input(value, schema);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(CoreError::InputValidation { errors })
    }
}

fn validate_at(value: &Value, schema: &JsonSchema, path: &str, errors: &mut Vec<String>) {
    if let Some(expected) = schema.schema_type {
        if !expected.matches(value) {
            errors.push(format!(
                "{path}: expected {expected}, got {}",
                SchemaType::name_of(value)
            ));
            return;
        }
    }

    if let Some(allowed) = &schema.enum_values {
        if !allowed.contains(value) {
            let allowed: Vec<String> = allowed.iter().map(Value::to_string).collect();
            errors.push(format!(
                "{path}: {value} is not one of [{}]",
                allowed.join(", ")
            ));
        }
    }

    match value {
        Value::Object(fields) => {
            for field in &schema.required {
                if !fields.contains_key(field) {
                    errors.push(format!("{path}: missing required field '{field}'"));
                }
            }
            for (name, property) in &schema.properties {
                if let Some(child) = fields.get(name) {
                    validate_at(child, property, &format!("{path}.{name}"), errors);
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = &schema.items {
                for (index, item) in items.iter().enumerate() {
                    validate_at(item, item_schema, &format!("{path}[{index}]"), errors);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn object_requiring(fields: &[&str]) -> JsonSchema {
        fields
            .iter()
            .fold(JsonSchema::of_type(SchemaType::Object), |schema, field| {
                schema.with_required(*field)
            })
    }

    #[test]
    fn test_reports_every_missing_field_in_order() {
        let errors = validate_input(&json!({}), &object_requiring(&["a", "b"]));
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("'a'"));
        assert!(errors[1].contains("'b'"));
    }

    #[test]
    fn test_type_mismatch_short_circuits() {
        let errors = validate_input(&json!("x"), &object_requiring(&["a"]));
        assert_eq!(errors, vec!["input: expected object, got string".to_string()]);
    }

    #[test]
    fn test_numeric_strings_are_numbers() {
        let schema = JsonSchema::of_type(SchemaType::Number);
        assert!(validate_input(&json!("42.5"), &schema).is_empty());
        assert!(validate_input(&json!(7), &schema).is_empty());
        assert_eq!(validate_input(&json!("seven"), &schema).len(), 1);
        assert_eq!(
            validate_input(&json!(true), &JsonSchema::of_type(SchemaType::String)).len(),
            1
        );
    }

    #[test]
    fn test_enum_membership() {
        let schema = JsonSchema::of_type(SchemaType::String)
            .with_enum(vec![json!("low"), json!("high")]);
        assert!(validate_input(&json!("low"), &schema).is_empty());
        let errors = validate_input(&json!("mid"), &schema);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("\"mid\""));
    }

    #[test]
    fn test_recurses_into_properties_and_items() {
        let schema = JsonSchema::of_type(SchemaType::Object)
            .with_property(
                "user",
                JsonSchema::of_type(SchemaType::Object).with_required("name"),
            )
            .with_property(
                "tags",
                JsonSchema::of_type(SchemaType::Array)
                    .with_items(JsonSchema::of_type(SchemaType::String)),
            );

        let errors = validate_input(&json!({ "user": {}, "tags": ["a", 1, "b", null] }), &schema);
        assert_eq!(
            errors,
            vec![
                "input.user: missing required field 'name'".to_string(),
                "input.tags[1]: expected string, got number".to_string(),
                "input.tags[3]: expected string, got null".to_string(),
            ]
        );
    }

    #[test]
    fn test_open_world() {
        assert!(validate_input(&json!({ "anything": [1, 2] }), &JsonSchema::new()).is_empty());
        let schema = JsonSchema::of_type(SchemaType::Object)
            .with_property("known", JsonSchema::of_type(SchemaType::Number));
        assert!(validate_input(&json!({ "unknown": "x" }), &schema).is_empty());
    }

    #[test]
    fn test_ensure_valid() {
        let err = ensure_valid(&json!({}), &object_requiring(&["a"])).unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(ensure_valid(&json!({ "a": 1 }), &object_requiring(&["a"])).is_ok());
    }

    proptest! {
        #[test]
        fn prop_one_error_per_missing_field(present in proptest::collection::vec(any::<bool>(), 0..12)) {
            let names: Vec<String> = (0..present.len()).map(|i| format!("f{i}")).collect();
            let schema = names
                .iter()
                .fold(JsonSchema::of_type(SchemaType::Object), |s, n| s.with_required(n.as_str()));
            let mut input = serde_json::Map::new();
            for (name, keep) in names.iter().zip(&present) {
                if *keep {
                    input.insert(name.clone(), json!(1));
                }
            }
            let missing = present.iter().filter(|keep| !**keep).count();
            prop_assert_eq!(validate_input(&Value::Object(input), &schema).len(), missing);
        }
    }
}
