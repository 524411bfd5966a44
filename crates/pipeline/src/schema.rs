//! Output schemas for generative nodes.
//!
//! A schema names the fields a node's output must carry and their primitive
//! types. A mismatch makes the output technically invalid, which consumes the
//! node's retry budget (never its rework budget).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Primitive JSON types a field may be constrained to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Any,
}

impl FieldType {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        }
    }
}

/// Expected shape of a node's output object.
///
/// ```toml
/// [nodes.output_schema]
/// required = ["approved", "comments"]
/// fields = { approved = "boolean", comments = "array" }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSchema {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldType>,
}

impl OutputSchema {
    /// Checks `output` against the schema, returning one message per violation.
    pub fn validate(&self, output: &Value) -> Result<(), Vec<String>> {
        let Value::Object(map) = output else {
            return Err(vec![format!("output must be a JSON object, got {}", kind_of(output))]);
        };

        let mut violations: Vec<String> = self
            .required
            .iter()
            .filter(|field| !map.contains_key(field.as_str()))
            .map(|field| format!("missing required field '{field}'"))
            .collect();

        for (field, expected) in &self.fields {
            if let Some(value) = map.get(field) {
                if !value.is_null() && !expected.matches(value) {
                    violations.push(format!(
                        "field '{field}' must be {}, got {}",
                        expected.as_str(),
                        kind_of(value)
                    ));
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
