//! Shape checks and reshaping between retrieval and cache commit.
//!
//! A transform runs once per retrieval, after the retry guard has produced a
//! raw value. Its failures are terminal for that retrieval; the guard never
//! re-runs a fetch because its payload had the wrong shape.

use std::sync::Arc;

use solarflow_core::{SolarflowResult, ValidationError};

/// Validates and optionally reshapes a fetched value.
pub type TransformFn =
    Arc<dyn Fn(serde_json::Value) -> SolarflowResult<serde_json::Value> + Send + Sync>;

/// Passes the value through untouched.
pub fn identity() -> TransformFn {
    Arc::new(Ok)
}

/// Requires the value to be a JSON object.
pub fn require_object() -> TransformFn {
    Arc::new(|value| {
        if value.is_object() {
            Ok(value)
        } else {
            Err(ValidationError::ShapeMismatch {
                expected: "object".to_string(),
            }
            .into())
        }
    })
}

/// Requires an object whose `field` is an array. The value passes through
/// unchanged so callers keep any sibling metadata.
pub fn require_array_field(field: &'static str) -> TransformFn {
    Arc::new(move |value| {
        let Some(entry) = value.get(field) else {
            return Err(ValidationError::RequiredFieldMissing {
                field: field.to_string(),
            }
            .into());
        };
        if !entry.is_array() {
            return Err(ValidationError::ShapeMismatch {
                expected: format!("array under field '{field}'"),
            }
            .into());
        }
        Ok(value)
    })
}

/// Extracts `field` from an object, discarding the wrapper. Missing fields
/// are a validation error.
pub fn extract_field(field: &'static str) -> TransformFn {
    Arc::new(move |mut value| {
        match value.get_mut(field) {
            Some(entry) => Ok(entry.take()),
            None => Err(ValidationError::RequiredFieldMissing {
                field: field.to_string(),
            }
            .into()),
        }
    })
}
