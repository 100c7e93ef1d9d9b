// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Payload Schema Checks
//!
//! Agents declare JSON Schemas for their input and output. Input violations
//! reject the execution before dispatch; output violations are reported but
//! never fail a completed run.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Declared schema is invalid: {0}")]
    InvalidSchema(String),

    #[error("Payload does not match schema: {}", .0.join("; "))]
    Violations(Vec<String>),
}

/// Checks `instance` against `schema`, collecting every violation.
pub fn validate_against(schema: &Value, instance: &Value) -> Result<(), SchemaError> {
    let validator =
        jsonschema::validator_for(schema).map_err(|e| SchemaError::InvalidSchema(e.to_string()))?;

    let violations: Vec<String> = validator
        .iter_errors(instance)
        .map(|e| e.to_string())
        .collect();

    if violations.is_empty() {
        Ok(())
    } else {
        Err(SchemaError::Violations(violations))
    }
}

/// `Ok` when no schema is declared.
pub fn validate_optional(schema: Option<&Value>, instance: &Value) -> Result<(), SchemaError> {
    match schema {
        Some(schema) => validate_against(schema, instance),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": { "x": { "type": "integer" } },
            "required": ["x"]
        })
    }

    #[test]
    fn accepts_matching_payload() {
        assert!(validate_against(&schema(), &json!({"x": 1})).is_ok());
    }

    #[test]
    fn collects_violations() {
        match validate_against(&schema(), &json!({"x": "one"})) {
            Err(SchemaError::Violations(v)) => assert_eq!(v.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
        assert!(validate_against(&schema(), &json!({})).is_err());
    }

    #[test]
    fn rejects_broken_schema() {
        let broken = json!({"type": "not-a-type"});
        assert!(matches!(
            validate_against(&broken, &json!({})),
            Err(SchemaError::InvalidSchema(_))
        ));
    }

    #[test]
    fn missing_schema_accepts_anything() {
        assert!(validate_optional(None, &json!("anything")).is_ok());
    }
}
