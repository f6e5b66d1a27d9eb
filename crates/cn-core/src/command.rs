//! Command schema validation.
//!
//! Turns untrusted JSON into a [`Command`], reporting every violated field
//! rather than stopping at the first one.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Command, CommandMetadata, CommandType, Priority};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// One violated field. `field` is a dotted path (`payload.props`, `$` for the
/// document root).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

impl FieldViolation {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// The command did not match the schema. Caller bug, never retried.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("schema violation: {}", format_violations(.violations))]
pub struct SchemaViolation {
    pub violations: Vec<FieldViolation>,
}

impl SchemaViolation {
    pub fn fields(&self) -> Vec<&str> {
        self.violations.iter().map(|v| v.field.as_str()).collect()
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.violations.iter().any(|v| v.field == field)
    }
}

fn format_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Parse raw JSON text, then validate it.
pub fn validate_command_str(raw: &str) -> Result<Command, SchemaViolation> {
    let value: Value = serde_json::from_str(raw).map_err(|e| SchemaViolation {
        violations: vec![FieldViolation::new("$", format!("invalid JSON: {e}"))],
    })?;
    validate_command(&value)
}

/// Validate an untyped JSON value against the command schema.
pub fn validate_command(raw: &Value) -> Result<Command, SchemaViolation> {
    let mut violations = Vec::new();

    let Some(obj) = raw.as_object() else {
        return Err(SchemaViolation {
            violations: vec![FieldViolation::new("$", "expected a JSON object")],
        });
    };

    let command_id = match obj.get("commandId") {
        None | Some(Value::Null) => {
            violations.push(FieldViolation::new("commandId", "required field is missing"));
            None
        }
        Some(Value::String(s)) if s.trim().is_empty() => {
            violations.push(FieldViolation::new("commandId", "must not be empty"));
            None
        }
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            violations.push(FieldViolation::new(
                "commandId",
                format!("expected string, got {}", json_type(other)),
            ));
            None
        }
    };

    let command_type = match obj.get("commandType") {
        None | Some(Value::Null) => {
            violations.push(FieldViolation::new("commandType", "required field is missing"));
            None
        }
        Some(Value::String(s)) => match CommandType::parse(s) {
            Some(ty) => Some(ty),
            None => {
                violations.push(FieldViolation::new(
                    "commandType",
                    format!("unknown command type `{s}`"),
                ));
                None
            }
        },
        Some(other) => {
            violations.push(FieldViolation::new(
                "commandType",
                format!("expected string, got {}", json_type(other)),
            ));
            None
        }
    };

    let payload = match obj.get("payload") {
        None | Some(Value::Null) => {
            violations.push(FieldViolation::new("payload", "required field is missing"));
            None
        }
        Some(Value::Object(map)) => {
            let before = violations.len();
            for (key, value) in map {
                if !is_flat_value(value) {
                    violations.push(FieldViolation::new(
                        format!("payload.{key}"),
                        "payload must be a flat key-value map (nested objects are not allowed)",
                    ));
                }
            }
            (violations.len() == before).then(|| map.clone())
        }
        Some(other) => {
            violations.push(FieldViolation::new(
                "payload",
                format!("expected object, got {}", json_type(other)),
            ));
            None
        }
    };

    let priority = match obj.get("priority") {
        None | Some(Value::Null) => {
            violations.push(FieldViolation::new("priority", "required field is missing"));
            None
        }
        Some(Value::String(s)) => match Priority::parse(s) {
            Some(p) => Some(p),
            None => {
                violations.push(FieldViolation::new(
                    "priority",
                    format!("`{s}` is not one of low, medium, high, critical"),
                ));
                None
            }
        },
        Some(other) => {
            violations.push(FieldViolation::new(
                "priority",
                format!("expected string, got {}", json_type(other)),
            ));
            None
        }
    };

    let metadata = match obj.get("metadata") {
        None | Some(Value::Null) => None,
        Some(Value::Object(meta)) => validate_metadata(meta, &mut violations),
        Some(other) => {
            violations.push(FieldViolation::new(
                "metadata",
                format!("expected object, got {}", json_type(other)),
            ));
            None
        }
    };

    match (command_id, command_type, payload, priority) {
        (Some(command_id), Some(command_type), Some(payload), Some(priority))
            if violations.is_empty() =>
        {
            Ok(Command {
                command_id,
                command_type,
                payload,
                priority,
                metadata,
            })
        }
        _ => Err(SchemaViolation { violations }),
    }
}

fn validate_metadata(
    meta: &serde_json::Map<String, Value>,
    violations: &mut Vec<FieldViolation>,
) -> Option<CommandMetadata> {
    let mut out = CommandMetadata::default();
    let before = violations.len();

    for key in ["userId", "projectId"] {
        match meta.get(key) {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) => {
                if key == "userId" {
                    out.user_id = Some(s.clone());
                } else {
                    out.project_id = Some(s.clone());
                }
            }
            Some(other) => violations.push(FieldViolation::new(
                format!("metadata.{key}"),
                format!("expected string, got {}", json_type(other)),
            )),
        }
    }

    match meta.get("timestamp") {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) => match DateTime::parse_from_rfc3339(s) {
            Ok(ts) => out.timestamp = Some(ts.with_timezone(&Utc)),
            Err(e) => violations.push(FieldViolation::new(
                "metadata.timestamp",
                format!("not an RFC 3339 timestamp: {e}"),
            )),
        },
        Some(other) => violations.push(FieldViolation::new(
            "metadata.timestamp",
            format!("expected string, got {}", json_type(other)),
        )),
    }

    (violations.len() == before).then_some(out)
}

/// Scalars and arrays of scalars are flat; objects are not.
fn is_flat_value(value: &Value) -> bool {
    match value {
        Value::Object(_) => false,
        Value::Array(items) => items
            .iter()
            .all(|v| !matches!(v, Value::Object(_) | Value::Array(_))),
        _ => true,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
