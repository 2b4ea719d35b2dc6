//! Structural validation of raw telemetry payloads
//!
//! The validator turns an arbitrary JSON value into a [`TelemetryMessage`]
//! or a list of rule violations. It never panics and never propagates an
//! error: a payload that is not even an object yields the single generic
//! `"Structure validation failed"` entry.

use crate::message::{DataPoint, DataPointValue, SentryModeState, TelemetryMessage};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Outcome of validating one inbound payload.
///
/// `message` is `Some` exactly when `is_valid` is true. The result is
/// consumed immediately by the dispatch path and never persisted.
#[derive(Debug)]
pub struct ValidationResult {
    /// Whether the payload satisfied every rule
    pub is_valid: bool,
    /// One human-readable entry per violated rule, in rule order
    pub errors: Vec<String>,
    /// The typed message, present only for valid payloads
    pub message: Option<TelemetryMessage>,
}

impl ValidationResult {
    fn valid(message: TelemetryMessage) -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            message: Some(message),
        }
    }

    fn invalid(errors: Vec<String>) -> Self {
        Self {
            is_valid: false,
            errors,
            message: None,
        }
    }
}

/// Validates a raw payload against the telemetry wire contract.
pub fn validate(raw: &Value) -> ValidationResult {
    let Some(object) = raw.as_object() else {
        return ValidationResult::invalid(vec!["Structure validation failed".to_string()]);
    };

    let mut errors = Vec::new();

    let vin = match object.get("vin").and_then(Value::as_str) {
        Some(vin) => Some(vin.to_string()),
        None => {
            errors.push("vin must be a string".to_string());
            None
        }
    };

    let created_at = parse_created_at(object.get("createdAt"), &mut errors);

    let is_resend = match object.get("isResend").and_then(Value::as_bool) {
        Some(flag) => Some(flag),
        None => {
            errors.push("isResend must be a boolean".to_string());
            None
        }
    };

    let data = parse_data(object.get("data"), &mut errors);

    match (errors.is_empty(), vin, created_at, is_resend, data) {
        (true, Some(vin), Some(created_at), Some(is_resend), Some(data)) => {
            ValidationResult::valid(TelemetryMessage {
                vin,
                created_at,
                is_resend,
                data,
            })
        }
        _ => ValidationResult::invalid(errors),
    }
}

fn parse_created_at(value: Option<&Value>, errors: &mut Vec<String>) -> Option<DateTime<Utc>> {
    match value.and_then(Value::as_str) {
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(timestamp) => Some(timestamp.with_timezone(&Utc)),
            Err(_) => {
                errors.push("createdAt must be an ISO 8601 date-time string".to_string());
                None
            }
        },
        None => {
            errors.push("createdAt must be an ISO 8601 date-time string".to_string());
            None
        }
    }
}

fn parse_data(value: Option<&Value>, errors: &mut Vec<String>) -> Option<Vec<DataPoint>> {
    let entries = match value.and_then(Value::as_array) {
        Some(entries) if !entries.is_empty() => entries,
        Some(_) => {
            errors.push("data must contain at least one entry".to_string());
            return None;
        }
        None => {
            errors.push("data must be a non-empty array".to_string());
            return None;
        }
    };

    let before = errors.len();
    let mut points = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        if let Some(point) = parse_data_point(index, entry, errors) {
            points.push(point);
        }
    }

    if errors.len() == before {
        Some(points)
    } else {
        None
    }
}

fn parse_data_point(index: usize, entry: &Value, errors: &mut Vec<String>) -> Option<DataPoint> {
    let Some(object) = entry.as_object() else {
        errors.push(format!("data[{index}] must be an object"));
        return None;
    };

    let key = match object.get("key").and_then(Value::as_str) {
        Some(key) => Some(key.to_string()),
        None => {
            errors.push(format!("data[{index}].key must be a string"));
            None
        }
    };

    let value = match object.get("value").and_then(Value::as_object) {
        Some(value) => {
            if let Some(raw_state) = value.get("sentryModeStateValue") {
                match raw_state.as_str().and_then(SentryModeState::from_wire) {
                    Some(state) => Some(DataPointValue::SentryMode(state)),
                    None => {
                        errors.push(format!(
                            "data[{index}].value.sentryModeStateValue must be a valid SentryModeState"
                        ));
                        None
                    }
                }
            } else if let Some(text) = value.get("stringValue").and_then(Value::as_str) {
                Some(DataPointValue::Text(text.to_string()))
            } else {
                errors.push(format!(
                    "data[{index}].value must carry a stringValue or sentryModeStateValue"
                ));
                None
            }
        }
        None => {
            errors.push(format!("data[{index}].value must be an object"));
            None
        }
    };

    match (key, value) {
        (Some(key), Some(value)) => Some(DataPoint { key, value }),
        _ => None,
    }
}
