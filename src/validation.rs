//! Boundary validation for incoming sensor readings.
//!
//! Request bodies arrive as loosely typed JSON. Each element is checked
//! against the fixed reading shape and turned into a [`NewReading`]; every
//! problem found is reported with the element index and field name so the
//! caller can fix the whole batch in one round trip.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::NewReading;

// ---

const MAX_FIELD_ID_LEN: usize = 50;
const MAX_SENSOR_TYPE_LEN: usize = 50;
const MAX_UNIT_LEN: usize = 20;

/// One problem with one element of a submitted batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub index: usize,
    /// `None` when the element as a whole is malformed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    fn new(index: usize, field: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            index,
            field: field.map(String::from),
            message: message.into(),
        }
    }
}

/// Result of validating a batch without rejecting it wholesale.
#[derive(Debug, Default)]
pub struct Partitioned {
    pub valid: Vec<NewReading>,
    pub issues: Vec<ValidationIssue>,
}

/// Validate every element; succeed only if all of them are valid.
pub fn validate_all(batch: &[Value]) -> Result<Vec<NewReading>, Vec<ValidationIssue>> {
    // ---
    let Partitioned { valid, issues } = partition(batch);
    if issues.is_empty() {
        Ok(valid)
    } else {
        Err(issues)
    }
}

/// Split a batch into the elements that validate and the issues of those that don't.
pub fn partition(batch: &[Value]) -> Partitioned {
    // ---
    let mut out = Partitioned::default();
    for (index, element) in batch.iter().enumerate() {
        match validate_reading(index, element) {
            Ok(reading) => out.valid.push(reading),
            Err(mut issues) => out.issues.append(&mut issues),
        }
    }
    out
}

/// Validate a single element of a batch.
pub fn validate_reading(index: usize, value: &Value) -> Result<NewReading, Vec<ValidationIssue>> {
    // ---
    let Some(obj) = value.as_object() else {
        return Err(vec![ValidationIssue::new(
            index,
            None,
            format!("expected an object, got {}", json_type(value)),
        )]);
    };

    let mut issues = Vec::new();

    let timestamp = required(obj, index, "timestamp", &mut issues)
        .and_then(|v| parse_timestamp(index, v, &mut issues));
    let field_id = required(obj, index, "field_id", &mut issues)
        .and_then(|v| bounded_string(index, "field_id", v, MAX_FIELD_ID_LEN, &mut issues));
    let sensor_type = required(obj, index, "sensor_type", &mut issues).and_then(|v| {
        bounded_string(index, "sensor_type", v, MAX_SENSOR_TYPE_LEN, &mut issues)
    });
    let reading_value = required(obj, index, "reading_value", &mut issues)
        .and_then(|v| finite_number(index, v, &mut issues));
    let unit = required(obj, index, "unit", &mut issues)
        .and_then(|v| bounded_string(index, "unit", v, MAX_UNIT_LEN, &mut issues));

    match (timestamp, field_id, sensor_type, reading_value, unit) {
        (Some(timestamp), Some(field_id), Some(sensor_type), Some(reading_value), Some(unit))
            if issues.is_empty() =>
        {
            Ok(NewReading {
                timestamp,
                field_id,
                sensor_type,
                reading_value,
                unit,
            })
        }
        _ => Err(issues),
    }
}

fn required<'a>(
    obj: &'a Map<String, Value>,
    index: usize,
    field: &str,
    issues: &mut Vec<ValidationIssue>,
) -> Option<&'a Value> {
    // ---
    match obj.get(field) {
        None => {
            issues.push(ValidationIssue::new(index, Some(field), "missing field"));
            None
        }
        Some(Value::Null) => {
            issues.push(ValidationIssue::new(index, Some(field), "must not be null"));
            None
        }
        Some(v) => Some(v),
    }
}

fn bounded_string(
    index: usize,
    field: &str,
    value: &Value,
    max_len: usize,
    issues: &mut Vec<ValidationIssue>,
) -> Option<String> {
    // ---
    let Some(s) = value.as_str() else {
        issues.push(ValidationIssue::new(
            index,
            Some(field),
            format!("expected a string, got {}", json_type(value)),
        ));
        return None;
    };

    let len = s.chars().count();
    if len == 0 {
        issues.push(ValidationIssue::new(index, Some(field), "must not be empty"));
        return None;
    }
    if len > max_len {
        issues.push(ValidationIssue::new(
            index,
            Some(field),
            format!("must be at most {max_len} characters, got {len}"),
        ));
        return None;
    }
    Some(s.to_string())
}

fn finite_number(index: usize, value: &Value, issues: &mut Vec<ValidationIssue>) -> Option<f64> {
    // ---
    match value.as_f64() {
        Some(n) if n.is_finite() => Some(n),
        Some(_) => {
            issues.push(ValidationIssue::new(
                index,
                Some("reading_value"),
                "must be a finite number",
            ));
            None
        }
        None => {
            issues.push(ValidationIssue::new(
                index,
                Some("reading_value"),
                format!("expected a number, got {}", json_type(value)),
            ));
            None
        }
    }
}

fn parse_timestamp(
    index: usize,
    value: &Value,
    issues: &mut Vec<ValidationIssue>,
) -> Option<DateTime<Utc>> {
    // ---
    let Some(raw) = value.as_str() else {
        issues.push(ValidationIssue::new(
            index,
            Some("timestamp"),
            format!("expected a date-time string, got {}", json_type(value)),
        ));
        return None;
    };

    match parse_datetime(raw) {
        Some(ts) => Some(ts),
        None => {
            issues.push(ValidationIssue::new(
                index,
                Some("timestamp"),
                format!("invalid date-time '{raw}', expected RFC 3339"),
            ));
            None
        }
    }
}

/// Parse an RFC 3339 date-time; an offset-less ISO 8601 value is taken as UTC.
pub fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    // ---
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
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
