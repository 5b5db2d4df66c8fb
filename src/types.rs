//! Core type definitions for persistent properties
//!
//! Includes the declared property types and the value ordering shared by the
//! query engines and manual projections.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Declared Property Types
// ============================================================================

/// Declared type of a scalar property, used to pick native conversions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PropertyType {
    /// Text value
    String,

    /// 64-bit signed integer
    Integer,

    /// 64-bit floating point number
    Float,

    /// Decimal number rounded to `scale` digits when written
    Decimal {
        /// Total number of digits (default: 19)
        #[serde(default = "default_precision")]
        precision: u8,
        /// Number of digits after decimal point (default: 4)
        #[serde(default = "default_scale")]
        scale: u8,
    },

    /// Boolean flag
    Boolean,

    /// Point in time, always normalised to UTC RFC 3339
    Timestamp,

    /// Arbitrary JSON, stored as-is
    Json,

    /// String restricted to a set of allowed values
    Enum {
        /// List of allowed string values
        values: Vec<String>,
    },
}

fn default_precision() -> u8 {
    19
}

fn default_scale() -> u8 {
    4
}

impl PropertyType {
    /// Create a Decimal type with specified precision and scale
    pub fn decimal(precision: u8, scale: u8) -> Self {
        PropertyType::Decimal { precision, scale }
    }

    /// Short lowercase name, used in messages
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyType::String => "string",
            PropertyType::Integer => "integer",
            PropertyType::Float => "float",
            PropertyType::Decimal { .. } => "decimal",
            PropertyType::Boolean => "boolean",
            PropertyType::Timestamp => "timestamp",
            PropertyType::Json => "json",
            PropertyType::Enum { .. } => "enum",
        }
    }

    /// Validate that a JSON value is compatible with this property type
    pub fn validate_value(&self, value: &Value) -> Result<(), String> {
        // Null is handled by the nullable flag, not type validation
        if value.is_null() {
            return Ok(());
        }

        match (self, value) {
            (PropertyType::String, Value::String(_)) => Ok(()),
            (PropertyType::String, Value::Number(_) | Value::Bool(_)) => Ok(()),
            (PropertyType::Integer, Value::Number(n)) if n.is_i64() => Ok(()),
            (PropertyType::Integer, Value::Number(n)) => match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(()),
                _ => Err(format!("Cannot convert '{}' to integer", n)),
            },
            (PropertyType::Integer, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(|_| ())
                .map_err(|_| format!("Cannot convert '{}' to integer", s)),
            (PropertyType::Float | PropertyType::Decimal { .. }, Value::Number(_)) => Ok(()),
            (PropertyType::Float | PropertyType::Decimal { .. }, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(|_| ())
                .map_err(|_| format!("Cannot convert '{}' to {}", s, self.type_name())),
            (PropertyType::Boolean, Value::Bool(_)) => Ok(()),
            (PropertyType::Boolean, Value::String(s)) => match s.to_lowercase().as_str() {
                "true" | "false" | "1" | "0" | "yes" | "no" => Ok(()),
                _ => Err(format!("Cannot convert '{}' to boolean", s)),
            },
            (PropertyType::Timestamp, Value::String(s)) => chrono::DateTime::parse_from_rfc3339(s)
                .map(|_| ())
                .map_err(|e| format!("Invalid timestamp format: {}", e)),
            (PropertyType::Timestamp, Value::Number(n)) if n.is_i64() => Ok(()),
            (PropertyType::Json, _) => Ok(()),
            (PropertyType::Enum { values }, Value::String(s)) => {
                if values.contains(s) {
                    Ok(())
                } else {
                    Err(format!("Value '{}' not in enum values: {:?}", s, values))
                }
            }
            _ => Err(format!(
                "Type mismatch: expected {}, got {}",
                self.type_name(),
                value
            )),
        }
    }
}

// ============================================================================
// Value Ordering
// ============================================================================

/// Order two native values of the same kind
///
/// Numbers compare numerically regardless of integer/float representation,
/// strings lexicographically, booleans false < true. Values of different
/// kinds (and objects/arrays) are unordered.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                return Some(a.cmp(&b));
            }
            a.as_f64()?.partial_cmp(&b.as_f64()?)
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Structural equality that treats `1` and `1.0` as equal
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => {
            compare_values(left, right) == Some(Ordering::Equal)
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a
                    .iter()
                    .all(|(k, v)| b.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => left == right,
    }
}

/// Read a numeric version value as i64
pub fn version_number(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
