//! Value conversion between domain values and native property types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use serde_json::{Number, Value};

use crate::error::{DatastoreError, Result};
use crate::types::PropertyType;

/// Converts values to the representation a property type expects
pub trait ConversionService: Send + Sync + fmt::Debug {
    /// Whether `convert` would succeed for this value
    fn can_convert(&self, value: &Value, target: &PropertyType) -> bool;

    /// Convert a value, failing with `DatastoreError::Conversion`
    fn convert(&self, value: &Value, target: &PropertyType) -> Result<Value>;
}

/// Conversions for the built-in property types
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConversionService;

impl ConversionService for DefaultConversionService {
    fn can_convert(&self, value: &Value, target: &PropertyType) -> bool {
        target.validate_value(value).is_ok()
    }

    fn convert(&self, value: &Value, target: &PropertyType) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        target
            .validate_value(value)
            .map_err(DatastoreError::conversion)?;

        let fail = || {
            DatastoreError::conversion(format!(
                "Cannot convert {} to {}",
                value,
                target.type_name()
            ))
        };

        match target {
            PropertyType::String | PropertyType::Enum { .. } => Ok(match value {
                Value::String(_) => value.clone(),
                Value::Number(n) => Value::String(n.to_string()),
                Value::Bool(b) => Value::String(b.to_string()),
                other => Value::String(other.to_string()),
            }),
            PropertyType::Integer => {
                let int = match value {
                    Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
                    Value::String(s) => s.trim().parse::<i64>().ok(),
                    _ => None,
                };
                int.map(Value::from).ok_or_else(fail)
            }
            PropertyType::Float => {
                let float = match value {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                };
                float
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(fail)
            }
            PropertyType::Decimal { scale, .. } => {
                let decimal = match value {
                    Value::Number(n) => match n.as_i64() {
                        Some(i) => Some(Decimal::from(i)),
                        None => n.as_f64().and_then(Decimal::from_f64),
                    },
                    Value::String(s) => Decimal::from_str(s.trim()).ok(),
                    _ => None,
                };
                decimal
                    .map(|d| d.round_dp(u32::from(*scale)))
                    .and_then(|d| d.to_f64())
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(fail)
            }
            PropertyType::Boolean => match value {
                Value::Bool(_) => Ok(value.clone()),
                Value::String(s) => match s.to_lowercase().as_str() {
                    "true" | "1" | "yes" => Ok(Value::Bool(true)),
                    "false" | "0" | "no" => Ok(Value::Bool(false)),
                    _ => Err(fail()),
                },
                _ => Err(fail()),
            },
            PropertyType::Timestamp => {
                let instant = match value {
                    Value::String(s) => DateTime::parse_from_rfc3339(s)
                        .ok()
                        .map(|dt| dt.with_timezone(&Utc)),
                    Value::Number(n) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
                    _ => None,
                };
                instant
                    .map(|dt| Value::String(format_timestamp(&dt)))
                    .ok_or_else(fail)
            }
            PropertyType::Json => Ok(value.clone()),
        }
    }
}

/// Canonical timestamp form: fixed-width UTC with millisecond precision
///
/// Fixed width keeps lexicographic order equal to chronological order.
pub fn format_timestamp(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn convert(value: Value, target: PropertyType) -> Result<Value> {
        DefaultConversionService.convert(&value, &target)
    }

    #[test]
    fn test_null_passes_through() {
        assert_eq!(convert(Value::Null, PropertyType::Integer).unwrap(), Value::Null);
    }

    #[test]
    fn test_string_to_integer() {
        assert_eq!(convert(json!(" 42 "), PropertyType::Integer).unwrap(), json!(42));
        assert_eq!(convert(json!(7.0), PropertyType::Integer).unwrap(), json!(7));
        assert!(matches!(
            convert(json!("forty"), PropertyType::Integer),
            Err(DatastoreError::Conversion(_))
        ));
    }

    #[test]
    fn test_decimal_rounds_to_scale() {
        assert_eq!(
            convert(json!("19.98765"), PropertyType::decimal(10, 2)).unwrap(),
            json!(19.99)
        );
        assert_eq!(convert(json!(3), PropertyType::decimal(10, 2)).unwrap(), json!(3.0));
    }

    #[test]
    fn test_boolean_coercion() {
        assert_eq!(convert(json!("YES"), PropertyType::Boolean).unwrap(), json!(true));
        assert_eq!(convert(json!("0"), PropertyType::Boolean).unwrap(), json!(false));
    }

    #[test]
    fn test_timestamp_normalised_to_utc() {
        assert_eq!(
            convert(json!("2024-03-01T12:00:00+02:00"), PropertyType::Timestamp).unwrap(),
            json!("2024-03-01T10:00:00.000Z")
        );
        assert_eq!(
            convert(json!(0), PropertyType::Timestamp).unwrap(),
            json!("1970-01-01T00:00:00.000Z")
        );
    }

    #[test]
    fn test_scalars_to_string() {
        assert_eq!(convert(json!(12), PropertyType::String).unwrap(), json!("12"));
        assert_eq!(convert(json!(false), PropertyType::String).unwrap(), json!("false"));
    }

    #[test]
    fn test_enum_rejects_unknown_value() {
        let target = PropertyType::Enum {
            values: vec!["a".to_string()],
        };
        assert!(!DefaultConversionService.can_convert(&json!("b"), &target));
        assert!(convert(json!("b"), target).is_err());
    }
}
