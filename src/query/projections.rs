//! Query projections
//!
//! `Count` is answered natively by the backend. `Min`, `Max` and
//! `CountDistinct` are reduced host-side from the filtered record set: this
//! is a performance fallback for backends without native aggregation and
//! pulls every matching record into memory.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::compare_values;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "property", rename_all = "camelCase")]
pub enum Projection {
    /// Identifier of each matching record
    Id,
    /// Number of matching records
    Count,
    CountDistinct(String),
    Min(String),
    Max(String),
    /// Value of a property for each matching record
    Property(String),
}

impl Projection {
    pub fn property(&self) -> Option<&str> {
        match self {
            Projection::CountDistinct(p)
            | Projection::Min(p)
            | Projection::Max(p)
            | Projection::Property(p) => Some(p),
            Projection::Id | Projection::Count => None,
        }
    }

    /// Whether this projection yields one value per record
    pub fn is_per_record(&self) -> bool {
        matches!(self, Projection::Id | Projection::Property(_))
    }
}

/// Smallest non-null value; `Null` when nothing is comparable
pub fn min(values: &[Value]) -> Value {
    extreme(values, Ordering::Less)
}

/// Largest non-null value; `Null` when nothing is comparable
pub fn max(values: &[Value]) -> Value {
    extreme(values, Ordering::Greater)
}

fn extreme(values: &[Value], wanted: Ordering) -> Value {
    let mut best: Option<&Value> = None;
    for value in values.iter().filter(|v| !v.is_null()) {
        best = match best {
            None => Some(value),
            Some(current) if compare_values(value, current) == Some(wanted) => Some(value),
            keep => keep,
        };
    }
    best.cloned().unwrap_or(Value::Null)
}

/// Number of distinct non-null values
///
/// Values are bucketed by a canonical text form, so `1` and `1.0` count once.
pub fn count_distinct(values: &[Value]) -> u64 {
    values
        .iter()
        .filter(|v| !v.is_null())
        .map(canonical)
        .collect::<HashSet<_>>()
        .len() as u64
}

/// Text form under which numerically equal values coincide
fn canonical(value: &Value) -> String {
    match value {
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i.to_string(),
            (None, Some(f)) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => (f as i64).to_string(),
            _ => n.to_string(),
        },
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let mut fields: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical(v)))
                .collect();
            fields.sort();
            format!("{{{}}}", fields.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_min_max_ignore_nulls() {
        let values = vec![json!(3), Value::Null, json!(1.5), json!(7)];
        assert_eq!(min(&values), json!(1.5));
        assert_eq!(max(&values), json!(7));
        assert_eq!(min(&[]), Value::Null);
    }

    #[test]
    fn test_min_max_strings() {
        let values = vec![json!("pear"), json!("apple"), json!("zucchini")];
        assert_eq!(min(&values), json!("apple"));
        assert_eq!(max(&values), json!("zucchini"));
    }

    #[test]
    fn test_count_distinct_numeric_equality() {
        let values = vec![json!(1), json!(1.0), json!(2), Value::Null, json!("1")];
        assert_eq!(count_distinct(&values), 3);
    }

    #[test]
    fn test_count_distinct_nested_values() {
        let values = vec![
            json!([1, 2]),
            json!([1.0, 2]),
            json!({"a": 1, "b": "x"}),
            json!({"b": "x", "a": 1.0}),
            json!(2.5),
        ];
        assert_eq!(count_distinct(&values), 3);

        let many: Vec<Value> = (0..10_000).map(|i| json!(i % 250)).collect();
        assert_eq!(count_distinct(&many), 250);
    }

    #[test]
    fn test_projection_serialization() {
        assert_eq!(
            serde_json::to_value(Projection::Max("age".to_string())).unwrap(),
            json!({"type": "max", "property": "age"})
        );
        assert_eq!(serde_json::to_value(Projection::Count).unwrap(), json!({"type": "count"}));
    }
}
