//! Filter document evaluation
//!
//! Evaluates the filter documents produced by the query compiler against
//! stored documents, the way a Mongo-like server would. Used by the
//! in-memory client; any server-side implementation must agree with it.
//!
//! # Supported Operations
//! - Logical: `$and`, `$or`, `$nor`, `$not`
//! - Comparison: `$eq`, `$ne`, `$gt`, `$gte`, `$lt`, `$lte`, `$in`, `$nin`
//! - Presence: `$exists`, literal `null`
//! - Pattern: `$regex` (+ `$options: "i"`)
//! - Arrays: `$elemMatch`, and "any element" semantics for literals
//! - Record expressions: `$where: "this.a <op> this.b"`
//! - Geospatial: `$near`, `$within` with `$box` or `$center`

use std::cmp::Ordering;

use regex::Regex;
use serde_json::Value;

use super::Document;
use crate::error::{DatastoreError, Result};
use crate::query::Point;
use crate::types::{compare_values, values_equal};

/// Whether `document` satisfies every clause of `filter`
pub fn matches(filter: &Document, document: &Document) -> Result<bool> {
    for (key, condition) in filter {
        let satisfied = match key.as_str() {
            "$and" => sub_filters(key, condition)?
                .into_iter()
                .map(|f| matches(f, document))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .all(|m| m),
            "$or" => {
                let mut any = false;
                for f in sub_filters(key, condition)? {
                    if matches(f, document)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for f in sub_filters(key, condition)? {
                    if matches(f, document)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            "$where" => {
                let expression = condition.as_str().ok_or_else(|| {
                    DatastoreError::backend("$where requires a string expression")
                })?;
                evaluate_where(expression, document)?
            }
            _ => {
                let value = lookup(document, key);
                evaluate_condition(condition, value.as_ref())?
            }
        };
        if !satisfied {
            return Ok(false);
        }
    }
    Ok(true)
}

fn sub_filters<'a>(operator: &str, condition: &'a Value) -> Result<Vec<&'a Document>> {
    let items = condition
        .as_array()
        .ok_or_else(|| DatastoreError::backend(format!("{} requires an array", operator)))?;
    items
        .iter()
        .map(|item| {
            item.as_object().ok_or_else(|| {
                DatastoreError::backend(format!("{} elements must be documents", operator))
            })
        })
        .collect()
}

/// Resolve a dotted path; arrays on the way yield the values of their elements
pub fn lookup(document: &Document, path: &str) -> Option<Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let (first, rest) = segments.split_first()?;
    document.get(*first).and_then(|v| lookup_value(v, rest))
}

fn lookup_value(value: &Value, segments: &[&str]) -> Option<Value> {
    let Some((first, rest)) = segments.split_first() else {
        return Some(value.clone());
    };
    match value {
        Value::Object(map) => map.get(*first).and_then(|v| lookup_value(v, rest)),
        Value::Array(items) => {
            let found: Vec<Value> = items
                .iter()
                .filter_map(|item| lookup_value(item, segments))
                .collect();
            if found.is_empty() {
                None
            } else {
                Some(Value::Array(found))
            }
        }
        _ => None,
    }
}

/// A `{$op: arg, ...}` document, as opposed to a literal such as a reference
fn is_operator_document(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            !map.is_empty()
                && map.keys().all(|k| k.starts_with('$'))
                && !map.contains_key("$ref")
                && !map.contains_key("$id")
        }
        _ => false,
    }
}

fn evaluate_condition(condition: &Value, value: Option<&Value>) -> Result<bool> {
    match condition {
        Value::Object(operators) if is_operator_document(condition) => {
            evaluate_operators(operators, value)
        }
        literal => Ok(equals_literal(value, literal)),
    }
}

fn equals_literal(value: Option<&Value>, expected: &Value) -> bool {
    if expected.is_null() {
        return value.is_none_or(Value::is_null);
    }
    match value {
        None => false,
        Some(Value::Array(items)) => {
            values_equal(&Value::Array(items.clone()), expected)
                || items.iter().any(|item| values_equal(item, expected))
        }
        Some(v) => values_equal(v, expected),
    }
}

/// Candidate values for element-wise operators: array elements or the value itself
fn candidates(value: Option<&Value>) -> Vec<&Value> {
    match value {
        None => Vec::new(),
        Some(Value::Array(items)) => items.iter().collect(),
        Some(v) => vec![v],
    }
}

fn evaluate_operators(operators: &Document, value: Option<&Value>) -> Result<bool> {
    for (operator, argument) in operators {
        let satisfied = match operator.as_str() {
            "$eq" => equals_literal(value, argument),
            "$ne" => !equals_literal(value, argument),
            "$gt" => compares(value, argument, |o| o == Ordering::Greater),
            "$gte" => compares(value, argument, |o| o != Ordering::Less),
            "$lt" => compares(value, argument, |o| o == Ordering::Less),
            "$lte" => compares(value, argument, |o| o != Ordering::Greater),
            "$in" => in_list(value, argument)?,
            "$nin" => !in_list(value, argument)?,
            "$exists" => value.is_some() == argument.as_bool().unwrap_or(true),
            "$regex" => {
                let options = operators.get("$options").and_then(Value::as_str).unwrap_or("");
                regex_matches(value, argument, options)?
            }
            "$options" => true,
            "$not" => match argument {
                Value::Object(inner) if is_operator_document(argument) => {
                    !evaluate_operators(inner, value)?
                }
                _ => return Err(DatastoreError::backend("$not requires an operator document")),
            },
            "$elemMatch" => elem_match(value, argument)?,
            "$near" => value.and_then(as_point).is_some(),
            "$within" => within(value, argument)?,
            other => {
                return Err(DatastoreError::backend(format!(
                    "unsupported filter operator {}",
                    other
                )));
            }
        };
        if !satisfied {
            return Ok(false);
        }
    }
    Ok(true)
}

fn compares(value: Option<&Value>, argument: &Value, wanted: impl Fn(Ordering) -> bool) -> bool {
    candidates(value)
        .into_iter()
        .any(|v| compare_values(v, argument).is_some_and(&wanted))
}

fn in_list(value: Option<&Value>, argument: &Value) -> Result<bool> {
    let options = argument
        .as_array()
        .ok_or_else(|| DatastoreError::backend("$in/$nin require an array"))?;
    Ok(options.iter().any(|option| equals_literal(value, option)))
}

fn regex_matches(value: Option<&Value>, pattern: &Value, options: &str) -> Result<bool> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| DatastoreError::backend("$regex requires a string pattern"))?;
    let source = if options.contains('i') {
        format!("(?i){}", pattern)
    } else {
        pattern.to_string()
    };
    let re = Regex::new(&source)
        .map_err(|e| DatastoreError::backend(format!("invalid regular expression: {}", e)))?;
    Ok(candidates(value)
        .into_iter()
        .any(|v| v.as_str().is_some_and(|s| re.is_match(s))))
}

fn elem_match(value: Option<&Value>, argument: &Value) -> Result<bool> {
    let Some(Value::Array(items)) = value else {
        return Ok(false);
    };
    let Value::Object(filter) = argument else {
        return Err(DatastoreError::backend("$elemMatch requires a document"));
    };
    let operator_form = is_operator_document(argument);
    for item in items {
        let matched = match item {
            Value::Object(element) if !operator_form => matches(filter, element)?,
            other if operator_form => evaluate_operators(filter, Some(other))?,
            _ => false,
        };
        if matched {
            return Ok(true);
        }
    }
    Ok(false)
}

// ============================================================================
// Geospatial
// ============================================================================

fn as_point(value: &Value) -> Option<Point> {
    let items = value.as_array()?;
    match items.as_slice() {
        [x, y] => Some([x.as_f64()?, y.as_f64()?]),
        _ => None,
    }
}

fn within(value: Option<&Value>, argument: &Value) -> Result<bool> {
    let Some(point) = value.and_then(as_point) else {
        return Ok(false);
    };
    if let Some(corners) = argument.get("$box") {
        let bounds = corners.as_array().map(|c| c.iter().filter_map(as_point).collect::<Vec<_>>());
        let Some([lower_left, upper_right]) = bounds.as_deref() else {
            return Err(DatastoreError::backend("$box requires two points"));
        };
        return Ok(point[0] >= lower_left[0]
            && point[0] <= upper_right[0]
            && point[1] >= lower_left[1]
            && point[1] <= upper_right[1]);
    }
    if let Some(circle) = argument.get("$center") {
        let parsed = circle.as_array().and_then(|c| match c.as_slice() {
            [center, radius] => Some((as_point(center)?, radius.as_f64()?)),
            _ => None,
        });
        let Some((center, radius)) = parsed else {
            return Err(DatastoreError::backend("$center requires a point and a radius"));
        };
        return Ok(distance(point, center) <= radius);
    }
    Err(DatastoreError::backend("$within requires $box or $center"))
}

fn distance(a: Point, b: Point) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
}

/// First top-level `{field: {$near: point}}` clause of a filter
pub fn near_clause(filter: &Document) -> Option<(String, Point)> {
    filter.iter().find_map(|(field, condition)| {
        let point = condition.get("$near").and_then(as_point)?;
        Some((field.clone(), point))
    })
}

/// Order documents by distance of `field` from `origin`, nearest first
pub fn sort_by_distance(documents: &mut [Document], field: &str, origin: Point) {
    let key = |document: &Document| {
        lookup(document, field)
            .as_ref()
            .and_then(as_point)
            .map(|p| distance(p, origin))
            .unwrap_or(f64::INFINITY)
    };
    documents.sort_by(|a, b| key(a).total_cmp(&key(b)));
}

// ============================================================================
// $where Expressions
// ============================================================================

/// Evaluate `this.<path> <op> this.<path>`
fn evaluate_where(expression: &str, document: &Document) -> Result<bool> {
    let re = Regex::new(r"^\s*this\.([A-Za-z0-9_.$-]+)\s*(==|!=|>=|<=|>|<)\s*this\.([A-Za-z0-9_.$-]+)\s*$")
        .map_err(|e| DatastoreError::backend(e.to_string()))?;
    let captures = re.captures(expression).ok_or_else(|| {
        DatastoreError::backend(format!("unsupported $where expression: {}", expression))
    })?;

    let left = lookup(document, &captures[1]);
    let right = lookup(document, &captures[3]);
    let equal = match (&left, &right) {
        (Some(l), Some(r)) => values_equal(l, r),
        _ => false,
    };
    let ordering = match (&left, &right) {
        (Some(l), Some(r)) => compare_values(l, r),
        _ => None,
    };

    Ok(match &captures[2] {
        "==" => equal,
        "!=" => !equal,
        ">" => ordering == Some(Ordering::Greater),
        ">=" => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        "<" => ordering == Some(Ordering::Less),
        _ => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
    })
}

// ============================================================================
// Sorting
// ============================================================================

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

/// Stable sort by `(field, 1 | -1)` keys in priority order
///
/// Missing and null values sort first in ascending order.
pub fn sort_documents(documents: &mut [Document], sort: &[(String, i32)]) {
    if sort.is_empty() {
        return;
    }
    documents.sort_by(|a, b| {
        for (field, direction) in sort {
            let left = lookup(a, field);
            let right = lookup(b, field);
            let ordering = type_rank(left.as_ref())
                .cmp(&type_rank(right.as_ref()))
                .then_with(|| match (&left, &right) {
                    (Some(l), Some(r)) => compare_values(l, r).unwrap_or(Ordering::Equal),
                    _ => Ordering::Equal,
                });
            let ordering = if *direction < 0 { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}
