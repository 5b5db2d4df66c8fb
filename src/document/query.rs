//! Criteria compilation for the document store
//!
//! Converts a criteria [`Junction`] into a filter document plus a list of
//! sort keys. Identical criteria always produce structurally equal
//! output: filter documents are key-ordered maps.
//!
//! # Translation
//! - Conjunction: clauses merged into one document; clashing clauses on the
//!   same field move to `$and`
//! - Disjunction: `$or`
//! - Negation: the negated form of each criterion, conjoined
//! - Like/ILike: anchored `$regex` (`$options: "i"` for ILike); RLike: raw
//! - Property comparison: `$where: "this.a <op> this.b"`
//! - Embedded association: dotted paths; embedded collection: `$elemMatch`
//! - Reference association: rejected, the store has no joins
//! - Geospatial: `$near`, `$within` with `$box` or `$center`

use std::borrow::Cow;

use serde::Serialize;
use serde_json::{Value, json};

use super::{CLASS_FIELD, Document, ID_FIELD, field_name};
use crate::error::{DatastoreError, Result};
use crate::model::{MappingContext, PersistentEntity, PersistentProperty, PropertyKind};
use crate::query::{Criterion, Direction, Junction, JunctionKind, Operator, Order};

/// A compiled document query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentQuery {
    pub collection: String,
    pub filter: Document,
    /// `(field, 1 | -1)` in priority order
    pub sort: Vec<(String, i32)>,
}

/// Compile criteria and ordering for `entity`, stored in `collection`
///
/// Queries on a non-root entity are restricted to its own discriminator and
/// those of its descendants.
pub fn compile_query(
    context: &MappingContext,
    entity: &PersistentEntity,
    collection: impl Into<String>,
    criteria: &Junction,
    orders: &[Order],
) -> Result<DocumentQuery> {
    let mut filter = build_filter(context, entity, criteria)?;
    if !entity.is_root() {
        let discriminators = descendant_discriminators(context, entity);
        let clause = match discriminators.as_slice() {
            [single] => json!(single),
            _ => json!({"$in": discriminators}),
        };
        put_clause(&mut filter, CLASS_FIELD.to_string(), clause);
    }

    Ok(DocumentQuery {
        collection: collection.into(),
        filter,
        sort: build_sort(context, entity, orders)?,
    })
}

/// Translate a junction into a filter document
pub fn build_filter(context: &MappingContext, entity: &PersistentEntity, criteria: &Junction) -> Result<Document> {
    Compiler { context }.junction(entity, criteria)
}

/// Translate orderings into `(field, direction)` pairs
pub fn build_sort(context: &MappingContext, entity: &PersistentEntity, orders: &[Order]) -> Result<Vec<(String, i32)>> {
    let compiler = Compiler { context };
    orders
        .iter()
        .map(|order| {
            let field = compiler.resolve_field(entity, &order.property).map_err(|_| {
                DatastoreError::illegal_argument(format!(
                    "Invalid sort field: '{}' is not a property of {}",
                    order.property,
                    entity.name()
                ))
            })?;
            let direction = match order.direction {
                Direction::Asc => 1,
                Direction::Desc => -1,
            };
            Ok((field, direction))
        })
        .collect()
}

/// Convert a `%`-wildcard pattern into an anchored regular expression
///
/// Literal segments are escaped; the expression is anchored at the start
/// unless the pattern starts with `%` and at the end unless it ends with one.
pub fn like_to_regex(pattern: &str) -> String {
    let body = pattern
        .split('%')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    let start = if pattern.starts_with('%') { "" } else { "^" };
    let end = if pattern.ends_with('%') { "" } else { "$" };
    format!("{}{}{}", start, body, end)
}

/// Field holding the key of a to-one target
pub(crate) fn reference_path(property: &PersistentProperty) -> String {
    let field = field_name(property);
    if property.mapping().reference {
        format!("{}.$id", field)
    } else {
        field
    }
}

fn descendant_discriminators(context: &MappingContext, entity: &PersistentEntity) -> Vec<String> {
    std::iter::once(entity.discriminator().to_string())
        .chain(
            context
                .descendants(entity.name())
                .iter()
                .map(|e| e.discriminator().to_string()),
        )
        .collect()
}

/// Add `key: value` to a filter, moving clashing clauses into `$and`
fn put_clause(filter: &mut Document, key: String, value: Value) {
    if key == "$and" {
        if let Value::Array(items) = value {
            for item in items {
                push_and(filter, item);
            }
            return;
        }
    }

    match filter.get_mut(&key) {
        None => {
            filter.insert(key, value);
        }
        Some(existing) => {
            let mergeable = match (&*existing, &value) {
                (Value::Object(a), Value::Object(b)) => {
                    is_operator_map(a) && is_operator_map(b) && b.keys().all(|k| !a.contains_key(k))
                }
                _ => false,
            };
            if mergeable {
                if let (Value::Object(target), Value::Object(extra)) = (existing, value) {
                    target.extend(extra);
                }
            } else {
                let mut clause = Document::new();
                clause.insert(key, value);
                push_and(filter, Value::Object(clause));
            }
        }
    }
}

fn push_and(filter: &mut Document, clause: Value) {
    let entry = filter
        .entry("$and".to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(items) = entry {
        items.push(clause);
    }
}

fn is_operator_map(map: &Document) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

fn merge(target: &mut Document, fragment: Document) {
    for (key, value) in fragment {
        put_clause(target, key, value);
    }
}

fn single(field: String, value: Value) -> Document {
    let mut document = Document::new();
    document.insert(field, value);
    document
}

fn operator_key(operator: Operator) -> &'static str {
    match operator {
        Operator::Eq => "$eq",
        Operator::Ne => "$ne",
        Operator::Gt => "$gt",
        Operator::Gte => "$gte",
        Operator::Lt => "$lt",
        Operator::Lte => "$lte",
    }
}

struct Compiler<'a> {
    context: &'a MappingContext,
}

impl Compiler<'_> {
    fn junction(&self, entity: &PersistentEntity, junction: &Junction) -> Result<Document> {
        match junction.kind {
            JunctionKind::Conjunction | JunctionKind::Negation => {
                let negated = junction.kind == JunctionKind::Negation;
                let mut filter = Document::new();
                for criterion in &junction.criteria {
                    merge(&mut filter, self.criterion(entity, criterion, negated)?);
                }
                Ok(filter)
            }
            JunctionKind::Disjunction => {
                let mut branches = junction
                    .criteria
                    .iter()
                    .map(|c| self.criterion(entity, c, false))
                    .collect::<Result<Vec<_>>>()?;
                Ok(match branches.len() {
                    0 => Document::new(),
                    1 => branches.remove(0),
                    _ => single(
                        "$or".to_string(),
                        Value::Array(branches.into_iter().map(Value::Object).collect()),
                    ),
                })
            }
        }
    }

    fn criterion(&self, entity: &PersistentEntity, criterion: &Criterion, negated: bool) -> Result<Document> {
        let unsupported_negation = || {
            DatastoreError::unsupported_query(format!(
                "no negated form for {} criteria",
                criterion.name()
            ))
        };

        Ok(match criterion {
            Criterion::IdEquals { value } => {
                let clause = if negated { json!({"$ne": value}) } else { value.clone() };
                single(ID_FIELD.to_string(), clause)
            }
            Criterion::Comparison {
                property,
                operator,
                value,
            } => {
                let field = self.resolve_field(entity, property)?;
                // Range operators never match a missing value, so their
                // complement is $not rather than the inverse operator
                let clause = match (*operator, negated) {
                    (Operator::Eq, false) | (Operator::Ne, true) => value.clone(),
                    (Operator::Eq, true) => json!({"$ne": value}),
                    (other, false) => json!({ operator_key(other): value }),
                    (other, true) => json!({"$not": { operator_key(other): value }}),
                };
                single(field, clause)
            }
            Criterion::Like { property, pattern } => {
                self.pattern(entity, property, like_to_regex(pattern), None, negated)?
            }
            Criterion::ILike { property, pattern } => {
                self.pattern(entity, property, like_to_regex(pattern), Some("i"), negated)?
            }
            Criterion::RLike { property, pattern } => {
                self.pattern(entity, property, pattern.clone(), None, negated)?
            }
            Criterion::In { property, values } => {
                let field = self.resolve_field(entity, property)?;
                let operator = if negated { "$nin" } else { "$in" };
                single(field, json!({ operator: values }))
            }
            Criterion::Between { property, from, to } => {
                let field = self.resolve_field(entity, property)?;
                let range = json!({"$gte": from, "$lte": to});
                single(field, if negated { json!({"$not": range}) } else { range })
            }
            Criterion::IsNull { property } => {
                let field = self.resolve_field(entity, property)?;
                single(field, if negated { json!({"$ne": null}) } else { Value::Null })
            }
            Criterion::IsNotNull { property } => {
                let field = self.resolve_field(entity, property)?;
                single(field, if negated { Value::Null } else { json!({"$ne": null}) })
            }
            Criterion::PropertyComparison {
                property,
                other,
                operator,
            } => {
                let left = self.resolve_field(entity, property)?;
                let right = self.resolve_field(entity, other)?;
                let clause = single(
                    "$where".to_string(),
                    Value::String(format!("this.{} {} this.{}", left, operator.symbol(), right)),
                );
                if negated {
                    single("$nor".to_string(), json!([clause]))
                } else {
                    clause
                }
            }
            Criterion::Near { property, point } => {
                if negated {
                    return Err(unsupported_negation());
                }
                single(self.resolve_field(entity, property)?, json!({"$near": point}))
            }
            Criterion::WithinBox {
                property,
                lower_left,
                upper_right,
            } => {
                if negated {
                    return Err(unsupported_negation());
                }
                single(
                    self.resolve_field(entity, property)?,
                    json!({"$within": {"$box": [lower_left, upper_right]}}),
                )
            }
            Criterion::WithinCircle {
                property,
                center,
                radius,
            } => {
                if negated {
                    return Err(unsupported_negation());
                }
                single(
                    self.resolve_field(entity, property)?,
                    json!({"$within": {"$center": [center, radius]}}),
                )
            }
            Criterion::Association { property, criteria } => {
                if negated {
                    return Err(unsupported_negation());
                }
                self.association(entity, property, criteria)?
            }
            Criterion::Junction(junction) => {
                if negated {
                    return Err(unsupported_negation());
                }
                self.junction(entity, junction)?
            }
        })
    }

    fn pattern(
        &self,
        entity: &PersistentEntity,
        property: &str,
        regex: String,
        options: Option<&str>,
        negated: bool,
    ) -> Result<Document> {
        let field = self.resolve_field(entity, property)?;
        let mut clause = Document::new();
        clause.insert("$regex".to_string(), Value::String(regex));
        if let Some(options) = options {
            clause.insert("$options".to_string(), Value::String(options.to_string()));
        }
        let clause = Value::Object(clause);
        Ok(single(field, if negated { json!({"$not": clause}) } else { clause }))
    }

    fn association(&self, entity: &PersistentEntity, name: &str, criteria: &Junction) -> Result<Document> {
        let property = self.find_property(entity, name)?;
        let target = match property.kind().target() {
            Some(target) => self.context.persistent_entity(target).ok_or_else(|| {
                DatastoreError::mapping(format!("unknown association target '{}'", target))
            })?,
            None => {
                return Err(DatastoreError::illegal_argument(format!(
                    "{}.{} is not an association",
                    entity.name(),
                    name
                )));
            }
        };
        let field = field_name(&property);

        match property.kind() {
            PropertyKind::Embedded { .. } => {
                let inner = self.junction(&target, criteria)?;
                prefix_fields(inner, &field)
            }
            PropertyKind::EmbeddedCollection { .. } => {
                let inner = self.junction(&target, criteria)?;
                if contains_where(&inner) {
                    return Err(DatastoreError::unsupported_query(format!(
                        "property comparisons inside embedded collection {}.{}",
                        entity.name(),
                        name
                    )));
                }
                Ok(single(field, json!({"$elemMatch": inner})))
            }
            _ => Err(DatastoreError::unsupported_query(format!(
                "join on {}.{}: associated {} is stored in another collection",
                entity.name(),
                name,
                target.name()
            ))),
        }
    }

    /// Property of `entity`, or of one of its subtypes
    fn find_property<'e>(
        &self,
        entity: &'e PersistentEntity,
        name: &str,
    ) -> Result<Cow<'e, PersistentProperty>> {
        self.context.hierarchy_property(entity, name)
    }

    /// Document path of a (possibly dotted) property name
    fn resolve_field(&self, entity: &PersistentEntity, name: &str) -> Result<String> {
        if let Some((head, rest)) = name.split_once('.') {
            let property = self.find_property(entity, head)?;
            let target = property
                .kind()
                .target()
                .and_then(|t| self.context.persistent_entity(t));
            return match (property.kind(), target) {
                (PropertyKind::Embedded { .. } | PropertyKind::EmbeddedCollection { .. }, Some(target)) => {
                    Ok(format!("{}.{}", field_name(&property), self.resolve_field(&target, rest)?))
                }
                (kind, Some(target)) if kind.is_to_one() => {
                    let is_identity = target.identity().is_some_and(|id| id.name() == rest);
                    if is_identity {
                        Ok(reference_path(&property))
                    } else {
                        Err(DatastoreError::unsupported_query(format!(
                            "join on {}.{}: only the identifier of a referenced entity can be queried",
                            entity.name(),
                            head
                        )))
                    }
                }
                _ => Err(DatastoreError::illegal_argument(format!(
                    "{}.{} cannot be navigated",
                    entity.name(),
                    head
                ))),
            };
        }

        let property = self.find_property(entity, name)?;
        Ok(match property.kind() {
            PropertyKind::Identity => ID_FIELD.to_string(),
            kind if kind.is_to_one() => reference_path(&property),
            _ => field_name(&property),
        })
    }
}

/// Re-root a filter below `prefix`
fn prefix_fields(filter: Document, prefix: &str) -> Result<Document> {
    let mut prefixed = Document::new();
    for (key, value) in filter {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let Value::Array(items) = value else {
                    return Err(DatastoreError::backend(format!("{} requires an array", key)));
                };
                let items = items
                    .into_iter()
                    .map(|item| match item {
                        Value::Object(inner) => prefix_fields(inner, prefix).map(Value::Object),
                        other => Ok(other),
                    })
                    .collect::<Result<Vec<_>>>()?;
                prefixed.insert(key, Value::Array(items));
            }
            "$where" => {
                let expression = value.as_str().unwrap_or_default();
                let rewritten = expression.replace("this.", &format!("this.{}.", prefix));
                prefixed.insert(key, Value::String(rewritten));
            }
            _ => {
                prefixed.insert(format!("{}.{}", prefix, key), value);
            }
        }
    }
    Ok(prefixed)
}

fn contains_where(filter: &Document) -> bool {
    filter.iter().any(|(key, value)| {
        key == "$where"
            || value
                .as_array()
                .is_some_and(|items| items.iter().filter_map(Value::as_object).any(contains_where))
    })
}
