//! Backend-neutral criteria tree
//!
//! A [`Junction`] holds [`Criterion`] nodes and nested junctions. Trees are
//! built with the [`restrictions`] helpers and compiled by each backend into
//! its native query form.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operator shared by value and property-to-property criteria
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Operator {
    /// Logical inverse: `Gt` becomes `Lte`, `Eq` becomes `Ne`
    pub fn negate(self) -> Self {
        match self {
            Operator::Eq => Operator::Ne,
            Operator::Ne => Operator::Eq,
            Operator::Gt => Operator::Lte,
            Operator::Gte => Operator::Lt,
            Operator::Lt => Operator::Gte,
            Operator::Lte => Operator::Gt,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
        }
    }
}

/// A 2-d point as `[x, y]`
pub type Point = [f64; 2];

/// A single restriction on the candidate records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Criterion {
    /// Identifier equals value
    IdEquals { value: Value },
    Comparison {
        property: String,
        operator: Operator,
        value: Value,
    },
    /// Case-sensitive `%` wildcard pattern
    Like { property: String, pattern: String },
    /// Case-insensitive `%` wildcard pattern
    ILike { property: String, pattern: String },
    /// Raw regular expression
    RLike { property: String, pattern: String },
    In { property: String, values: Vec<Value> },
    /// Inclusive range
    Between {
        property: String,
        from: Value,
        to: Value,
    },
    IsNull { property: String },
    IsNotNull { property: String },
    /// Compare two properties of the same record
    PropertyComparison {
        property: String,
        other: String,
        operator: Operator,
    },
    Near { property: String, point: Point },
    WithinBox {
        property: String,
        lower_left: Point,
        upper_right: Point,
    },
    WithinCircle {
        property: String,
        center: Point,
        radius: f64,
    },
    /// Sub-criteria applied to the target of an association
    Association { property: String, criteria: Junction },
    Junction(Junction),
}

impl Criterion {
    /// Property this criterion restricts, if it names one
    pub fn property(&self) -> Option<&str> {
        match self {
            Criterion::Comparison { property, .. }
            | Criterion::Like { property, .. }
            | Criterion::ILike { property, .. }
            | Criterion::RLike { property, .. }
            | Criterion::In { property, .. }
            | Criterion::Between { property, .. }
            | Criterion::IsNull { property }
            | Criterion::IsNotNull { property }
            | Criterion::PropertyComparison { property, .. }
            | Criterion::Near { property, .. }
            | Criterion::WithinBox { property, .. }
            | Criterion::WithinCircle { property, .. }
            | Criterion::Association { property, .. } => Some(property),
            Criterion::IdEquals { .. } | Criterion::Junction(_) => None,
        }
    }

    /// Variant name, for messages
    pub fn name(&self) -> &'static str {
        match self {
            Criterion::IdEquals { .. } => "IdEquals",
            Criterion::Comparison { .. } => "Comparison",
            Criterion::Like { .. } => "Like",
            Criterion::ILike { .. } => "ILike",
            Criterion::RLike { .. } => "RLike",
            Criterion::In { .. } => "In",
            Criterion::Between { .. } => "Between",
            Criterion::IsNull { .. } => "IsNull",
            Criterion::IsNotNull { .. } => "IsNotNull",
            Criterion::PropertyComparison { .. } => "PropertyComparison",
            Criterion::Near { .. } => "Near",
            Criterion::WithinBox { .. } => "WithinBox",
            Criterion::WithinCircle { .. } => "WithinCircle",
            Criterion::Association { .. } => "Association",
            Criterion::Junction(_) => "Junction",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JunctionKind {
    /// All criteria match
    #[default]
    Conjunction,
    /// At least one criterion matches
    Disjunction,
    /// None of the criteria match
    Negation,
}

/// Group of criteria combined by `kind`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Junction {
    pub kind: JunctionKind,
    pub criteria: Vec<Criterion>,
}

impl Junction {
    pub fn conjunction() -> Self {
        Self::of(JunctionKind::Conjunction)
    }

    pub fn disjunction() -> Self {
        Self::of(JunctionKind::Disjunction)
    }

    pub fn negation() -> Self {
        Self::of(JunctionKind::Negation)
    }

    fn of(kind: JunctionKind) -> Self {
        Self {
            kind,
            criteria: Vec::new(),
        }
    }

    /// Append a criterion
    pub fn add(mut self, criterion: Criterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    pub fn push(&mut self, criterion: Criterion) {
        self.criteria.push(criterion);
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }
}

// ============================================================================
// Ordering
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

/// Sort on one property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub property: String,
    pub direction: Direction,
}

impl Order {
    pub fn asc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            direction: Direction::Desc,
        }
    }
}

// ============================================================================
// Restriction Helpers
// ============================================================================

/// Helper functions to create [`Criterion`] instances
pub mod restrictions {
    use super::*;

    fn compare(property: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Criterion {
        Criterion::Comparison {
            property: property.into(),
            operator,
            value: value.into(),
        }
    }

    fn compare_properties(
        property: impl Into<String>,
        other: impl Into<String>,
        operator: Operator,
    ) -> Criterion {
        Criterion::PropertyComparison {
            property: property.into(),
            other: other.into(),
            operator,
        }
    }

    pub fn id_eq(value: impl Into<Value>) -> Criterion {
        Criterion::IdEquals {
            value: value.into(),
        }
    }

    /// property == value
    pub fn eq(property: impl Into<String>, value: impl Into<Value>) -> Criterion {
        compare(property, Operator::Eq, value)
    }

    /// property != value
    pub fn ne(property: impl Into<String>, value: impl Into<Value>) -> Criterion {
        compare(property, Operator::Ne, value)
    }

    pub fn gt(property: impl Into<String>, value: impl Into<Value>) -> Criterion {
        compare(property, Operator::Gt, value)
    }

    pub fn ge(property: impl Into<String>, value: impl Into<Value>) -> Criterion {
        compare(property, Operator::Gte, value)
    }

    pub fn lt(property: impl Into<String>, value: impl Into<Value>) -> Criterion {
        compare(property, Operator::Lt, value)
    }

    pub fn le(property: impl Into<String>, value: impl Into<Value>) -> Criterion {
        compare(property, Operator::Lte, value)
    }

    pub fn like(property: impl Into<String>, pattern: impl Into<String>) -> Criterion {
        Criterion::Like {
            property: property.into(),
            pattern: pattern.into(),
        }
    }

    pub fn ilike(property: impl Into<String>, pattern: impl Into<String>) -> Criterion {
        Criterion::ILike {
            property: property.into(),
            pattern: pattern.into(),
        }
    }

    pub fn rlike(property: impl Into<String>, pattern: impl Into<String>) -> Criterion {
        Criterion::RLike {
            property: property.into(),
            pattern: pattern.into(),
        }
    }

    pub fn in_list<V: Into<Value>>(
        property: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Criterion {
        Criterion::In {
            property: property.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// from <= property <= to
    pub fn between(
        property: impl Into<String>,
        from: impl Into<Value>,
        to: impl Into<Value>,
    ) -> Criterion {
        Criterion::Between {
            property: property.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn is_null(property: impl Into<String>) -> Criterion {
        Criterion::IsNull {
            property: property.into(),
        }
    }

    pub fn is_not_null(property: impl Into<String>) -> Criterion {
        Criterion::IsNotNull {
            property: property.into(),
        }
    }

    pub fn eq_property(property: impl Into<String>, other: impl Into<String>) -> Criterion {
        compare_properties(property, other, Operator::Eq)
    }

    pub fn ne_property(property: impl Into<String>, other: impl Into<String>) -> Criterion {
        compare_properties(property, other, Operator::Ne)
    }

    pub fn gt_property(property: impl Into<String>, other: impl Into<String>) -> Criterion {
        compare_properties(property, other, Operator::Gt)
    }

    pub fn ge_property(property: impl Into<String>, other: impl Into<String>) -> Criterion {
        compare_properties(property, other, Operator::Gte)
    }

    pub fn lt_property(property: impl Into<String>, other: impl Into<String>) -> Criterion {
        compare_properties(property, other, Operator::Lt)
    }

    pub fn le_property(property: impl Into<String>, other: impl Into<String>) -> Criterion {
        compare_properties(property, other, Operator::Lte)
    }

    pub fn near(property: impl Into<String>, point: Point) -> Criterion {
        Criterion::Near {
            property: property.into(),
            point,
        }
    }

    pub fn within_box(property: impl Into<String>, lower_left: Point, upper_right: Point) -> Criterion {
        Criterion::WithinBox {
            property: property.into(),
            lower_left,
            upper_right,
        }
    }

    pub fn within_circle(property: impl Into<String>, center: Point, radius: f64) -> Criterion {
        Criterion::WithinCircle {
            property: property.into(),
            center,
            radius,
        }
    }

    /// Restrict the target of an association
    pub fn association(property: impl Into<String>, criteria: Vec<Criterion>) -> Criterion {
        Criterion::Association {
            property: property.into(),
            criteria: Junction {
                kind: JunctionKind::Conjunction,
                criteria,
            },
        }
    }

    pub fn and(criteria: Vec<Criterion>) -> Criterion {
        Criterion::Junction(Junction {
            kind: JunctionKind::Conjunction,
            criteria,
        })
    }

    pub fn or(criteria: Vec<Criterion>) -> Criterion {
        Criterion::Junction(Junction {
            kind: JunctionKind::Disjunction,
            criteria,
        })
    }

    /// Match records satisfying none of `criteria`
    pub fn not(criteria: Vec<Criterion>) -> Criterion {
        Criterion::Junction(Junction {
            kind: JunctionKind::Negation,
            criteria,
        })
    }
}
