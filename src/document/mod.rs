//! Document store backend
//!
//! Maps entities onto collections of JSON documents in the style of a
//! Mongo-like store:
//!
//! - one collection per hierarchy, named after the root entity (or its
//!   `family` override); subtypes are told apart by a `_class` field
//! - the identifier lives in `_id`
//! - to-one references are stored as `{"$ref": collection, "$id": key}`
//! - criteria compile to filter documents (see [`query`]), evaluated by the
//!   store (see [`matcher`] for the in-memory evaluator)
//!
//! The native client is reached through [`DocumentConnection`]; an
//! in-memory implementation is provided by [`MemoryDocumentClient`].

pub mod backend;
pub mod client;
pub mod matcher;
pub mod memory;
pub mod query;
pub mod sanitize;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::{PersistentProperty, PropertyKind};

pub use backend::DocumentBackend;
pub use client::{DocumentConnection, DocumentOperation, DocumentResult};
pub use memory::{MemoryDocumentClient, MemoryStats};
pub use query::DocumentQuery;

/// Native entry of the document store
pub type Document = Map<String, Value>;

/// Reserved field holding the identifier
pub const ID_FIELD: &str = "_id";

/// Reserved field holding the discriminator of non-root entities
pub const CLASS_FIELD: &str = "_class";

/// Identifier of a stored document
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocumentKey {
    Int(i64),
    Str(String),
}

impl DocumentKey {
    pub fn to_value(&self) -> Value {
        match self {
            DocumentKey::Int(n) => Value::from(*n),
            DocumentKey::Str(s) => Value::String(s.clone()),
        }
    }
}

impl From<i64> for DocumentKey {
    fn from(n: i64) -> Self {
        DocumentKey::Int(n)
    }
}

impl From<String> for DocumentKey {
    fn from(s: String) -> Self {
        DocumentKey::Str(s)
    }
}

impl From<&str> for DocumentKey {
    fn from(s: &str) -> Self {
        DocumentKey::Str(s.to_string())
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentKey::Int(n) => write!(f, "{}", n),
            DocumentKey::Str(s) => f.write_str(s),
        }
    }
}

/// Document field of a property: `_id` for the identity, else the mapped name
pub(crate) fn field_name(property: &PersistentProperty) -> String {
    match property.kind() {
        PropertyKind::Identity => ID_FIELD.to_string(),
        _ => property
            .mapping()
            .field
            .clone()
            .unwrap_or_else(|| property.name().to_string()),
    }
}

/// Default collection name: the root entity name with a lower-case initial
pub(crate) fn decapitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}
