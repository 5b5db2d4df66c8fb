//! Key-value store backend
//!
//! Maps entities onto a Redis-like store:
//!
//! - each instance is a flat hash at `<family>:<id>`, with a `_class` field
//!   for subtypes
//! - identifiers are integers drawn from an `INCR` counter at
//!   `<family>.next_id`; the set `<family>.all` lists every stored id
//! - to-one references hold the raw target id
//! - to-many associations are side lists (or sets) at `<family>:<id>:<name>`
//! - properties mapped with `index` get value sets at
//!   `<family>:<property>:<value>`
//!
//! Queries are answered from those structures only: identifier lookups and
//! equality (or `in`) on indexed properties, conjoined. Anything else is
//! rejected. There are no transactions.

pub mod backend;
pub mod memory;

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::Result;

pub use backend::{KeyValueBackend, KeyValueQuery};
pub use memory::{MemoryKeyValueClient, MemoryKeyValueConnection};

/// Native entry of the key-value store
pub type Hash = BTreeMap<String, Value>;

/// Hash field holding the discriminator of non-root entities
pub const CLASS_FIELD: &str = "_class";

/// One command sent to the native store
#[derive(Debug, Clone, PartialEq)]
pub enum KeyValueCommand {
    HGetAll {
        key: String,
    },
    /// Replace the whole hash; with `only_if` the write applies only when the
    /// stored hash holds that field value
    HSetAll {
        key: String,
        hash: Hash,
        only_if: Option<(String, Value)>,
    },
    Del {
        keys: Vec<String>,
    },
    Incr {
        key: String,
    },
    SAdd {
        key: String,
        members: Vec<String>,
    },
    SRem {
        key: String,
        members: Vec<String>,
    },
    SMembers {
        key: String,
    },
    RPush {
        key: String,
        values: Vec<String>,
    },
    LRange {
        key: String,
    },
}

/// Reply to a [`KeyValueCommand`]
#[derive(Debug, Clone, PartialEq)]
pub enum KeyValueReply {
    Hash(Option<Hash>),
    Integer(i64),
    /// Set members in sorted order, list values in stored order
    Members(Vec<String>),
}

impl KeyValueReply {
    pub fn into_hash(self) -> Option<Hash> {
        match self {
            KeyValueReply::Hash(hash) => hash,
            _ => None,
        }
    }

    pub fn into_members(self) -> Vec<String> {
        match self {
            KeyValueReply::Members(members) => members,
            _ => Vec::new(),
        }
    }

    pub fn integer(&self) -> i64 {
        match self {
            KeyValueReply::Integer(n) => *n,
            _ => 0,
        }
    }
}

/// One open connection to a key-value store
pub trait KeyValueConnection: 'static {
    fn execute(&mut self, command: KeyValueCommand) -> Result<KeyValueReply>;

    /// Give the connection back; further commands fail
    fn release(&mut self) -> Result<()>;
}

/// String form of a value inside keys and set members
pub(crate) fn member(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_member_encoding() {
        assert_eq!(member(&json!("red")), "red");
        assert_eq!(member(&json!(12)), "12");
        assert_eq!(member(&json!(true)), "true");
    }

    #[test]
    fn test_reply_accessors() {
        assert_eq!(KeyValueReply::Integer(4).integer(), 4);
        assert!(KeyValueReply::Integer(4).into_hash().is_none());
        assert_eq!(
            KeyValueReply::Members(vec!["1".to_string()]).into_members(),
            vec!["1".to_string()]
        );
    }
}
