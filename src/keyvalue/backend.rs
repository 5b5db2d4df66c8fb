//! Key-value store implementation of [`NativeBackend`]

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use serde_json::{Value, json};
use tracing::{debug, trace};

use super::{CLASS_FIELD, Hash, KeyValueCommand, KeyValueConnection, member};
use crate::engine::{AssociationIndexer, NativeBackend, PropertyValueIndexer, VersionGuard};
use crate::error::{DatastoreError, Result};
use crate::model::{
    CollectionKind, IdentityGenerator, MappingContext, PersistentEntity, PersistentProperty,
    PropertyKind,
};
use crate::query::{Criterion, Direction, Junction, JunctionKind, Operator, Order};
use crate::types::{PropertyType, compare_values};

/// One set of candidate keys; a plan intersects all of its lookups
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Ids(Vec<i64>),
    /// Union of the value sets `<prefix>:<value>`
    Index { prefix: String, values: Vec<Value> },
}

/// Compiled key-value query
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValueQuery {
    pub family: String,
    /// Empty means every stored key of the family
    pub lookups: Vec<Lookup>,
    /// Accepted `_class` values; empty accepts any entry
    pub discriminators: Vec<String>,
    pub sort: Vec<(String, Direction)>,
}

/// Backend bound to one open key-value connection
pub struct KeyValueBackend<C: KeyValueConnection> {
    connection: C,
    database: String,
}

impl<C: KeyValueConnection> KeyValueBackend<C> {
    pub fn new(connection: C, database: impl Into<String>) -> Self {
        Self {
            connection,
            database: database.into(),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.connection
    }

    fn entry_key(&self, entity: &PersistentEntity, key: i64) -> String {
        format!("{}:{}", self.family(entity), key)
    }

    fn all_key(&self, entity: &PersistentEntity) -> String {
        format!("{}.all", self.family(entity))
    }

    fn members(&mut self, key: String) -> Result<Vec<String>> {
        Ok(self
            .connection
            .execute(KeyValueCommand::SMembers { key })?
            .into_members())
    }

    fn parse_keys(members: Vec<String>) -> Vec<i64> {
        members.iter().filter_map(|m| m.parse().ok()).collect()
    }

    fn plan(
        &self,
        context: &MappingContext,
        entity: &PersistentEntity,
        junction: &Junction,
        lookups: &mut Vec<Lookup>,
    ) -> Result<()> {
        if junction.kind != JunctionKind::Conjunction {
            return Err(DatastoreError::unsupported_query(format!(
                "key-value store cannot evaluate a {:?} junction",
                junction.kind
            )));
        }

        for criterion in &junction.criteria {
            let lookup = match criterion {
                Criterion::IdEquals { value } => Lookup::Ids(vec![self.key_from_value(value)?]),
                Criterion::Comparison {
                    property,
                    operator: Operator::Eq,
                    value,
                } => self.lookup(context, entity, property, std::slice::from_ref(value))?,
                Criterion::In { property, values } => self.lookup(context, entity, property, values)?,
                Criterion::Junction(inner) => {
                    self.plan(context, entity, inner, lookups)?;
                    continue;
                }
                other => {
                    return Err(DatastoreError::unsupported_query(format!(
                        "key-value store only answers identifier and indexed equality lookups, not {}",
                        other.name()
                    )));
                }
            };
            lookups.push(lookup);
        }
        Ok(())
    }

    fn lookup(&self, context: &MappingContext, entity: &PersistentEntity, name: &str, values: &[Value]) -> Result<Lookup> {
        let property = find_property(context, entity, name)?;
        if matches!(property.kind(), PropertyKind::Identity) {
            let ids = values
                .iter()
                .map(|v| self.key_from_value(v))
                .collect::<Result<Vec<_>>>()?;
            return Ok(Lookup::Ids(ids));
        }
        if !property.mapping().index {
            return Err(DatastoreError::unsupported_query(format!(
                "{}.{} is not indexed",
                entity.name(),
                name
            )));
        }
        Ok(Lookup::Index {
            prefix: format!("{}:{}", self.family(entity), self.property_key(&property)),
            values: values.to_vec(),
        })
    }
}

impl<C: KeyValueConnection> fmt::Debug for KeyValueBackend<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyValueBackend")
            .field("database", &self.database)
            .finish()
    }
}

fn find_property<'e>(
    context: &MappingContext,
    entity: &'e PersistentEntity,
    name: &str,
) -> Result<Cow<'e, PersistentProperty>> {
    context.hierarchy_property(entity, name)
}

fn compare_fields(a: &Hash, b: &Hash, sort: &[(String, Direction)]) -> Ordering {
    for (field, direction) in sort {
        let ordering = match (a.get(field), b.get(field)) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
        };
        let ordering = match direction {
            Direction::Asc => ordering,
            Direction::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

impl<C: KeyValueConnection> NativeBackend for KeyValueBackend<C> {
    type Entry = Hash;
    type Key = i64;
    type Query = KeyValueQuery;

    fn name(&self) -> &str {
        "keyvalue"
    }

    fn validate_entity(&self, entity: &PersistentEntity) -> Result<()> {
        if entity.is_embedded() {
            return Ok(());
        }
        match entity.identity().map(|id| id.property_type()) {
            Some(PropertyType::Integer) => {}
            _ => {
                return Err(DatastoreError::mapping(format!(
                    "{}: the key-value store requires an integer identity",
                    entity.name()
                )));
            }
        }
        for property in entity.properties() {
            if self.property_key(property).contains(':') {
                return Err(DatastoreError::mapping(format!(
                    "{}.{}: field names cannot contain ':'",
                    entity.name(),
                    property.name()
                )));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Entry Mapping
    // =========================================================================

    fn family(&self, entity: &PersistentEntity) -> String {
        entity
            .mapping()
            .family
            .clone()
            .unwrap_or_else(|| entity.root_name().to_string())
    }

    fn create_new_entry(&self, entity: &PersistentEntity) -> Hash {
        let mut hash = Hash::new();
        if !entity.is_root() {
            hash.insert(CLASS_FIELD.to_string(), json!(entity.discriminator()));
        }
        hash
    }

    fn entry_value(&self, entry: &Hash, field: &str) -> Option<Value> {
        entry.get(field).cloned()
    }

    fn set_entry_value(&self, entry: &mut Hash, field: &str, value: Value) {
        if value.is_null() {
            entry.remove(field);
        } else {
            entry.insert(field.to_string(), value);
        }
    }

    fn entry_to_value(&self, entry: Hash) -> Value {
        Value::Object(entry.into_iter().collect())
    }

    fn entry_from_value(&self, value: Value) -> Result<Hash> {
        match value {
            Value::Object(map) => Ok(map.into_iter().collect()),
            other => Err(DatastoreError::conversion(format!(
                "expected an embedded hash, got {}",
                other
            ))),
        }
    }

    fn discriminator(&self, entry: &Hash) -> Option<String> {
        entry
            .get(CLASS_FIELD)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    // =========================================================================
    // Keys and References
    // =========================================================================

    fn key_from_value(&self, value: &Value) -> Result<i64> {
        let key = match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            Value::String(s) => s.parse().ok(),
            _ => None,
        };
        key.ok_or_else(|| {
            DatastoreError::conversion(format!("{} is not a valid key-value store key", value))
        })
    }

    fn key_to_value(&self, key: &i64) -> Value {
        json!(key)
    }

    fn reference(&self, _target: &PersistentEntity, key: &i64, _property: &PersistentProperty) -> Value {
        json!(key)
    }

    fn dereference(&self, value: &Value) -> Option<i64> {
        self.key_from_value(value).ok()
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    fn retrieve_entry(&mut self, entity: &PersistentEntity, key: &i64) -> Result<Option<Hash>> {
        let reply = self.connection.execute(KeyValueCommand::HGetAll {
            key: self.entry_key(entity, *key),
        })?;
        Ok(reply.into_hash())
    }

    fn store_entry(&mut self, entity: &PersistentEntity, key: &i64, entry: Hash) -> Result<()> {
        trace!(entity = %entity.name(), key, "Storing hash");
        self.connection.execute(KeyValueCommand::HSetAll {
            key: self.entry_key(entity, *key),
            hash: entry,
            only_if: None,
        })?;
        self.connection.execute(KeyValueCommand::SAdd {
            key: self.all_key(entity),
            members: vec![key.to_string()],
        })?;
        Ok(())
    }

    fn update_entry(
        &mut self,
        entity: &PersistentEntity,
        key: &i64,
        entry: Hash,
        guard: Option<&VersionGuard>,
    ) -> Result<()> {
        let reply = self.connection.execute(KeyValueCommand::HSetAll {
            key: self.entry_key(entity, *key),
            hash: entry,
            only_if: guard.map(|g| (g.field.clone(), json!(g.expected))),
        })?;
        if guard.is_some() && reply.integer() == 0 {
            return Err(DatastoreError::optimistic_locking(entity.name(), key));
        }
        Ok(())
    }

    fn delete_entry(&mut self, entity: &PersistentEntity, key: &i64) -> Result<()> {
        self.connection.execute(KeyValueCommand::Del {
            keys: vec![self.entry_key(entity, *key)],
        })?;
        self.connection.execute(KeyValueCommand::SRem {
            key: self.all_key(entity),
            members: vec![key.to_string()],
        })?;
        Ok(())
    }

    fn generate_identifier(&mut self, entity: &PersistentEntity, generator: IdentityGenerator) -> Result<i64> {
        if generator == IdentityGenerator::Assigned {
            return Err(DatastoreError::illegal_argument(format!(
                "'{}' uses assigned identifiers",
                entity.name()
            )));
        }
        let reply = self.connection.execute(KeyValueCommand::Incr {
            key: format!("{}.next_id", self.family(entity)),
        })?;
        Ok(reply.integer())
    }

    fn association_indexer(
        &self,
        _context: &MappingContext,
        owner: &PersistentEntity,
        property: &PersistentProperty,
    ) -> Option<Box<dyn AssociationIndexer<Self>>> {
        match property.kind() {
            PropertyKind::OneToMany { collection, target } | PropertyKind::ManyToMany { collection, target } => {
                Some(Box::new(SideIndexer {
                    target: target.clone(),
                    prefix: self.family(owner),
                    name: property.name().to_string(),
                    set: *collection == CollectionKind::Set,
                }))
            }
            _ => None,
        }
    }

    fn property_indexer(
        &self,
        entity: &PersistentEntity,
        property: &PersistentProperty,
    ) -> Option<Box<dyn PropertyValueIndexer<Self>>> {
        if !property.mapping().index {
            return None;
        }
        Some(Box::new(ValueIndexer {
            prefix: format!("{}:{}", self.family(entity), self.property_key(property)),
        }))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    fn compile_query(
        &self,
        context: &MappingContext,
        entity: &PersistentEntity,
        criteria: &Junction,
        orders: &[Order],
    ) -> Result<KeyValueQuery> {
        let mut lookups = Vec::new();
        self.plan(context, entity, criteria, &mut lookups)?;

        let discriminators = if entity.is_root() {
            Vec::new()
        } else {
            std::iter::once(entity.discriminator().to_string())
                .chain(
                    context
                        .descendants(entity.name())
                        .iter()
                        .map(|e| e.discriminator().to_string()),
                )
                .collect()
        };

        let sort = orders
            .iter()
            .map(|order| {
                let property = find_property(context, entity, &order.property).map_err(|_| {
                    DatastoreError::illegal_argument(format!(
                        "Invalid sort field: '{}' is not a property of {}",
                        order.property,
                        entity.name()
                    ))
                })?;
                Ok((self.property_key(&property), order.direction))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(KeyValueQuery {
            family: self.family(entity),
            lookups,
            discriminators,
            sort,
        })
    }

    fn execute_query(
        &mut self,
        entity: &PersistentEntity,
        query: &KeyValueQuery,
        offset: usize,
        max_results: Option<usize>,
    ) -> Result<Vec<(i64, Hash)>> {
        let mut candidates: Option<BTreeSet<i64>> = None;
        for lookup in &query.lookups {
            let found: BTreeSet<i64> = match lookup {
                Lookup::Ids(ids) => ids.iter().copied().collect(),
                Lookup::Index { prefix, values } => {
                    let mut keys = BTreeSet::new();
                    for value in values {
                        let members = self.members(format!("{}:{}", prefix, member(value)))?;
                        keys.extend(Self::parse_keys(members));
                    }
                    keys
                }
            };
            candidates = Some(match candidates {
                None => found,
                Some(current) => current.intersection(&found).copied().collect(),
            });
        }
        let candidates = match candidates {
            Some(keys) => keys,
            None => Self::parse_keys(self.members(format!("{}.all", query.family))?)
                .into_iter()
                .collect(),
        };
        debug!(entity = %entity.name(), candidates = candidates.len(), "Resolved key-value query");

        let mut rows = Vec::with_capacity(candidates.len());
        for key in candidates {
            let reply = self.connection.execute(KeyValueCommand::HGetAll {
                key: format!("{}:{}", query.family, key),
            })?;
            let Some(hash) = reply.into_hash() else {
                continue;
            };
            if !query.discriminators.is_empty() {
                let accepted = self
                    .discriminator(&hash)
                    .is_some_and(|d| query.discriminators.contains(&d));
                if !accepted {
                    continue;
                }
            }
            rows.push((key, hash));
        }

        if !query.sort.is_empty() {
            rows.sort_by(|(_, a), (_, b)| compare_fields(a, b, &query.sort));
        }
        Ok(rows
            .into_iter()
            .skip(offset)
            .take(max_results.unwrap_or(usize::MAX))
            .collect())
    }

    fn count(&mut self, entity: &PersistentEntity, query: &KeyValueQuery) -> Result<u64> {
        Ok(self.execute_query(entity, query, 0, None)?.len() as u64)
    }

    fn release(&mut self) -> Result<()> {
        self.connection.release()
    }
}

/// Target keys kept in a list (or set) beside the owner
struct SideIndexer {
    target: String,
    prefix: String,
    name: String,
    set: bool,
}

impl SideIndexer {
    fn key(&self, owner: i64) -> String {
        format!("{}:{}:{}", self.prefix, owner, self.name)
    }
}

impl<C: KeyValueConnection> AssociationIndexer<KeyValueBackend<C>> for SideIndexer {
    fn embeds_keys(&self) -> bool {
        false
    }

    fn index_entry(&self, _backend: &KeyValueBackend<C>, _entry: &mut Hash, _keys: &[i64]) {}

    fn index(&self, backend: &mut KeyValueBackend<C>, owner: &i64, keys: &[i64]) -> Result<()> {
        let key = self.key(*owner);
        backend.connection.execute(KeyValueCommand::Del {
            keys: vec![key.clone()],
        })?;
        if keys.is_empty() {
            return Ok(());
        }
        let members: Vec<String> = keys.iter().map(i64::to_string).collect();
        let command = if self.set {
            KeyValueCommand::SAdd { key, members }
        } else {
            KeyValueCommand::RPush { key, values: members }
        };
        backend.connection.execute(command)?;
        Ok(())
    }

    fn query(&self, backend: &mut KeyValueBackend<C>, owner: &i64, _owner_entry: &Hash) -> Result<Vec<i64>> {
        let key = self.key(*owner);
        if self.set {
            let mut keys = KeyValueBackend::<C>::parse_keys(backend.members(key)?);
            keys.sort_unstable();
            return Ok(keys);
        }
        let values = backend
            .connection
            .execute(KeyValueCommand::LRange { key })?
            .into_members();
        Ok(KeyValueBackend::<C>::parse_keys(values))
    }

    fn delete_index(&self, backend: &mut KeyValueBackend<C>, owner: &i64) -> Result<()> {
        backend.connection.execute(KeyValueCommand::Del {
            keys: vec![self.key(*owner)],
        })?;
        Ok(())
    }

    fn indexed_entity(&self) -> &str {
        &self.target
    }
}

/// Value sets of an indexed property
struct ValueIndexer {
    prefix: String,
}

impl ValueIndexer {
    fn key(&self, value: &Value) -> String {
        format!("{}:{}", self.prefix, member(value))
    }
}

impl<C: KeyValueConnection> PropertyValueIndexer<KeyValueBackend<C>> for ValueIndexer {
    fn index(&self, backend: &mut KeyValueBackend<C>, value: &Value, key: &i64) -> Result<()> {
        backend.connection.execute(KeyValueCommand::SAdd {
            key: self.key(value),
            members: vec![key.to_string()],
        })?;
        Ok(())
    }

    fn deindex(&self, backend: &mut KeyValueBackend<C>, value: &Value, key: &i64) -> Result<()> {
        backend.connection.execute(KeyValueCommand::SRem {
            key: self.key(value),
            members: vec![key.to_string()],
        })?;
        Ok(())
    }

    fn query(&self, backend: &mut KeyValueBackend<C>, value: &Value) -> Result<Vec<i64>> {
        let members = backend.members(self.key(value))?;
        Ok(KeyValueBackend::<C>::parse_keys(members))
    }
}
