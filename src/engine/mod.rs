//! Backend capability contract
//!
//! The session and persister pipeline only talks to a store through
//! [`NativeBackend`]. Each store supplies one implementation, bound to one
//! native connection, plus a [`NativeClient`] that opens such connections.

pub mod identity;
pub mod persister;

use std::fmt;
use std::hash::Hash;

use serde_json::Value;

use crate::config::DatastoreConfig;
use crate::error::{DatastoreError, Result};
use crate::model::{IdentityGenerator, MappingContext, PersistentEntity, PersistentProperty};
use crate::query::{Junction, Order};

pub use persister::NativeEntryPersister;

/// Expected stored version for a compare-and-set update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionGuard {
    /// Native field holding the version
    pub field: String,
    /// Version the stored record must still carry
    pub expected: i64,
}

/// Conversions and I/O between entities and one store's native records
pub trait NativeBackend: Sized + 'static {
    /// Native record (document, hash, row)
    type Entry: Clone + PartialEq + fmt::Debug + 'static;
    /// Native primary key
    type Key: Clone + Eq + Hash + fmt::Debug + fmt::Display + 'static;
    /// Compiled native query
    type Query: fmt::Debug;

    /// Short backend name used in messages
    fn name(&self) -> &str;

    /// Reject mappings this store cannot represent
    fn validate_entity(&self, _entity: &PersistentEntity) -> Result<()> {
        Ok(())
    }

    // =========================================================================
    // Entry Mapping
    // =========================================================================

    /// Storage family (collection, key prefix) shared by a whole hierarchy
    fn family(&self, entity: &PersistentEntity) -> String;

    /// Native field name of a property
    fn property_key(&self, property: &PersistentProperty) -> String {
        property
            .mapping()
            .field
            .clone()
            .unwrap_or_else(|| property.name().to_string())
    }

    /// Empty entry, carrying the discriminator for non-root entities
    fn create_new_entry(&self, entity: &PersistentEntity) -> Self::Entry;

    fn entry_value(&self, entry: &Self::Entry, field: &str) -> Option<Value>;

    /// Set a field; `Null` removes it
    fn set_entry_value(&self, entry: &mut Self::Entry, field: &str, value: Value);

    /// Embed an entry as a nested value of another entry
    fn entry_to_value(&self, entry: Self::Entry) -> Value;

    fn entry_from_value(&self, value: Value) -> Result<Self::Entry>;

    /// Stored type marker, if any
    fn discriminator(&self, entry: &Self::Entry) -> Option<String>;

    // =========================================================================
    // Keys and References
    // =========================================================================

    /// Strict conversion of an identifier value to a key
    fn key_from_value(&self, value: &Value) -> Result<Self::Key>;

    fn key_to_value(&self, key: &Self::Key) -> Value;

    /// Value stored on the owner for a to-one reference
    fn reference(&self, target: &PersistentEntity, key: &Self::Key, property: &PersistentProperty)
    -> Value;

    /// Key behind a stored reference value
    fn dereference(&self, value: &Value) -> Option<Self::Key>;

    // =========================================================================
    // Persistence
    // =========================================================================

    fn retrieve_entry(&mut self, entity: &PersistentEntity, key: &Self::Key)
    -> Result<Option<Self::Entry>>;

    fn retrieve_entries(
        &mut self,
        entity: &PersistentEntity,
        keys: &[Self::Key],
    ) -> Result<Vec<Option<Self::Entry>>> {
        keys.iter().map(|key| self.retrieve_entry(entity, key)).collect()
    }

    /// Insert a new record, re-applying the key into the stored form
    fn store_entry(&mut self, entity: &PersistentEntity, key: &Self::Key, entry: Self::Entry)
    -> Result<()>;

    /// Whether `store_entries` writes in one round trip
    fn supports_batch_insert(&self) -> bool {
        false
    }

    fn store_entries(
        &mut self,
        entity: &PersistentEntity,
        entries: Vec<(Self::Key, Self::Entry)>,
    ) -> Result<()> {
        for (key, entry) in entries {
            self.store_entry(entity, &key, entry)?;
        }
        Ok(())
    }

    /// Replace a record; with a guard the write only applies to that version
    fn update_entry(
        &mut self,
        entity: &PersistentEntity,
        key: &Self::Key,
        entry: Self::Entry,
        guard: Option<&VersionGuard>,
    ) -> Result<()>;

    fn delete_entry(&mut self, entity: &PersistentEntity, key: &Self::Key) -> Result<()>;

    fn delete_entries(&mut self, entity: &PersistentEntity, keys: &[Self::Key]) -> Result<()> {
        for key in keys {
            self.delete_entry(entity, key)?;
        }
        Ok(())
    }

    /// New key for an entity without a client-assigned identifier
    fn generate_identifier(
        &mut self,
        entity: &PersistentEntity,
        generator: IdentityGenerator,
    ) -> Result<Self::Key>;

    /// Index strategy for a to-many association
    fn association_indexer(
        &self,
        context: &MappingContext,
        owner: &PersistentEntity,
        property: &PersistentProperty,
    ) -> Option<Box<dyn AssociationIndexer<Self>>>;

    /// Secondary index for a property; `None` when the store needs none
    fn property_indexer(
        &self,
        _entity: &PersistentEntity,
        _property: &PersistentProperty,
    ) -> Option<Box<dyn PropertyValueIndexer<Self>>> {
        None
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
    ) -> Result<Self::Query>;

    fn execute_query(
        &mut self,
        entity: &PersistentEntity,
        query: &Self::Query,
        offset: usize,
        max_results: Option<usize>,
    ) -> Result<Vec<(Self::Key, Self::Entry)>>;

    fn count(&mut self, entity: &PersistentEntity, query: &Self::Query) -> Result<u64>;

    // =========================================================================
    // Transactions and Lifecycle
    // =========================================================================

    fn begin_transaction(&mut self) -> Result<()> {
        Err(DatastoreError::TransactionUnsupported(self.name().to_string()))
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        Ok(())
    }

    /// Give the native connection back; called exactly once per session
    fn release(&mut self) -> Result<()>;
}

/// Opens native connections for a datastore
pub trait NativeClient: Send + Sync + 'static {
    type Backend: NativeBackend;

    fn connect(&self, config: &DatastoreConfig) -> Result<Self::Backend>;
}

/// Maintains the owner → target keys mapping of a to-many association
pub trait AssociationIndexer<B: NativeBackend> {
    /// Keys are written into the owner's entry instead of a side index
    fn embeds_keys(&self) -> bool;

    fn index_entry(&self, backend: &B, entry: &mut B::Entry, keys: &[B::Key]);

    /// Replace the side index of `owner` with `keys`
    fn index(&self, backend: &mut B, owner: &B::Key, keys: &[B::Key]) -> Result<()>;

    /// Target keys of `owner`, in stored order
    fn query(&self, backend: &mut B, owner: &B::Key, owner_entry: &B::Entry) -> Result<Vec<B::Key>>;

    fn delete_index(&self, backend: &mut B, owner: &B::Key) -> Result<()>;

    /// Name of the target entity
    fn indexed_entity(&self) -> &str;
}

/// Maintains value → keys lookups for an indexed property
pub trait PropertyValueIndexer<B: NativeBackend> {
    fn index(&self, backend: &mut B, value: &Value, key: &B::Key) -> Result<()>;

    fn deindex(&self, backend: &mut B, value: &Value, key: &B::Key) -> Result<()>;

    fn query(&self, backend: &mut B, value: &Value) -> Result<Vec<B::Key>>;
}
