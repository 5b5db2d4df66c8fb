//! Document store implementation of [`NativeBackend`]

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use super::client::id_filter;
use super::query::{self, DocumentQuery, reference_path};
use super::sanitize::{RESERVED_FIELDS, validate_collection_name, validate_field_name};
use super::{
    CLASS_FIELD, Document, DocumentConnection, DocumentKey, DocumentOperation, DocumentResult,
    ID_FIELD, decapitalize, field_name,
};
use crate::engine::identity::next_in_sequence;
use crate::engine::{AssociationIndexer, NativeBackend, VersionGuard};
use crate::error::{DatastoreError, Result};
use crate::model::{
    IdentityGenerator, MappingContext, PersistentEntity, PersistentProperty, PropertyKind,
};
use crate::query::{Junction, Order};
use crate::types::PropertyType;

/// Backend bound to one open document connection
pub struct DocumentBackend<C: DocumentConnection> {
    connection: C,
    database: String,
    identifier_retries: u32,
    in_transaction: bool,
}

impl<C: DocumentConnection> DocumentBackend<C> {
    pub fn new(connection: C, database: impl Into<String>, identifier_retries: u32) -> Self {
        Self {
            connection,
            database: database.into(),
            identifier_retries,
            in_transaction: false,
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Direct access to the native connection
    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.connection
    }

    fn find(&mut self, collection: String, filter: Document, sort: Vec<(String, i32)>, skip: usize, limit: Option<usize>) -> Result<Vec<Document>> {
        let result = self.connection.execute(DocumentOperation::Find {
            collection,
            filter,
            sort,
            skip,
            limit,
        })?;
        Ok(result.into_documents())
    }

    fn key_of(&self, document: &Document) -> Result<DocumentKey> {
        let id = document
            .get(ID_FIELD)
            .ok_or_else(|| DatastoreError::backend("stored document has no _id"))?;
        self.key_from_value(id)
    }
}

impl<C: DocumentConnection> fmt::Debug for DocumentBackend<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentBackend")
            .field("database", &self.database)
            .field("identifier_retries", &self.identifier_retries)
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}

fn is_string_identity(entity: &PersistentEntity) -> bool {
    entity
        .identity()
        .is_some_and(|id| matches!(id.property_type(), PropertyType::String))
}

impl<C: DocumentConnection> NativeBackend for DocumentBackend<C> {
    type Entry = Document;
    type Key = DocumentKey;
    type Query = DocumentQuery;

    fn name(&self) -> &str {
        "document"
    }

    fn validate_entity(&self, entity: &PersistentEntity) -> Result<()> {
        if !entity.is_embedded() {
            validate_collection_name(&self.family(entity))
                .map_err(|e| DatastoreError::mapping(format!("{}: {}", entity.name(), e)))?;
        }
        for property in entity.properties() {
            if matches!(property.kind(), PropertyKind::Identity) {
                continue;
            }
            validate_field_name(&field_name(property), RESERVED_FIELDS).map_err(|e| {
                DatastoreError::mapping(format!("{}.{}: {}", entity.name(), property.name(), e))
            })?;
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
            .unwrap_or_else(|| decapitalize(entity.root_name()))
    }

    fn property_key(&self, property: &PersistentProperty) -> String {
        field_name(property)
    }

    fn create_new_entry(&self, entity: &PersistentEntity) -> Document {
        let mut document = Document::new();
        if !entity.is_root() {
            document.insert(
                CLASS_FIELD.to_string(),
                Value::String(entity.discriminator().to_string()),
            );
        }
        document
    }

    fn entry_value(&self, entry: &Document, field: &str) -> Option<Value> {
        entry.get(field).cloned()
    }

    fn set_entry_value(&self, entry: &mut Document, field: &str, value: Value) {
        if value.is_null() {
            entry.remove(field);
        } else {
            entry.insert(field.to_string(), value);
        }
    }

    fn entry_to_value(&self, entry: Document) -> Value {
        Value::Object(entry)
    }

    fn entry_from_value(&self, value: Value) -> Result<Document> {
        match value {
            Value::Object(document) => Ok(document),
            other => Err(DatastoreError::conversion(format!(
                "expected an embedded document, got {}",
                other
            ))),
        }
    }

    fn discriminator(&self, entry: &Document) -> Option<String> {
        entry
            .get(CLASS_FIELD)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    // =========================================================================
    // Keys and References
    // =========================================================================

    fn key_from_value(&self, value: &Value) -> Result<DocumentKey> {
        match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    return Ok(DocumentKey::Int(i));
                }
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                        Ok(DocumentKey::Int(f as i64))
                    }
                    _ => Err(DatastoreError::conversion(format!(
                        "{} is not a valid document key",
                        n
                    ))),
                }
            }
            Value::String(s) => Ok(DocumentKey::Str(s.clone())),
            other => Err(DatastoreError::conversion(format!(
                "{} is not a valid document key",
                other
            ))),
        }
    }

    fn key_to_value(&self, key: &DocumentKey) -> Value {
        key.to_value()
    }

    fn reference(&self, target: &PersistentEntity, key: &DocumentKey, property: &PersistentProperty) -> Value {
        if property.mapping().reference {
            json!({"$ref": self.family(target), "$id": key.to_value()})
        } else {
            key.to_value()
        }
    }

    fn dereference(&self, value: &Value) -> Option<DocumentKey> {
        match value {
            Value::Object(reference) => reference
                .get("$id")
                .and_then(|id| self.key_from_value(id).ok()),
            Value::Null => None,
            other => self.key_from_value(other).ok(),
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    fn retrieve_entry(&mut self, entity: &PersistentEntity, key: &DocumentKey) -> Result<Option<Document>> {
        let documents = self.find(self.family(entity), id_filter(key.to_value()), Vec::new(), 0, Some(1))?;
        Ok(documents.into_iter().next())
    }

    fn retrieve_entries(&mut self, entity: &PersistentEntity, keys: &[DocumentKey]) -> Result<Vec<Option<Document>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Value> = keys.iter().map(DocumentKey::to_value).collect();
        let documents = self.find(
            self.family(entity),
            id_filter(json!({"$in": ids})),
            Vec::new(),
            0,
            None,
        )?;

        let mut by_key = HashMap::with_capacity(documents.len());
        for document in documents {
            by_key.insert(self.key_of(&document)?, document);
        }
        Ok(keys.iter().map(|key| by_key.get(key).cloned()).collect())
    }

    fn store_entry(&mut self, entity: &PersistentEntity, key: &DocumentKey, entry: Document) -> Result<()> {
        self.store_entries(entity, vec![(key.clone(), entry)])
    }

    fn supports_batch_insert(&self) -> bool {
        true
    }

    fn store_entries(&mut self, entity: &PersistentEntity, entries: Vec<(DocumentKey, Document)>) -> Result<()> {
        let documents: Vec<Document> = entries
            .into_iter()
            .map(|(key, mut document)| {
                document.insert(ID_FIELD.to_string(), key.to_value());
                document
            })
            .collect();
        debug!(collection = %self.family(entity), count = documents.len(), "Inserting documents");
        self.connection.execute(DocumentOperation::Insert {
            collection: self.family(entity),
            documents,
        })?;
        Ok(())
    }

    fn update_entry(
        &mut self,
        entity: &PersistentEntity,
        key: &DocumentKey,
        mut entry: Document,
        guard: Option<&VersionGuard>,
    ) -> Result<()> {
        let mut filter = id_filter(key.to_value());
        if let Some(guard) = guard {
            filter.insert(guard.field.clone(), json!(guard.expected));
        }
        entry.insert(ID_FIELD.to_string(), key.to_value());

        let result = self.connection.execute(DocumentOperation::Replace {
            collection: self.family(entity),
            filter,
            document: entry,
        })?;
        if result.count() == 0 {
            if guard.is_some() {
                return Err(DatastoreError::optimistic_locking(entity.name(), key));
            }
            warn!(entity = %entity.name(), key = %key, "Update matched no stored document");
        }
        Ok(())
    }

    fn delete_entry(&mut self, entity: &PersistentEntity, key: &DocumentKey) -> Result<()> {
        self.connection.execute(DocumentOperation::Delete {
            collection: self.family(entity),
            filter: id_filter(key.to_value()),
        })?;
        Ok(())
    }

    fn delete_entries(&mut self, entity: &PersistentEntity, keys: &[DocumentKey]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let ids: Vec<Value> = keys.iter().map(DocumentKey::to_value).collect();
        self.connection.execute(DocumentOperation::Delete {
            collection: self.family(entity),
            filter: id_filter(json!({"$in": ids})),
        })?;
        Ok(())
    }

    fn generate_identifier(&mut self, entity: &PersistentEntity, generator: IdentityGenerator) -> Result<DocumentKey> {
        let string_identity = is_string_identity(entity);
        match generator {
            IdentityGenerator::Assigned => Err(DatastoreError::illegal_argument(format!(
                "'{}' uses assigned identifiers",
                entity.name()
            ))),
            IdentityGenerator::Auto | IdentityGenerator::Native if string_identity => {
                Ok(DocumentKey::Str(Uuid::new_v4().to_string()))
            }
            _ => {
                let counter = format!("{}.next_id", self.family(entity));
                let retries = self.identifier_retries;
                let connection = RefCell::new(&mut self.connection);

                let next = next_in_sequence(
                    retries,
                    || {
                        let result = connection.borrow_mut().execute(DocumentOperation::Find {
                            collection: counter.clone(),
                            filter: Document::new(),
                            sort: vec![(ID_FIELD.to_string(), -1)],
                            skip: 0,
                            limit: Some(1),
                        })?;
                        Ok(result
                            .into_documents()
                            .first()
                            .and_then(|d| d.get(ID_FIELD))
                            .and_then(Value::as_i64))
                    },
                    |candidate| {
                        connection
                            .borrow_mut()
                            .execute(DocumentOperation::Insert {
                                collection: counter.clone(),
                                documents: vec![id_filter(json!(candidate))],
                            })
                            .map(|_| ())
                    },
                )?;

                Ok(if string_identity {
                    DocumentKey::Str(next.to_string())
                } else {
                    DocumentKey::Int(next)
                })
            }
        }
    }

    fn association_indexer(
        &self,
        context: &MappingContext,
        owner: &PersistentEntity,
        property: &PersistentProperty,
    ) -> Option<Box<dyn AssociationIndexer<Self>>> {
        let target_name = property.target_entity()?.to_string();
        match property.kind() {
            PropertyKind::OneToMany { .. } if property.inverse_side().is_some() => {
                let target = context.persistent_entity(&target_name)?;
                let inverse = target.property(property.inverse_side()?)?;
                let base = match query::compile_query(
                    context,
                    &target,
                    self.family(&target),
                    &Junction::conjunction(),
                    &[],
                ) {
                    Ok(base) => base,
                    Err(e) => {
                        warn!(
                            owner = %owner.name(),
                            property = %property.name(),
                            error = %e,
                            "Cannot index association"
                        );
                        return None;
                    }
                };
                Some(Box::new(InverseKeyIndexer {
                    target: target_name,
                    path: reference_path(inverse),
                    base,
                }))
            }
            PropertyKind::OneToMany { .. } | PropertyKind::ManyToMany { .. } => {
                Some(Box::new(EmbeddedKeysIndexer {
                    target: target_name,
                    field: field_name(property),
                }))
            }
            _ => None,
        }
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
    ) -> Result<DocumentQuery> {
        query::compile_query(context, entity, self.family(entity), criteria, orders)
    }

    fn execute_query(
        &mut self,
        _entity: &PersistentEntity,
        query: &DocumentQuery,
        offset: usize,
        max_results: Option<usize>,
    ) -> Result<Vec<(DocumentKey, Document)>> {
        let documents = self.find(
            query.collection.clone(),
            query.filter.clone(),
            query.sort.clone(),
            offset,
            max_results,
        )?;
        documents
            .into_iter()
            .map(|document| Ok((self.key_of(&document)?, document)))
            .collect()
    }

    fn count(&mut self, _entity: &PersistentEntity, query: &DocumentQuery) -> Result<u64> {
        let result = self.connection.execute(DocumentOperation::Count {
            collection: query.collection.clone(),
            filter: query.filter.clone(),
        })?;
        Ok(result.count())
    }

    // =========================================================================
    // Transactions and Lifecycle
    // =========================================================================

    fn begin_transaction(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(DatastoreError::transaction("transaction already active"));
        }
        self.connection.execute(DocumentOperation::StartTransaction)?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.connection.execute(DocumentOperation::CommitTransaction)?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.connection.execute(DocumentOperation::AbortTransaction)?;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.in_transaction = false;
        self.connection.release()
    }
}

/// Keys of the targets kept as an array in the owner's document
struct EmbeddedKeysIndexer {
    target: String,
    field: String,
}

impl<C: DocumentConnection> AssociationIndexer<DocumentBackend<C>> for EmbeddedKeysIndexer {
    fn embeds_keys(&self) -> bool {
        true
    }

    fn index_entry(&self, backend: &DocumentBackend<C>, entry: &mut Document, keys: &[DocumentKey]) {
        let keys = keys.iter().map(|k| backend.key_to_value(k)).collect();
        entry.insert(self.field.clone(), Value::Array(keys));
    }

    fn index(&self, _backend: &mut DocumentBackend<C>, _owner: &DocumentKey, _keys: &[DocumentKey]) -> Result<()> {
        Ok(())
    }

    fn query(
        &self,
        backend: &mut DocumentBackend<C>,
        _owner: &DocumentKey,
        owner_entry: &Document,
    ) -> Result<Vec<DocumentKey>> {
        Ok(owner_entry
            .get(&self.field)
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(|v| backend.dereference(v)).collect())
            .unwrap_or_default())
    }

    fn delete_index(&self, _backend: &mut DocumentBackend<C>, _owner: &DocumentKey) -> Result<()> {
        Ok(())
    }

    fn indexed_entity(&self) -> &str {
        &self.target
    }
}

/// Targets found through the reference each of them holds to the owner
struct InverseKeyIndexer {
    target: String,
    /// Field of the target holding the owner's key
    path: String,
    /// Collection and discriminator filter of the target
    base: DocumentQuery,
}

impl<C: DocumentConnection> AssociationIndexer<DocumentBackend<C>> for InverseKeyIndexer {
    fn embeds_keys(&self) -> bool {
        false
    }

    fn index_entry(&self, _backend: &DocumentBackend<C>, _entry: &mut Document, _keys: &[DocumentKey]) {}

    // each target already stores its owner
    fn index(&self, _backend: &mut DocumentBackend<C>, _owner: &DocumentKey, _keys: &[DocumentKey]) -> Result<()> {
        Ok(())
    }

    fn query(
        &self,
        backend: &mut DocumentBackend<C>,
        owner: &DocumentKey,
        _owner_entry: &Document,
    ) -> Result<Vec<DocumentKey>> {
        let mut filter = self.base.filter.clone();
        filter.insert(self.path.clone(), owner.to_value());
        let documents = backend.find(
            self.base.collection.clone(),
            filter,
            vec![(ID_FIELD.to_string(), 1)],
            0,
            None,
        )?;
        documents.iter().map(|d| backend.key_of(d)).collect()
    }

    fn delete_index(&self, _backend: &mut DocumentBackend<C>, _owner: &DocumentKey) -> Result<()> {
        Ok(())
    }

    fn indexed_entity(&self) -> &str {
        &self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatastoreConfig;
    use crate::document::MemoryDocumentClient;
    use crate::document::memory::MemoryDocumentConnection;
    use crate::engine::NativeClient;
    use crate::model::EntityBuilder;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Default)]
    struct Author {
        id: Option<i64>,
        name: String,
        books: Vec<Rc<RefCell<Book>>>,
    }

    #[derive(Debug, Default)]
    struct Book {
        id: Option<i64>,
        title: String,
        version: Option<i64>,
        author: Option<Rc<RefCell<Author>>>,
    }

    #[derive(Debug, Default)]
    struct Token {
        id: Option<String>,
    }

    fn context() -> MappingContext {
        let context = MappingContext::new();
        context
            .add(
                EntityBuilder::<Author>::new()
                    .identity("id", PropertyType::Integer, |a| a.id, |a, v| a.id = v)
                    .property("name", PropertyType::String, |a| a.name.clone(), |a, v| a.name = v)
                    .one_to_many::<Book, _, _>("books", |a| a.books.clone(), |a, v| a.books = v)
                    .mapped_by("author"),
            )
            .unwrap();
        context
            .add(
                EntityBuilder::<Book>::new()
                    .identity("id", PropertyType::Integer, |b| b.id, |b, v| b.id = v)
                    .version("version", |b| b.version, |b, v| b.version = v)
                    .property("title", PropertyType::String, |b| b.title.clone(), |b, v| b.title = v)
                    .many_to_one::<Author, _, _>("author", |b| b.author.clone(), |b, v| b.author = v),
            )
            .unwrap();
        context
            .add(
                EntityBuilder::<Token>::new()
                    .identity("id", PropertyType::String, |t| t.id.clone(), |t, v| t.id = v),
            )
            .unwrap();
        context
    }

    fn backend(client: &MemoryDocumentClient) -> DocumentBackend<MemoryDocumentConnection> {
        client
            .connect(&DatastoreConfig::builder("memory://local").build())
            .unwrap()
    }

    // =========================================================================
    // Keys and References
    // =========================================================================

    #[test]
    fn test_key_from_value_is_strict() {
        let backend = backend(&MemoryDocumentClient::new());
        assert_eq!(backend.key_from_value(&json!(4)).unwrap(), DocumentKey::Int(4));
        assert_eq!(backend.key_from_value(&json!(4.0)).unwrap(), DocumentKey::Int(4));
        assert_eq!(backend.key_from_value(&json!("k")).unwrap(), DocumentKey::from("k"));
        assert!(matches!(
            backend.key_from_value(&json!(4.5)),
            Err(DatastoreError::Conversion(_))
        ));
        assert!(backend.key_from_value(&json!(true)).is_err());
        assert!(backend.key_from_value(&Value::Null).is_err());
    }

    #[test]
    fn test_reference_round_trip() {
        let context = context();
        let backend = backend(&MemoryDocumentClient::new());
        let author = context.persistent_entity("Author").unwrap();
        let book = context.persistent_entity("Book").unwrap();
        let property = book.property("author").unwrap();

        let reference = backend.reference(&author, &DocumentKey::Int(3), property);
        assert_eq!(reference, json!({"$ref": "author", "$id": 3}));
        assert_eq!(backend.dereference(&reference), Some(DocumentKey::Int(3)));
        assert_eq!(backend.dereference(&json!(3)), Some(DocumentKey::Int(3)));
        assert_eq!(backend.dereference(&Value::Null), None);
    }

    #[test]
    fn test_entry_values() {
        let context = context();
        let backend = backend(&MemoryDocumentClient::new());
        let book = context.persistent_entity("Book").unwrap();
        let mut entry = backend.create_new_entry(&book);
        assert!(entry.is_empty());

        backend.set_entry_value(&mut entry, "title", json!("Dune"));
        assert_eq!(backend.entry_value(&entry, "title"), Some(json!("Dune")));
        backend.set_entry_value(&mut entry, "title", Value::Null);
        assert!(!entry.contains_key("title"));
        assert!(backend.entry_from_value(json!([1])).is_err());
    }

    // =========================================================================
    // Identifiers
    // =========================================================================

    #[test]
    fn test_generated_identifiers_increase() {
        let context = context();
        let client = MemoryDocumentClient::new();
        let mut backend = backend(&client);
        let book = context.persistent_entity("Book").unwrap();

        let first = backend.generate_identifier(&book, IdentityGenerator::Auto).unwrap();
        let second = backend.generate_identifier(&book, IdentityGenerator::Increment).unwrap();
        assert_eq!(first, DocumentKey::Int(1));
        assert_eq!(second, DocumentKey::Int(2));
        assert_eq!(client.documents("test", "book.next_id").len(), 2);
    }

    #[test]
    fn test_string_identity_uses_uuid() {
        let context = context();
        let mut backend = backend(&MemoryDocumentClient::new());
        let token = context.persistent_entity("Token").unwrap();

        let key = backend.generate_identifier(&token, IdentityGenerator::Auto).unwrap();
        let DocumentKey::Str(value) = key else {
            panic!("expected a string key");
        };
        assert!(Uuid::parse_str(&value).is_ok());

        let counted = backend
            .generate_identifier(&token, IdentityGenerator::Increment)
            .unwrap();
        assert_eq!(counted, DocumentKey::from("1"));

        assert!(
            backend
                .generate_identifier(&token, IdentityGenerator::Assigned)
                .is_err()
        );
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    #[test]
    fn test_store_retrieve_and_delete() {
        let context = context();
        let mut backend = backend(&MemoryDocumentClient::new());
        let book = context.persistent_entity("Book").unwrap();

        let mut entry = Document::new();
        entry.insert("title".to_string(), json!("Dune"));
        backend.store_entry(&book, &DocumentKey::Int(1), entry.clone()).unwrap();

        let stored = backend.retrieve_entry(&book, &DocumentKey::Int(1)).unwrap().unwrap();
        assert_eq!(stored.get("_id"), Some(&json!(1)));
        assert_eq!(stored.get("title"), Some(&json!("Dune")));

        let err = backend.store_entry(&book, &DocumentKey::Int(1), entry).unwrap_err();
        assert!(matches!(err, DatastoreError::Conflict(_)));

        let found = backend
            .retrieve_entries(&book, &[DocumentKey::Int(2), DocumentKey::Int(1)])
            .unwrap();
        assert!(found[0].is_none());
        assert!(found[1].is_some());

        backend.delete_entry(&book, &DocumentKey::Int(1)).unwrap();
        assert!(backend.retrieve_entry(&book, &DocumentKey::Int(1)).unwrap().is_none());
    }

    #[test]
    fn test_guarded_update_detects_stale_version() {
        let context = context();
        let mut backend = backend(&MemoryDocumentClient::new());
        let book = context.persistent_entity("Book").unwrap();

        let mut entry = Document::new();
        entry.insert("version".to_string(), json!(0));
        backend.store_entry(&book, &DocumentKey::Int(1), entry).unwrap();

        let guard = VersionGuard {
            field: "version".to_string(),
            expected: 0,
        };
        let mut updated = Document::new();
        updated.insert("version".to_string(), json!(1));
        backend
            .update_entry(&book, &DocumentKey::Int(1), updated.clone(), Some(&guard))
            .unwrap();

        let err = backend
            .update_entry(&book, &DocumentKey::Int(1), updated, Some(&guard))
            .unwrap_err();
        assert!(matches!(err, DatastoreError::OptimisticLocking { .. }));
    }

    // =========================================================================
    // Associations
    // =========================================================================

    #[test]
    fn test_bidirectional_one_to_many_queries_inverse_references() {
        let context = context();
        let mut backend = backend(&MemoryDocumentClient::new());
        let author = context.persistent_entity("Author").unwrap();
        let book = context.persistent_entity("Book").unwrap();
        let books = author.property("books").unwrap();

        for (id, owner) in [(1, 7), (2, 8), (3, 7)] {
            let mut entry = Document::new();
            entry.insert("author".to_string(), json!({"$ref": "author", "$id": owner}));
            backend.store_entry(&book, &DocumentKey::Int(id), entry).unwrap();
        }

        let indexer = backend.association_indexer(&context, &author, books).unwrap();
        assert!(!indexer.embeds_keys());
        assert_eq!(indexer.indexed_entity(), "Book");
        let keys = indexer
            .query(&mut backend, &DocumentKey::Int(7), &Document::new())
            .unwrap();
        assert_eq!(keys, vec![DocumentKey::Int(1), DocumentKey::Int(3)]);
    }

    #[test]
    fn test_embedded_keys_indexer() {
        let backend = backend(&MemoryDocumentClient::new());
        let indexer = EmbeddedKeysIndexer {
            target: "Tag".to_string(),
            field: "tags".to_string(),
        };
        let mut entry = Document::new();
        AssociationIndexer::<DocumentBackend<MemoryDocumentConnection>>::index_entry(
            &indexer,
            &backend,
            &mut entry,
            &[DocumentKey::Int(2), DocumentKey::Int(5)],
        );
        assert_eq!(entry.get("tags"), Some(&json!([2, 5])));
    }

    // =========================================================================
    // Mapping Validation
    // =========================================================================

    #[derive(Debug, Default)]
    struct Bad {
        id: Option<i64>,
        value: String,
    }

    #[test]
    fn test_validate_entity_rejects_operator_fields() {
        let backend = backend(&MemoryDocumentClient::new());
        let entity = EntityBuilder::<Bad>::new()
            .identity("id", PropertyType::Integer, |b| b.id, |b, v| b.id = v)
            .property("value", PropertyType::String, |b| b.value.clone(), |b, v| b.value = v)
            .field("$value")
            .build()
            .unwrap();
        let err = backend.validate_entity(&entity).unwrap_err();
        assert!(matches!(err, DatastoreError::Mapping(_)));

        let context = context();
        for entity in context.persistent_entities() {
            backend.validate_entity(&entity).unwrap();
        }
    }

    #[test]
    fn test_transactions_require_begin() {
        let mut backend = backend(&MemoryDocumentClient::new());
        backend.commit().unwrap();
        backend.begin_transaction().unwrap();
        assert!(backend.begin_transaction().is_err());
        backend.rollback().unwrap();
        backend.release().unwrap();
    }
}
