//! In-memory document store
//!
//! Collections live behind a shared mutex, so every connection opened from
//! one [`MemoryDocumentClient`] (and its clones) sees the same data. Each
//! operation is atomic. Transactions keep an undo journal that is replayed
//! on abort; writes inside a transaction are visible to other connections
//! before commit.
//!
//! Failures can be injected for testing: an unavailable store, failing
//! writes, and failing connection release.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use super::backend::DocumentBackend;
use super::client::{DocumentConnection, DocumentOperation, DocumentResult};
use super::matcher::{matches, near_clause, sort_by_distance, sort_documents};
use super::{Document, ID_FIELD};
use crate::config::{Credentials, DatastoreConfig};
use crate::engine::NativeClient;
use crate::error::{DatastoreError, Result};

/// Operation counters of a [`MemoryDocumentClient`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub connects: u64,
    pub releases: u64,
    /// Insert, replace and delete operations
    pub writes: u64,
    /// Find and count operations
    pub queries: u64,
}

type Collections = BTreeMap<String, Vec<Document>>;

#[derive(Debug, Default)]
struct MemoryState {
    databases: HashMap<String, Collections>,
    stats: MemoryStats,
    credentials: Option<Credentials>,
    unavailable: bool,
    fail_writes: bool,
    fail_release: bool,
}

/// Shared handle to an in-memory document store
#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentClient {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDocumentClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require these credentials on connect
    pub fn with_credentials(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.state.lock().credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Refuse new connections and operations
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Fail every insert, replace and delete
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Fail connection release (the connection is still closed)
    pub fn set_fail_release(&self, fail: bool) {
        self.state.lock().fail_release = fail;
    }

    pub fn stats(&self) -> MemoryStats {
        self.state.lock().stats
    }

    /// Connections opened and not yet released
    pub fn open_connections(&self) -> u64 {
        let stats = self.state.lock().stats;
        stats.connects.saturating_sub(stats.releases)
    }

    /// Snapshot of a collection, in insertion order
    pub fn documents(&self, database: &str, collection: &str) -> Vec<Document> {
        self.state
            .lock()
            .databases
            .get(database)
            .and_then(|collections| collections.get(collection))
            .cloned()
            .unwrap_or_default()
    }

    /// Names of the non-empty collections of a database
    pub fn collections(&self, database: &str) -> Vec<String> {
        self.state
            .lock()
            .databases
            .get(database)
            .map(|collections| {
                collections
                    .iter()
                    .filter(|(_, documents)| !documents.is_empty())
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl NativeClient for MemoryDocumentClient {
    type Backend = DocumentBackend<MemoryDocumentConnection>;

    fn connect(&self, config: &DatastoreConfig) -> Result<Self::Backend> {
        {
            let mut state = self.state.lock();
            if state.unavailable {
                return Err(DatastoreError::connection(format!(
                    "document store at {} is unavailable",
                    config.address
                )));
            }
            if let Some(expected) = &state.credentials {
                if config.credentials.as_ref() != Some(expected) {
                    return Err(DatastoreError::connection(format!(
                        "authentication failed for {}",
                        config.address
                    )));
                }
            }
            state.stats.connects += 1;
        }
        debug!(address = %config.address, database = %config.database, "Opened document connection");

        let connection = MemoryDocumentConnection {
            state: Arc::clone(&self.state),
            database: config.database.clone(),
            released: false,
            journal: None,
        };
        Ok(DocumentBackend::new(
            connection,
            config.database.clone(),
            config.identifier_retries,
        ))
    }
}

/// Undo step recorded while a transaction is open
#[derive(Debug)]
enum Undo {
    Remove { collection: String, id: Value },
    Restore { collection: String, document: Document },
    Reinsert { collection: String, documents: Vec<Document> },
}

/// Connection to a [`MemoryDocumentClient`], bound to one database
#[derive(Debug)]
pub struct MemoryDocumentConnection {
    state: Arc<Mutex<MemoryState>>,
    database: String,
    released: bool,
    journal: Option<Vec<Undo>>,
}

impl MemoryDocumentConnection {
    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn in_transaction(&self) -> bool {
        self.journal.is_some()
    }

    fn record(&mut self, undo: Undo) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(undo);
        }
    }

    fn undo(&mut self, journal: Vec<Undo>) {
        let mut state = self.state.lock();
        let collections = state.databases.entry(self.database.clone()).or_default();
        for step in journal.into_iter().rev() {
            match step {
                Undo::Remove { collection, id } => {
                    if let Some(documents) = collections.get_mut(&collection) {
                        documents.retain(|d| d.get(ID_FIELD) != Some(&id));
                    }
                }
                Undo::Restore { collection, document } => {
                    let documents = collections.entry(collection).or_default();
                    let id = document.get(ID_FIELD).cloned();
                    match documents.iter_mut().find(|d| d.get(ID_FIELD) == id.as_ref()) {
                        Some(current) => *current = document,
                        None => documents.push(document),
                    }
                }
                Undo::Reinsert { collection, documents } => {
                    collections.entry(collection).or_default().extend(documents);
                }
            }
        }
    }

    fn find(
        collections: &Collections,
        collection: &str,
        filter: &Document,
        sort: &[(String, i32)],
        skip: usize,
        limit: Option<usize>,
    ) -> Result<Vec<Document>> {
        let mut found = Vec::new();
        for document in collections.get(collection).into_iter().flatten() {
            if matches(filter, document)? {
                found.push(document.clone());
            }
        }

        if sort.is_empty() {
            if let Some((field, origin)) = near_clause(filter) {
                sort_by_distance(&mut found, &field, origin);
            }
        } else {
            sort_documents(&mut found, sort);
        }

        Ok(found
            .into_iter()
            .skip(skip)
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }
}

impl DocumentConnection for MemoryDocumentConnection {
    fn execute(&mut self, operation: DocumentOperation) -> Result<DocumentResult> {
        if self.released {
            return Err(DatastoreError::connection("connection has been released"));
        }

        match operation {
            DocumentOperation::StartTransaction => {
                if self.journal.is_some() {
                    return Err(DatastoreError::transaction("transaction already started"));
                }
                self.journal = Some(Vec::new());
                return Ok(DocumentResult::Acknowledged);
            }
            DocumentOperation::CommitTransaction => {
                return match self.journal.take() {
                    Some(_) => Ok(DocumentResult::Acknowledged),
                    None => Err(DatastoreError::transaction("no transaction to commit")),
                };
            }
            DocumentOperation::AbortTransaction => {
                let journal = self
                    .journal
                    .take()
                    .ok_or_else(|| DatastoreError::transaction("no transaction to abort"))?;
                self.undo(journal);
                return Ok(DocumentResult::Acknowledged);
            }
            _ => {}
        }

        let mut state = self.state.lock();
        if state.unavailable {
            return Err(DatastoreError::connection("document store is unavailable"));
        }
        if operation.is_write() {
            if state.fail_writes {
                return Err(DatastoreError::backend("write rejected by document store"));
            }
            state.stats.writes += 1;
        } else {
            state.stats.queries += 1;
        }
        let collections = state.databases.entry(self.database.clone()).or_default();

        let (result, undo) = match operation {
            DocumentOperation::Find {
                collection,
                filter,
                sort,
                skip,
                limit,
            } => {
                let documents = Self::find(collections, &collection, &filter, &sort, skip, limit)?;
                (DocumentResult::Documents(documents), Vec::new())
            }
            DocumentOperation::Count { collection, filter } => {
                let count = Self::find(collections, &collection, &filter, &[], 0, None)?.len();
                (DocumentResult::Count(count as u64), Vec::new())
            }
            DocumentOperation::Insert {
                collection,
                documents,
            } => {
                let existing = collections.entry(collection.clone()).or_default();
                let mut ids: Vec<&Value> = existing.iter().filter_map(|d| d.get(ID_FIELD)).collect();
                for document in &documents {
                    let id = document
                        .get(ID_FIELD)
                        .ok_or_else(|| DatastoreError::backend("document has no _id"))?;
                    if ids.contains(&id) {
                        return Err(DatastoreError::conflict(format!(
                            "duplicate _id {} in collection '{}'",
                            id, collection
                        )));
                    }
                    ids.push(id);
                }

                let undo = documents
                    .iter()
                    .filter_map(|d| d.get(ID_FIELD).cloned())
                    .map(|id| Undo::Remove {
                        collection: collection.clone(),
                        id,
                    })
                    .collect();
                let count = documents.len() as u64;
                existing.extend(documents);
                (DocumentResult::Modified(count), undo)
            }
            DocumentOperation::Replace {
                collection,
                filter,
                document,
            } => {
                let existing = collections.entry(collection.clone()).or_default();
                let mut position = None;
                for (index, candidate) in existing.iter().enumerate() {
                    if matches(&filter, candidate)? {
                        position = Some(index);
                        break;
                    }
                }
                match position {
                    Some(index) => {
                        let previous = std::mem::replace(&mut existing[index], document);
                        (
                            DocumentResult::Modified(1),
                            vec![Undo::Restore {
                                collection,
                                document: previous,
                            }],
                        )
                    }
                    None => (DocumentResult::Modified(0), Vec::new()),
                }
            }
            DocumentOperation::Delete { collection, filter } => {
                let existing = collections.entry(collection.clone()).or_default();
                let mut kept = Vec::with_capacity(existing.len());
                let mut removed = Vec::new();
                for document in existing.drain(..) {
                    // a failed match keeps the document
                    if matches(&filter, &document).unwrap_or(false) {
                        removed.push(document);
                    } else {
                        kept.push(document);
                    }
                }
                *existing = kept;
                let count = removed.len() as u64;
                (
                    DocumentResult::Modified(count),
                    vec![Undo::Reinsert {
                        collection,
                        documents: removed,
                    }],
                )
            }
            DocumentOperation::StartTransaction
            | DocumentOperation::CommitTransaction
            | DocumentOperation::AbortTransaction => (DocumentResult::Acknowledged, Vec::new()),
        };
        drop(state);

        for step in undo {
            self.record(step);
        }
        Ok(result)
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        if let Some(journal) = self.journal.take() {
            self.undo(journal);
        }
        self.released = true;

        let mut state = self.state.lock();
        state.stats.releases += 1;
        if state.fail_release {
            return Err(DatastoreError::connection("failed to release connection"));
        }
        debug!(database = %self.database, "Released document connection");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> DatastoreConfig {
        DatastoreConfig::builder("memory://local").build()
    }

    fn connection(client: &MemoryDocumentClient) -> MemoryDocumentConnection {
        MemoryDocumentConnection {
            state: Arc::clone(&client.state),
            database: "test".to_string(),
            released: false,
            journal: None,
        }
    }

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn insert(connection: &mut MemoryDocumentConnection, documents: Vec<Value>) -> Result<DocumentResult> {
        connection.execute(DocumentOperation::Insert {
            collection: "person".to_string(),
            documents: documents.into_iter().map(doc).collect(),
        })
    }

    fn find(connection: &mut MemoryDocumentConnection, filter: Value, sort: Vec<(&str, i32)>, skip: usize, limit: Option<usize>) -> Vec<Document> {
        connection
            .execute(DocumentOperation::Find {
                collection: "person".to_string(),
                filter: doc(filter),
                sort: sort.into_iter().map(|(f, d)| (f.to_string(), d)).collect(),
                skip,
                limit,
            })
            .unwrap()
            .into_documents()
    }

    fn ids(documents: &[Document]) -> Vec<Value> {
        documents.iter().map(|d| d["_id"].clone()).collect()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    #[test]
    fn test_find_filters_sorts_and_pages() {
        let client = MemoryDocumentClient::new();
        let mut conn = connection(&client);
        insert(
            &mut conn,
            vec![
                json!({"_id": 1, "age": 40}),
                json!({"_id": 2, "age": 20}),
                json!({"_id": 3, "age": 30}),
                json!({"_id": 4, "age": 10}),
            ],
        )
        .unwrap();

        let found = find(&mut conn, json!({"age": {"$gte": 20}}), vec![("age", 1)], 0, None);
        assert_eq!(ids(&found), vec![json!(2), json!(3), json!(1)]);

        let page = find(&mut conn, json!({}), vec![("age", -1)], 1, Some(2));
        assert_eq!(ids(&page), vec![json!(3), json!(2)]);

        let count = conn
            .execute(DocumentOperation::Count {
                collection: "person".to_string(),
                filter: doc(json!({"age": {"$lt": 35}})),
            })
            .unwrap();
        assert_eq!(count, DocumentResult::Count(3));
    }

    #[test]
    fn test_near_orders_by_distance() {
        let client = MemoryDocumentClient::new();
        let mut conn = connection(&client);
        insert(
            &mut conn,
            vec![
                json!({"_id": 1, "loc": [10.0, 10.0]}),
                json!({"_id": 2, "loc": [1.0, 1.0]}),
                json!({"_id": 3, "loc": [4.0, 4.0]}),
            ],
        )
        .unwrap();

        let found = find(&mut conn, json!({"loc": {"$near": [0.0, 0.0]}}), vec![], 0, None);
        assert_eq!(ids(&found), vec![json!(2), json!(3), json!(1)]);
    }

    // =========================================================================
    // Writes
    // =========================================================================

    #[test]
    fn test_insert_is_all_or_nothing() {
        let client = MemoryDocumentClient::new();
        let mut conn = connection(&client);
        insert(&mut conn, vec![json!({"_id": 1})]).unwrap();

        let err = insert(&mut conn, vec![json!({"_id": 2}), json!({"_id": 1})]).unwrap_err();
        assert!(matches!(err, DatastoreError::Conflict(_)));
        let err = insert(&mut conn, vec![json!({"_id": 5}), json!({"_id": 5})]).unwrap_err();
        assert!(matches!(err, DatastoreError::Conflict(_)));
        assert_eq!(client.documents("test", "person").len(), 1);
    }

    #[test]
    fn test_replace_and_delete() {
        let client = MemoryDocumentClient::new();
        let mut conn = connection(&client);
        insert(&mut conn, vec![json!({"_id": 1, "v": 0}), json!({"_id": 2, "v": 0})]).unwrap();

        let replaced = conn
            .execute(DocumentOperation::Replace {
                collection: "person".to_string(),
                filter: doc(json!({"_id": 1, "v": 0})),
                document: doc(json!({"_id": 1, "v": 1})),
            })
            .unwrap();
        assert_eq!(replaced, DocumentResult::Modified(1));

        let stale = conn
            .execute(DocumentOperation::Replace {
                collection: "person".to_string(),
                filter: doc(json!({"_id": 1, "v": 0})),
                document: doc(json!({"_id": 1, "v": 2})),
            })
            .unwrap();
        assert_eq!(stale, DocumentResult::Modified(0));

        let deleted = conn
            .execute(DocumentOperation::Delete {
                collection: "person".to_string(),
                filter: doc(json!({"_id": {"$in": [1, 2]}})),
            })
            .unwrap();
        assert_eq!(deleted.count(), 2);
        assert!(client.documents("test", "person").is_empty());
    }

    #[test]
    fn test_failing_writes() {
        let client = MemoryDocumentClient::new();
        let mut conn = connection(&client);
        client.set_fail_writes(true);
        assert!(matches!(
            insert(&mut conn, vec![json!({"_id": 1})]),
            Err(DatastoreError::Backend(_))
        ));
        assert!(find(&mut conn, json!({}), vec![], 0, None).is_empty());
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    #[test]
    fn test_abort_restores_previous_state() {
        let client = MemoryDocumentClient::new();
        let mut conn = connection(&client);
        insert(&mut conn, vec![json!({"_id": 1, "name": "a"}), json!({"_id": 2})]).unwrap();

        conn.execute(DocumentOperation::StartTransaction).unwrap();
        assert!(conn.in_transaction());
        insert(&mut conn, vec![json!({"_id": 3})]).unwrap();
        conn.execute(DocumentOperation::Replace {
            collection: "person".to_string(),
            filter: doc(json!({"_id": 1})),
            document: doc(json!({"_id": 1, "name": "b"})),
        })
        .unwrap();
        conn.execute(DocumentOperation::Delete {
            collection: "person".to_string(),
            filter: doc(json!({"_id": 2})),
        })
        .unwrap();
        conn.execute(DocumentOperation::AbortTransaction).unwrap();

        let mut documents = client.documents("test", "person");
        sort_documents(&mut documents, &[("_id".to_string(), 1)]);
        assert_eq!(
            documents,
            vec![doc(json!({"_id": 1, "name": "a"})), doc(json!({"_id": 2}))]
        );
    }

    #[test]
    fn test_commit_keeps_writes() {
        let client = MemoryDocumentClient::new();
        let mut conn = connection(&client);
        conn.execute(DocumentOperation::StartTransaction).unwrap();
        insert(&mut conn, vec![json!({"_id": 1})]).unwrap();
        conn.execute(DocumentOperation::CommitTransaction).unwrap();
        assert!(conn.execute(DocumentOperation::CommitTransaction).is_err());
        assert_eq!(client.documents("test", "person").len(), 1);
    }

    // =========================================================================
    // Connections
    // =========================================================================

    #[test]
    fn test_connect_and_release_counts() {
        let client = MemoryDocumentClient::new();
        let mut backend = client.connect(&config()).unwrap();
        assert_eq!(client.open_connections(), 1);

        backend.connection_mut().release().unwrap();
        assert!(backend.connection().is_released());
        assert_eq!(client.open_connections(), 0);
        assert_eq!(client.stats().releases, 1);

        let err = backend
            .connection_mut()
            .execute(DocumentOperation::Count {
                collection: "person".to_string(),
                filter: Document::new(),
            })
            .unwrap_err();
        assert!(matches!(err, DatastoreError::Connection(_)));
    }

    #[test]
    fn test_failed_release_still_closes() {
        let client = MemoryDocumentClient::new();
        client.set_fail_release(true);
        let mut backend = client.connect(&config()).unwrap();
        assert!(backend.connection_mut().release().is_err());
        assert!(backend.connection().is_released());
        assert_eq!(client.open_connections(), 0);
    }

    #[test]
    fn test_unavailable_store_refuses_connections() {
        let client = MemoryDocumentClient::new();
        client.set_unavailable(true);
        assert!(matches!(
            client.connect(&config()),
            Err(DatastoreError::Connection(_))
        ));
        assert_eq!(client.stats().connects, 0);
    }

    #[test]
    fn test_credentials_are_checked() {
        let client = MemoryDocumentClient::new().with_credentials("app", "secret");
        assert!(client.connect(&config()).is_err());

        let config = DatastoreConfig::builder("memory://local")
            .credentials("app", "secret")
            .build();
        assert!(client.connect(&config).is_ok());
    }

    #[test]
    fn test_databases_are_separate() {
        let client = MemoryDocumentClient::new();
        let mut first = client.connect(&config()).unwrap();
        let other = DatastoreConfig::builder("memory://local").database("other").build();
        let mut second = client.connect(&other).unwrap();

        first
            .connection_mut()
            .execute(DocumentOperation::Insert {
                collection: "person".to_string(),
                documents: vec![doc(json!({"_id": 1}))],
            })
            .unwrap();
        let found = second
            .connection_mut()
            .execute(DocumentOperation::Count {
                collection: "person".to_string(),
                filter: Document::new(),
            })
            .unwrap();
        assert_eq!(found.count(), 0);
        assert_eq!(client.collections("test"), vec!["person".to_string()]);
    }
}
