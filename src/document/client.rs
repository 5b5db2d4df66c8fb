//! Native client contract of the document store
//!
//! The backend never talks to a driver directly; it sends
//! [`DocumentOperation`]s through a [`DocumentConnection`]. A duplicate `_id`
//! on insert must surface as [`DatastoreError::Conflict`](crate::DatastoreError::Conflict).

use serde_json::Value;

use super::Document;
use crate::error::Result;

/// One request to the native store
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentOperation {
    /// Documents matching `filter`, ordered by `sort`, then paged
    Find {
        collection: String,
        filter: Document,
        /// `(field, 1 | -1)` in priority order
        sort: Vec<(String, i32)>,
        skip: usize,
        limit: Option<usize>,
    },
    Count {
        collection: String,
        filter: Document,
    },
    /// Insert all documents or none; duplicate `_id` is a conflict
    Insert {
        collection: String,
        documents: Vec<Document>,
    },
    /// Replace the first document matching `filter`
    Replace {
        collection: String,
        filter: Document,
        document: Document,
    },
    /// Remove every document matching `filter`
    Delete {
        collection: String,
        filter: Document,
    },
    StartTransaction,
    CommitTransaction,
    AbortTransaction,
}

impl DocumentOperation {
    /// Whether the operation modifies stored documents
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            DocumentOperation::Insert { .. }
                | DocumentOperation::Replace { .. }
                | DocumentOperation::Delete { .. }
        )
    }
}

/// Reply to a [`DocumentOperation`]
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentResult {
    Documents(Vec<Document>),
    Count(u64),
    /// Number of documents inserted, replaced or removed
    Modified(u64),
    Acknowledged,
}

impl DocumentResult {
    pub fn into_documents(self) -> Vec<Document> {
        match self {
            DocumentResult::Documents(documents) => documents,
            _ => Vec::new(),
        }
    }

    pub fn count(&self) -> u64 {
        match self {
            DocumentResult::Count(n) | DocumentResult::Modified(n) => *n,
            DocumentResult::Documents(documents) => documents.len() as u64,
            DocumentResult::Acknowledged => 0,
        }
    }
}

/// One open connection to a document store
pub trait DocumentConnection: 'static {
    fn execute(&mut self, operation: DocumentOperation) -> Result<DocumentResult>;

    /// Give the connection back; further operations fail
    fn release(&mut self) -> Result<()>;
}

/// Filter on the identifier field
pub(crate) fn id_filter(id: Value) -> Document {
    let mut filter = Document::new();
    filter.insert(super::ID_FIELD.to_string(), id);
    filter
}
