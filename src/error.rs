//! Error types for datastore operations

use thiserror::Error;

/// Errors that can occur while mapping, persisting or querying entities
#[derive(Debug, Error)]
pub enum DatastoreError {
    /// A native client could not be obtained, used or released
    #[error("Connection failure: {0}")]
    Connection(String),

    /// The stored version of a record no longer matches the in-memory version
    #[error("Optimistic locking failure: {entity} with key {key} was updated by another session")]
    OptimisticLocking { entity: String, key: String },

    #[error("Unsupported query: {0}")]
    UnsupportedQuery(String),

    #[error("Conversion failure: {0}")]
    Conversion(String),

    #[error("Transactions are not supported by the {0} backend")]
    TransactionUnsupported(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Cannot create entity instance: {0}")]
    EntityCreation(String),

    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Mapping error: {0}")]
    Mapping(String),

    #[error("Validation failed for {entity}: {}", .errors.join("; "))]
    Validation { entity: String, errors: Vec<String> },

    /// Duplicate key reported by the native client
    #[error("Conflict detected: {0}")]
    Conflict(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DatastoreError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn optimistic_locking(entity: impl Into<String>, key: impl ToString) -> Self {
        Self::OptimisticLocking {
            entity: entity.into(),
            key: key.to_string(),
        }
    }

    pub fn unsupported_query(msg: impl Into<String>) -> Self {
        Self::UnsupportedQuery(msg.into())
    }

    pub fn conversion(msg: impl Into<String>) -> Self {
        Self::Conversion(msg.into())
    }

    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    pub fn entity_creation(msg: impl Into<String>) -> Self {
        Self::EntityCreation(msg.into())
    }

    pub fn illegal_argument(msg: impl Into<String>) -> Self {
        Self::IllegalArgument(msg.into())
    }

    pub fn mapping(msg: impl Into<String>) -> Self {
        Self::Mapping(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Whether retrying the unit of work may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::OptimisticLocking { .. } | Self::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, DatastoreError>;
