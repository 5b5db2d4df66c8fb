//! # runtara-datastore
//!
//! A datastore mapping engine for plain Rust structs.
//!
//! Entities are described once in a [`MappingContext`]. A [`Datastore`] opens
//! [`Session`]s against a native store through a backend that knows how to
//! turn objects into native entries and criteria into native queries.
//!
//! ## Features
//!
//! - **Entity Metadata**: Identity, version, simple, embedded and association
//!   properties, single-table inheritance with discriminators
//! - **Sessions**: Identity map, dirty checking and a deferred write queue
//!   flushed in insert, update, delete order
//! - **Optimistic Locking**: Version-checked updates raise
//!   [`DatastoreError::OptimisticLocking`]
//! - **Criteria Queries**: Restrictions, junctions, projections, ordering and
//!   pagination compiled to each backend's native query
//! - **Backends**: A document store (Mongo-like filters) and a key-value store
//!   (Redis-like hashes, sets and lists), each with an in-memory client
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use runtara_datastore::document::MemoryDocumentClient;
//! use runtara_datastore::{
//!     Datastore, DatastoreConfig, EntityBuilder, MappingContext, PropertyType, object, restrictions,
//! };
//!
//! #[derive(Debug, Default)]
//! struct Product {
//!     id: Option<i64>,
//!     version: Option<i64>,
//!     name: String,
//!     price: f64,
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let context = MappingContext::new();
//!     context.add(
//!         EntityBuilder::<Product>::new()
//!             .identity("id", PropertyType::Integer, |p| p.id, |p, v| p.id = v)
//!             .version("version", |p| p.version, |p, v| p.version = v)
//!             .property("name", PropertyType::String, |p| p.name.clone(), |p, v| p.name = v)
//!             .property("price", PropertyType::Float, |p| p.price, |p, v| p.price = v),
//!     )?;
//!
//!     let config = DatastoreConfig::builder("memory://local").build();
//!     let datastore = Datastore::new(MemoryDocumentClient::new(), Arc::new(context), config)?;
//!     let mut session = datastore.connect()?;
//!
//!     let widget = object(Product {
//!         name: "Blue Widget".to_string(),
//!         price: 29.99,
//!         ..Default::default()
//!     });
//!     session.persist(&widget)?;
//!     session.flush()?;
//!
//!     let cheap = session
//!         .create_query("Product")?
//!         .add(restrictions::lt("price", 50.0))
//!         .list_of::<Product, _>(&mut session)?;
//!     assert_eq!(cheap.len(), 1);
//!
//!     session.disconnect()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! ```rust
//! use runtara_datastore::{DatastoreConfig, FlushMode};
//!
//! let config = DatastoreConfig::builder("memory://local")
//!     .database("inventory")          // Native database name
//!     .flush_mode(FlushMode::Commit)  // Only flush on explicit flush or commit
//!     .identifier_retries(10)         // Attempts for sequence identifiers
//!     .auto_timestamp(true)           // Maintain dateCreated / lastUpdated
//!     .build();
//! assert_eq!(config.database, "inventory");
//! ```
//!
//! ## Threading
//!
//! A [`Datastore`] is shared across threads; each thread opens its own
//! [`Session`]. Sessions and the objects they track are single-threaded.

pub mod access;
pub mod config;
pub mod conversion;
pub mod datastore;
pub mod document;
pub mod engine;
pub mod error;
pub mod events;
pub mod keyvalue;
pub mod model;
pub mod query;
pub mod session;
pub mod types;

// Re-export main types for convenience
pub use access::EntityAccess;
pub use config::{Credentials, DatastoreConfig, DatastoreConfigBuilder, FlushMode};
pub use conversion::{ConversionService, DefaultConversionService};
pub use datastore::Datastore;
pub use engine::{AssociationIndexer, NativeBackend, NativeClient, NativeEntryPersister, PropertyValueIndexer};
pub use error::{DatastoreError, Result};
pub use events::{AutoTimestampListener, PersistenceListener};
pub use model::{
    EntityBuilder, IdentityGenerator, MappingContext, ObjectRef, PersistentEntity, PersistentProperty,
    PropertyValue, object,
};
pub use query::{Criterion, Direction, Order, Projection, Query, QueryResults, restrictions};
pub use session::{OperationKind, PendingOperation, Session, SessionState, Transaction};
pub use types::PropertyType;
