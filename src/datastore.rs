//! Datastore - Main entry point for mapping domain objects onto a native store
//!
//! A [`Datastore`] couples a [`MappingContext`] with a [`NativeClient`] and
//! hands out one [`Session`] per unit of work. It is `Send + Sync` and meant
//! to be shared; sessions are not.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::DatastoreConfig;
use crate::engine::{NativeBackend, NativeClient};
use crate::error::Result;
use crate::events::{AutoTimestampListener, PersistenceListener};
use crate::model::MappingContext;
use crate::session::Session;

/// Entity mapping bound to one kind of native store
pub struct Datastore<C: NativeClient> {
    /// Opens native connections
    client: C,
    /// Shared entity metadata
    context: Arc<MappingContext>,
    /// Datastore configuration
    config: DatastoreConfig,
    /// Listeners handed to every new session
    listeners: RwLock<Vec<Arc<dyn PersistenceListener>>>,
}

impl<C: NativeClient> Datastore<C> {
    /// Create a datastore over a populated mapping context
    ///
    /// This will:
    /// 1. Check that every association target is registered
    /// 2. Install the timestamp listener when `auto_timestamp` is on
    pub fn new(client: C, context: Arc<MappingContext>, config: DatastoreConfig) -> Result<Self> {
        context.verify_associations()?;

        let mut listeners: Vec<Arc<dyn PersistenceListener>> = Vec::new();
        if config.auto_timestamp {
            let timestamps = Arc::new(AutoTimestampListener::new());
            context.add_listener(timestamps.clone());
            listeners.push(timestamps);
        }

        Ok(Self {
            client,
            context,
            config,
            listeners: RwLock::new(listeners),
        })
    }

    /// Get a reference to the mapping context
    pub fn mapping_context(&self) -> &Arc<MappingContext> {
        &self.context
    }

    /// Get a reference to the configuration
    pub fn config(&self) -> &DatastoreConfig {
        &self.config
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Register a listener for sessions opened from now on
    pub fn add_persistence_listener(&self, listener: Arc<dyn PersistenceListener>) {
        self.listeners.write().push(listener);
    }

    /// Open a session on a fresh native connection
    ///
    /// Every registered entity is checked against the backend first; the
    /// connection is released again if one is rejected.
    pub fn connect(&self) -> Result<Session<C::Backend>> {
        let mut backend = self.client.connect(&self.config)?;

        for entity in self.context.persistent_entities() {
            if let Err(e) = backend.validate_entity(&entity) {
                if let Err(release_error) = backend.release() {
                    warn!(error = %release_error, "Releasing rejected connection failed");
                }
                return Err(e);
            }
        }

        debug!(
            backend = %backend.name(),
            address = %self.config.address,
            database = %self.config.database,
            "Session connected"
        );
        let listeners = self.listeners.read().clone();
        Ok(Session::new(
            backend,
            Arc::clone(&self.context),
            &self.config,
            listeners,
        ))
    }
}

impl<C: NativeClient + std::fmt::Debug> std::fmt::Debug for Datastore<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datastore")
            .field("client", &self.client)
            .field("config", &self.config)
            .field("entities", &self.context.persistent_entities().len())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}
