//! Configuration for Datastore
//!
//! Provides a builder pattern for configuring a datastore and the sessions it opens.

/// When pending operations are written to the native store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Flush before queries and on commit
    #[default]
    Auto,
    /// Flush only on an explicit `flush()` or commit
    Commit,
}

/// Credentials passed to the native client on connect
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Configuration for the datastore
#[derive(Debug, Clone)]
pub struct DatastoreConfig {
    /// Native client address, e.g. `memory://local`
    pub address: String,
    /// Database (namespace) inside the native store (default: "test")
    pub database: String,
    /// Optional credentials for the native client
    pub credentials: Option<Credentials>,
    /// Flush mode for new sessions
    pub flush_mode: FlushMode,
    /// Attempts made by the optimistic identifier counter before giving up
    pub identifier_retries: u32,
    /// Whether `dateCreated` / `lastUpdated` are maintained automatically
    pub auto_timestamp: bool,
}

impl DatastoreConfig {
    /// Create a new configuration builder
    pub fn builder(address: impl Into<String>) -> DatastoreConfigBuilder {
        DatastoreConfigBuilder::new(address)
    }
}

/// Builder for DatastoreConfig
#[derive(Debug)]
pub struct DatastoreConfigBuilder {
    address: String,
    database: String,
    credentials: Option<Credentials>,
    flush_mode: FlushMode,
    identifier_retries: u32,
    auto_timestamp: bool,
}

impl DatastoreConfigBuilder {
    /// Create a new builder with the client address
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            database: "test".to_string(),
            credentials: None,
            flush_mode: FlushMode::Auto,
            identifier_retries: 100,
            auto_timestamp: true,
        }
    }

    /// Set the database name (default: "test")
    pub fn database(mut self, name: impl Into<String>) -> Self {
        self.database = name.into();
        self
    }

    /// Authenticate with a username and password
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Set the flush mode (default: Auto)
    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    /// Set how many conflicting counter writes are tolerated (default: 100, minimum 1)
    pub fn identifier_retries(mut self, retries: u32) -> Self {
        self.identifier_retries = retries.max(1);
        self
    }

    /// Enable or disable automatic timestamps (default: true)
    pub fn auto_timestamp(mut self, enabled: bool) -> Self {
        self.auto_timestamp = enabled;
        self
    }

    /// Build the configuration
    pub fn build(self) -> DatastoreConfig {
        DatastoreConfig {
            address: self.address,
            database: self.database,
            credentials: self.credentials,
            flush_mode: self.flush_mode,
            identifier_retries: self.identifier_retries,
            auto_timestamp: self.auto_timestamp,
        }
    }
}
