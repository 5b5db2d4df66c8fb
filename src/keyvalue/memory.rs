//! In-memory key-value store
//!
//! All connections opened from one [`MemoryKeyValueClient`] share the same
//! keyspace per database. Every command is atomic.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::backend::KeyValueBackend;
use super::{Hash, KeyValueCommand, KeyValueConnection, KeyValueReply};
use crate::config::DatastoreConfig;
use crate::engine::NativeClient;
use crate::error::{DatastoreError, Result};
use crate::types::values_equal;

/// Command counters of a [`MemoryKeyValueClient`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyValueStats {
    pub connects: u64,
    pub releases: u64,
    pub commands: u64,
}

#[derive(Debug, Clone)]
enum Slot {
    Hash(Hash),
    Counter(i64),
    List(Vec<String>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Default)]
struct KeyValueState {
    databases: HashMap<String, HashMap<String, Slot>>,
    stats: KeyValueStats,
    unavailable: bool,
}

/// Shared handle to an in-memory key-value store
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyValueClient {
    state: Arc<Mutex<KeyValueState>>,
}

impl MemoryKeyValueClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    pub fn stats(&self) -> KeyValueStats {
        self.state.lock().stats
    }

    pub fn open_connections(&self) -> u64 {
        let stats = self.state.lock().stats;
        stats.connects.saturating_sub(stats.releases)
    }

    /// Every key of a database, sorted
    pub fn keys(&self, database: &str) -> Vec<String> {
        let state = self.state.lock();
        let mut keys: Vec<String> = state
            .databases
            .get(database)
            .map(|slots| slots.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn hash(&self, database: &str, key: &str) -> Option<Hash> {
        match self.state.lock().databases.get(database)?.get(key)? {
            Slot::Hash(hash) => Some(hash.clone()),
            _ => None,
        }
    }

    /// Members of a list or set
    pub fn members(&self, database: &str, key: &str) -> Vec<String> {
        let state = self.state.lock();
        match state.databases.get(database).and_then(|slots| slots.get(key)) {
            Some(Slot::List(values)) => values.clone(),
            Some(Slot::Set(members)) => members.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }
}

impl NativeClient for MemoryKeyValueClient {
    type Backend = KeyValueBackend<MemoryKeyValueConnection>;

    fn connect(&self, config: &DatastoreConfig) -> Result<Self::Backend> {
        {
            let mut state = self.state.lock();
            if state.unavailable {
                return Err(DatastoreError::connection(format!(
                    "key-value store at {} is unavailable",
                    config.address
                )));
            }
            state.stats.connects += 1;
        }
        debug!(address = %config.address, database = %config.database, "Opened key-value connection");

        Ok(KeyValueBackend::new(
            MemoryKeyValueConnection {
                state: Arc::clone(&self.state),
                database: config.database.clone(),
                released: false,
            },
            config.database.clone(),
        ))
    }
}

/// Connection to a [`MemoryKeyValueClient`]
#[derive(Debug)]
pub struct MemoryKeyValueConnection {
    state: Arc<Mutex<KeyValueState>>,
    database: String,
    released: bool,
}

impl MemoryKeyValueConnection {
    pub fn is_released(&self) -> bool {
        self.released
    }
}

fn wrong_type(key: &str) -> DatastoreError {
    DatastoreError::backend(format!(
        "WRONGTYPE operation against key '{}' holding the wrong kind of value",
        key
    ))
}

impl KeyValueConnection for MemoryKeyValueConnection {
    fn execute(&mut self, command: KeyValueCommand) -> Result<KeyValueReply> {
        if self.released {
            return Err(DatastoreError::connection("connection has been released"));
        }
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(DatastoreError::connection("key-value store is unavailable"));
        }
        state.stats.commands += 1;
        let slots = state.databases.entry(self.database.clone()).or_default();

        let reply = match command {
            KeyValueCommand::HGetAll { key } => match slots.get(&key) {
                None => KeyValueReply::Hash(None),
                Some(Slot::Hash(hash)) => KeyValueReply::Hash(Some(hash.clone())),
                Some(_) => return Err(wrong_type(&key)),
            },
            KeyValueCommand::HSetAll { key, hash, only_if } => {
                let current = match slots.get(&key) {
                    None => None,
                    Some(Slot::Hash(current)) => Some(current),
                    Some(_) => return Err(wrong_type(&key)),
                };
                let allowed = match (&only_if, current) {
                    (None, _) => true,
                    (Some((field, expected)), Some(current)) => current
                        .get(field)
                        .is_some_and(|value| values_equal(value, expected)),
                    (Some(_), None) => false,
                };
                if allowed {
                    slots.insert(key, Slot::Hash(hash));
                    KeyValueReply::Integer(1)
                } else {
                    KeyValueReply::Integer(0)
                }
            }
            KeyValueCommand::Del { keys } => {
                let removed = keys.iter().filter(|key| slots.remove(*key).is_some()).count();
                KeyValueReply::Integer(removed as i64)
            }
            KeyValueCommand::Incr { key } => {
                let slot = slots.entry(key.clone()).or_insert(Slot::Counter(0));
                match slot {
                    Slot::Counter(n) => {
                        *n += 1;
                        KeyValueReply::Integer(*n)
                    }
                    _ => return Err(wrong_type(&key)),
                }
            }
            KeyValueCommand::SAdd { key, members } => {
                let slot = slots.entry(key.clone()).or_insert_with(|| Slot::Set(BTreeSet::new()));
                match slot {
                    Slot::Set(set) => {
                        let added = members.into_iter().filter(|m| set.insert(m.clone())).count();
                        KeyValueReply::Integer(added as i64)
                    }
                    _ => return Err(wrong_type(&key)),
                }
            }
            KeyValueCommand::SRem { key, members } => {
                let (removed, now_empty) = match slots.get_mut(&key) {
                    None => (0, false),
                    Some(Slot::Set(set)) => {
                        let removed = members.iter().filter(|m| set.remove(*m)).count();
                        (removed, set.is_empty())
                    }
                    Some(_) => return Err(wrong_type(&key)),
                };
                if now_empty {
                    slots.remove(&key);
                }
                KeyValueReply::Integer(removed as i64)
            }
            KeyValueCommand::SMembers { key } => match slots.get(&key) {
                None => KeyValueReply::Members(Vec::new()),
                Some(Slot::Set(set)) => KeyValueReply::Members(set.iter().cloned().collect()),
                Some(_) => return Err(wrong_type(&key)),
            },
            KeyValueCommand::RPush { key, values } => {
                let slot = slots.entry(key.clone()).or_insert_with(|| Slot::List(Vec::new()));
                match slot {
                    Slot::List(list) => {
                        list.extend(values);
                        KeyValueReply::Integer(list.len() as i64)
                    }
                    _ => return Err(wrong_type(&key)),
                }
            }
            KeyValueCommand::LRange { key } => match slots.get(&key) {
                None => KeyValueReply::Members(Vec::new()),
                Some(Slot::List(list)) => KeyValueReply::Members(list.clone()),
                Some(_) => return Err(wrong_type(&key)),
            },
        };
        Ok(reply)
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.state.lock().stats.releases += 1;
        debug!(database = %self.database, "Released key-value connection");
        Ok(())
    }
}
