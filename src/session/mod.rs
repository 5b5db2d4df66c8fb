//! Unit of work bound to one native connection
//!
//! A [`Session`] holds the identity map (record key → live object), the
//! native-entry snapshots used for dirty checking, one persister per entity
//! and the queue of pending inserts, updates and deletes. Nothing is written
//! until [`Session::flush`] runs. Sessions are single-threaded; open one per
//! unit of work from a [`Datastore`](crate::Datastore).
//!
//! # Flush order
//!
//! Inserts run first, then updates, then deletes. Within each kind,
//! operations are grouped by entity in first-seen order. For every group the
//! pre-operations of all operations run first (in queue order), then the
//! operations themselves (consecutive inserts batched when the backend
//! supports it), then all cascade operations of the group.
//!
//! An optimistic-locking failure aborts only the write it belongs to (and its
//! cascades); the flush carries on and the first such failure is returned at
//! the end. Any other error stops the flush and leaves the operations that
//! did not complete queued.

pub mod pending;
pub mod transaction;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::config::{DatastoreConfig, FlushMode};
use crate::engine::{NativeBackend, NativeEntryPersister};
use crate::error::{DatastoreError, Result};
use crate::events::PersistenceListener;
use crate::model::builder::downcast;
use crate::model::{MappingContext, ObjectRef, PersistentEntity, object_address};
use crate::query::Query;

pub use pending::{Action, OperationKind, PendingOperation};
pub(crate) use pending::{OperationQueue, Payload};
pub use transaction::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    /// Terminal; the native connection has been released
    Disconnected,
}

type RecordKey<K> = (String, K);

/// A flush that stopped on an error, with the operations it did not complete
struct Interrupted<B: NativeBackend> {
    error: DatastoreError,
    unfinished: Vec<PendingOperation<B>>,
}

type FlushResult<B> = std::result::Result<(), Interrupted<B>>;

/// A failed record write takes its cascades back with it
fn reattach<B: NativeBackend>(
    failed: Option<PendingOperation<B>>,
    cascades: Vec<PendingOperation<B>>,
) -> Vec<PendingOperation<B>> {
    match failed {
        Some(mut operation) => {
            operation.cascade_operations = cascades;
            vec![operation]
        }
        None => Vec::new(),
    }
}

/// A unit of work over one native connection
pub struct Session<B: NativeBackend> {
    backend: B,
    context: Arc<MappingContext>,
    listeners: Vec<Arc<dyn PersistenceListener>>,
    persisters: HashMap<String, Rc<NativeEntryPersister<B>>>,
    objects: HashMap<RecordKey<B::Key>, ObjectRef>,
    entries: HashMap<RecordKey<B::Key>, B::Entry>,
    associations: HashMap<(String, B::Key, String), Vec<B::Key>>,
    inserts: OperationQueue<B>,
    updates: OperationQueue<B>,
    deletes: OperationQueue<B>,
    persisting: HashMap<usize, B::Key>,
    flush_mode: FlushMode,
    transaction: Option<Transaction>,
    state: SessionState,
}

impl<B: NativeBackend> Session<B> {
    pub(crate) fn new(
        backend: B,
        context: Arc<MappingContext>,
        config: &DatastoreConfig,
        listeners: Vec<Arc<dyn PersistenceListener>>,
    ) -> Self {
        Self {
            backend,
            context,
            listeners,
            persisters: HashMap::new(),
            objects: HashMap::new(),
            entries: HashMap::new(),
            associations: HashMap::new(),
            inserts: OperationQueue::default(),
            updates: OperationQueue::default(),
            deletes: OperationQueue::default(),
            persisting: HashMap::new(),
            flush_mode: config.flush_mode,
            transaction: None,
            state: SessionState::Connected,
        }
    }

    pub fn context(&self) -> &Arc<MappingContext> {
        &self.context
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub(crate) fn ensure_connected(&self) -> Result<()> {
        match self.state {
            SessionState::Connected => Ok(()),
            SessionState::Disconnected => Err(DatastoreError::connection("session is disconnected")),
        }
    }

    pub(crate) fn listeners(&self) -> &[Arc<dyn PersistenceListener>] {
        &self.listeners
    }

    // =========================================================================
    // Persisters
    // =========================================================================

    /// Persister for `T`, or `None` if `T` is not a registered entity
    pub fn create_persister<T: 'static>(&mut self) -> Option<Rc<NativeEntryPersister<B>>> {
        let entity = self.context.persistent_entity_for::<T>()?;
        Some(self.persister(&entity))
    }

    pub(crate) fn persister(&mut self, entity: &Arc<PersistentEntity>) -> Rc<NativeEntryPersister<B>> {
        let context = &self.context;
        let persister = self
            .persisters
            .entry(entity.name().to_string())
            .or_insert_with(|| {
                Rc::new(NativeEntryPersister::new(
                    Arc::clone(entity),
                    Arc::clone(context),
                ))
            });
        Rc::clone(persister)
    }

    fn persister_named(&mut self, entity: &str) -> Result<Rc<NativeEntryPersister<B>>> {
        let entity = self.entity_named(entity)?;
        Ok(self.persister(&entity))
    }

    fn entity_named(&self, entity: &str) -> Result<Arc<PersistentEntity>> {
        self.context.persistent_entity(entity).ok_or_else(|| {
            DatastoreError::illegal_argument(format!("'{}' is not a persistent entity", entity))
        })
    }

    fn entity_for<T: 'static>(&self) -> Result<Arc<PersistentEntity>> {
        self.context.persistent_entity_for::<T>().ok_or_else(|| {
            DatastoreError::illegal_argument(format!(
                "{} is not a persistent entity",
                std::any::type_name::<T>()
            ))
        })
    }

    fn entity_for_object(&self, object: &ObjectRef) -> Result<Arc<PersistentEntity>> {
        self.context.entity_for_object(object).ok_or_else(|| {
            DatastoreError::illegal_argument("object is not an instance of a persistent entity")
        })
    }

    // =========================================================================
    // Persist / Retrieve / Delete
    // =========================================================================

    /// Queue an insert or update; returns the key (`None` if cancelled)
    pub fn persist<T: 'static>(&mut self, object: &Rc<RefCell<T>>) -> Result<Option<B::Key>> {
        let object: ObjectRef = object.clone();
        self.persist_object(&object)
    }

    pub fn persist_object(&mut self, object: &ObjectRef) -> Result<Option<B::Key>> {
        self.ensure_connected()?;
        let entity = self.entity_for_object(object)?;
        self.persister(&entity).persist(self, object)
    }

    /// Load a `T` by key
    ///
    /// Fails with `IllegalArgument` when the stored record is a different
    /// entity of the same hierarchy; use [`Session::retrieve_object`] for
    /// polymorphic loads.
    pub fn retrieve<T: 'static>(&mut self, key: &B::Key) -> Result<Option<Rc<RefCell<T>>>> {
        self.ensure_connected()?;
        let entity = self.entity_for::<T>()?;
        match self.persister(&entity).retrieve(self, key)? {
            Some(object) => downcast::<T>(object).map(Some),
            None => Ok(None),
        }
    }

    /// Load an instance of `entity` (or one of its subtypes) by key
    pub fn retrieve_object(&mut self, entity: &str, key: &B::Key) -> Result<Option<ObjectRef>> {
        self.ensure_connected()?;
        self.persister_named(entity)?.retrieve(self, key)
    }

    /// Load several `T`s; missing records are skipped
    pub fn retrieve_all<T: 'static>(&mut self, keys: &[B::Key]) -> Result<Vec<Rc<RefCell<T>>>> {
        self.ensure_connected()?;
        let entity = self.entity_for::<T>()?;
        self.persister(&entity)
            .retrieve_all(self, keys)?
            .into_iter()
            .flatten()
            .map(downcast::<T>)
            .collect()
    }

    /// Load several instances of `entity`, one slot per key
    pub fn retrieve_all_objects(&mut self, entity: &str, keys: &[B::Key]) -> Result<Vec<Option<ObjectRef>>> {
        self.ensure_connected()?;
        self.persister_named(entity)?.retrieve_all(self, keys)
    }

    pub fn delete<T: 'static>(&mut self, object: &Rc<RefCell<T>>) -> Result<()> {
        let object: ObjectRef = object.clone();
        self.delete_object(&object)
    }

    pub fn delete_object(&mut self, object: &ObjectRef) -> Result<()> {
        self.ensure_connected()?;
        let entity = self.entity_for_object(object)?;
        self.persister(&entity).delete(self, object)
    }

    pub fn delete_all<T: 'static>(&mut self, objects: &[Rc<RefCell<T>>]) -> Result<()> {
        for object in objects {
            self.delete(object)?;
        }
        Ok(())
    }

    /// Reload an instance from its stored entry, discarding unsaved changes
    pub fn refresh<T: 'static>(&mut self, object: &Rc<RefCell<T>>) -> Result<()> {
        self.ensure_connected()?;
        let object: ObjectRef = object.clone();
        let entity = self.entity_for_object(&object)?;
        self.persister(&entity).refresh(self, &object)
    }

    /// Whether this exact instance is in the identity map
    pub fn contains<T: 'static>(&self, object: &Rc<RefCell<T>>) -> bool {
        let object: ObjectRef = object.clone();
        let address = object_address(&object);
        self.objects.values().any(|o| object_address(o) == address)
    }

    /// Forget cached objects, snapshots and pending operations
    pub fn clear(&mut self) {
        self.objects.clear();
        self.entries.clear();
        self.associations.clear();
        self.inserts = OperationQueue::default();
        self.updates = OperationQueue::default();
        self.deletes = OperationQueue::default();
        self.persisting.clear();
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn create_query(&self, entity: &str) -> Result<Query> {
        let entity = self.entity_named(entity)?;
        Ok(Query::new(entity.name()))
    }

    pub fn create_query_for<T: 'static>(&self) -> Result<Query> {
        let entity = self.entity_for::<T>()?;
        Ok(Query::new(entity.name()))
    }

    pub(crate) fn auto_flush(&mut self) -> Result<()> {
        if self.flush_mode == FlushMode::Auto && self.transaction.is_none() {
            self.flush()?;
        }
        Ok(())
    }

    /// Reconstitute a query row, reusing the cached instance if any
    pub(crate) fn load_entry(
        &mut self,
        entity: &Arc<PersistentEntity>,
        key: &B::Key,
        entry: B::Entry,
    ) -> Result<ObjectRef> {
        if let Some(object) = self.cached_object(entity.root_name(), key) {
            return Ok(object);
        }
        self.persister(entity)
            .create_object_from_native_entry(self, key, entry)
    }

    // =========================================================================
    // Identity Map and Snapshots
    // =========================================================================

    /// Last known stored entry of a record
    pub fn cached_entry(&self, entity: &str, key: &B::Key) -> Option<&B::Entry> {
        let entity = self.context.persistent_entity(entity)?;
        self.snapshot(entity.root_name(), key)
    }

    pub(crate) fn snapshot(&self, root: &str, key: &B::Key) -> Option<&B::Entry> {
        self.entries.get(&(root.to_string(), key.clone()))
    }

    pub(crate) fn cache_entry(&mut self, root: &str, key: B::Key, entry: B::Entry) {
        self.entries.insert((root.to_string(), key), entry);
    }

    pub(crate) fn cached_object(&self, root: &str, key: &B::Key) -> Option<ObjectRef> {
        self.objects.get(&(root.to_string(), key.clone())).cloned()
    }

    pub(crate) fn cache_object(&mut self, root: &str, key: B::Key, object: ObjectRef) {
        self.objects.insert((root.to_string(), key), object);
    }

    pub(crate) fn is_tracked(&self, root: &str, key: &B::Key) -> bool {
        self.objects.contains_key(&(root.to_string(), key.clone()))
    }

    pub(crate) fn evict(&mut self, root: &str, key: &B::Key) {
        let record = (root.to_string(), key.clone());
        self.objects.remove(&record);
        self.entries.remove(&record);
        self.associations
            .retain(|(r, k, _), _| !(r == root && k == key));
    }

    pub(crate) fn association_snapshot(&self, root: &str, key: &B::Key, property: &str) -> Option<&Vec<B::Key>> {
        self.associations
            .get(&(root.to_string(), key.clone(), property.to_string()))
    }

    pub(crate) fn cache_association(&mut self, root: &str, key: B::Key, property: &str, keys: Vec<B::Key>) {
        self.associations
            .insert((root.to_string(), key, property.to_string()), keys);
    }

    pub(crate) fn persisting_key(&self, address: usize) -> Option<B::Key> {
        self.persisting.get(&address).cloned()
    }

    pub(crate) fn begin_persisting(&mut self, address: usize, key: B::Key) {
        self.persisting.insert(address, key);
    }

    pub(crate) fn end_persisting(&mut self, address: usize) {
        self.persisting.remove(&address);
    }

    // =========================================================================
    // Pending Operations
    // =========================================================================

    pub fn pending_operation_count(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }

    pub fn add_pending_insert(&mut self, operation: PendingOperation<B>) {
        self.inserts.push(operation);
    }

    pub fn add_pending_update(&mut self, operation: PendingOperation<B>) {
        self.updates.push(operation);
    }

    pub fn add_pending_delete(&mut self, operation: PendingOperation<B>) {
        self.deletes.push(operation);
    }

    /// Queue an operation according to its kind
    pub(crate) fn enqueue(&mut self, operation: PendingOperation<B>) {
        match operation.kind() {
            OperationKind::Insert => self.add_pending_insert(operation),
            OperationKind::Update => self.add_pending_update(operation),
            OperationKind::Delete => self.add_pending_delete(operation),
        }
    }

    pub(crate) fn has_pending_insert(&self, root: &str, key: &B::Key) -> bool {
        self.inserts.contains(root, key)
    }

    /// Remove the queued record write for a key, whatever its kind
    pub(crate) fn take_pending(&mut self, root: &str, key: &B::Key) -> Option<PendingOperation<B>> {
        self.inserts
            .take(root, key)
            .or_else(|| self.updates.take(root, key))
            .or_else(|| self.deletes.take(root, key))
    }

    pub fn flush_mode(&self) -> FlushMode {
        self.flush_mode
    }

    pub fn set_flush_mode(&mut self, mode: FlushMode) {
        self.flush_mode = mode;
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Execute every pending operation
    ///
    /// When the flush stops on an error, every operation that did not
    /// complete stays queued ahead of the untouched ones, so fixing the cause
    /// and flushing again resumes where this flush stopped. A failed custom
    /// action cannot be re-run and is dropped together with its cascades.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_connected()?;
        let mut conflicts = Vec::new();

        while self.pending_operation_count() > 0 {
            for kind in [OperationKind::Insert, OperationKind::Update, OperationKind::Delete] {
                while let Some((entity, operations)) = self.queue_mut(kind).pop_group() {
                    debug!(
                        entity = %entity,
                        kind = ?kind,
                        operations = operations.len(),
                        "Flushing pending operations"
                    );
                    if let Err(Interrupted { error, unfinished }) =
                        self.flush_group(operations, &mut conflicts)
                    {
                        warn!(
                            error = %error,
                            unfinished = unfinished.len(),
                            "Flush interrupted, unfinished operations stay queued"
                        );
                        self.restore(unfinished);
                        return Err(error);
                    }
                }
            }
        }

        match conflicts.into_iter().next() {
            Some(conflict) => Err(conflict),
            None => Ok(()),
        }
    }

    fn queue_mut(&mut self, kind: OperationKind) -> &mut OperationQueue<B> {
        match kind {
            OperationKind::Insert => &mut self.inserts,
            OperationKind::Update => &mut self.updates,
            OperationKind::Delete => &mut self.deletes,
        }
    }

    /// Requeue operations of an interrupted flush, each by its own kind
    fn restore(&mut self, unfinished: Vec<PendingOperation<B>>) {
        let (inserts, rest): (Vec<_>, Vec<_>) = unfinished
            .into_iter()
            .partition(|op| op.kind() == OperationKind::Insert);
        let (updates, deletes): (Vec<_>, Vec<_>) =
            rest.into_iter().partition(|op| op.kind() == OperationKind::Update);
        self.inserts.restore(inserts);
        self.updates.restore(updates);
        self.deletes.restore(deletes);
    }

    fn flush_group(
        &mut self,
        mut operations: Vec<PendingOperation<B>>,
        conflicts: &mut Vec<DatastoreError>,
    ) -> FlushResult<B> {
        let mut failed = None;
        for operation in &mut operations {
            if let Err(error) = self.run_pre_operations(operation, conflicts) {
                failed = Some(error);
                break;
            }
        }
        if let Some(error) = failed {
            return Err(Interrupted {
                error,
                unfinished: operations,
            });
        }

        let mut cascades = Vec::new();
        let mut primaries = operations.into_iter().peekable();
        while let Some(mut operation) = primaries.next() {
            let outcome = if matches!(operation.payload, Payload::Store { .. }) {
                let mut batch = vec![operation];
                while let Some(next) =
                    primaries.next_if(|next| matches!(next.payload, Payload::Store { .. }))
                {
                    batch.push(next);
                }
                self.store_batch(batch).map(|stored| cascades.extend(stored))
            } else {
                let operation_cascades = operation.take_cascade_operations();
                match self.run(operation, conflicts) {
                    Ok(true) => {
                        cascades.extend(operation_cascades);
                        Ok(())
                    }
                    Ok(false) => Ok(()),
                    Err((error, failed)) => Err(Interrupted {
                        error,
                        unfinished: reattach(failed, operation_cascades),
                    }),
                }
            };

            if let Err(mut interrupted) = outcome {
                interrupted.unfinished.extend(primaries);
                interrupted.unfinished.extend(cascades);
                return Err(interrupted);
            }
        }

        self.execute_all(cascades, conflicts)
    }

    /// Run the pre-operations of `operation`, leaving unfinished ones on it
    fn run_pre_operations(
        &mut self,
        operation: &mut PendingOperation<B>,
        conflicts: &mut Vec<DatastoreError>,
    ) -> Result<()> {
        let mut pres = operation.take_pre_operations().into_iter();
        while let Some(pre) = pres.next() {
            if let Err(Interrupted { error, unfinished }) = self.execute(pre, conflicts) {
                operation.pre_operations = unfinished.into_iter().chain(pres).collect();
                return Err(error);
            }
        }
        Ok(())
    }

    /// Run one operation with its own pre and cascade operations
    fn execute(&mut self, mut operation: PendingOperation<B>, conflicts: &mut Vec<DatastoreError>) -> FlushResult<B> {
        if let Err(error) = self.run_pre_operations(&mut operation, conflicts) {
            return Err(Interrupted {
                error,
                unfinished: vec![operation],
            });
        }
        let cascades = operation.take_cascade_operations();
        match self.run(operation, conflicts) {
            Ok(true) => self.execute_all(cascades, conflicts),
            Ok(false) => Ok(()),
            Err((error, failed)) => Err(Interrupted {
                error,
                unfinished: reattach(failed, cascades),
            }),
        }
    }

    fn execute_all(&mut self, operations: Vec<PendingOperation<B>>, conflicts: &mut Vec<DatastoreError>) -> FlushResult<B> {
        let mut operations = operations.into_iter();
        while let Some(operation) = operations.next() {
            if let Err(mut interrupted) = self.execute(operation, conflicts) {
                interrupted.unfinished.extend(operations);
                return Err(interrupted);
            }
        }
        Ok(())
    }

    /// Run the operation itself; `Ok(false)` if it hit a version conflict
    ///
    /// On any other error a record write is handed back for requeueing.
    fn run(
        &mut self,
        operation: PendingOperation<B>,
        conflicts: &mut Vec<DatastoreError>,
    ) -> std::result::Result<bool, (DatastoreError, Option<PendingOperation<B>>)> {
        let result = match operation.payload {
            Payload::Run(action) => action(self).map_err(|e| (e, None)),
            _ => self.write_record(&operation).map_err(|e| (e, Some(operation))),
        };

        match result {
            Ok(()) => Ok(true),
            Err((conflict @ DatastoreError::OptimisticLocking { .. }, _)) => {
                warn!(error = %conflict, "Skipping write after version conflict");
                conflicts.push(conflict);
                Ok(false)
            }
            Err((error, None)) => {
                warn!(error = %error, "Custom flush action failed and was dropped");
                Err((error, None))
            }
            Err(failed) => Err(failed),
        }
    }

    /// Write a record operation; the snapshot changes only on success
    fn write_record(&mut self, operation: &PendingOperation<B>) -> Result<()> {
        let entity = &operation.entity;
        let root = entity.root_name();
        let Some(key) = operation.key.clone() else {
            return Err(DatastoreError::illegal_argument(format!(
                "pending write for '{}' has no key",
                entity.name()
            )));
        };

        match &operation.payload {
            Payload::Store { entry } => {
                self.backend.store_entry(entity, &key, entry.clone())?;
                self.cache_entry(root, key, entry.clone());
            }
            Payload::Update { entry, object } => {
                self.persister(entity)
                    .run_update(self, &key, entry.clone(), object)?;
            }
            Payload::Delete => {
                self.backend.delete_entry(entity, &key)?;
                self.evict(root, &key);
            }
            Payload::Run(_) => {}
        }
        Ok(())
    }

    /// Store consecutive inserts, in one round trip when supported
    ///
    /// Returns the cascades of the stored records.
    fn store_batch(&mut self, mut batch: Vec<PendingOperation<B>>) -> std::result::Result<Vec<PendingOperation<B>>, Interrupted<B>> {
        let Some(entity) = batch.first().map(|op| Arc::clone(op.entity())) else {
            return Ok(Vec::new());
        };
        let root = entity.root_name().to_string();

        if self.backend.supports_batch_insert() && batch.len() > 1 {
            let records: Vec<(B::Key, B::Entry)> = batch
                .iter()
                .filter_map(|op| match (&op.key, &op.payload) {
                    (Some(key), Payload::Store { entry }) => Some((key.clone(), entry.clone())),
                    _ => None,
                })
                .collect();
            if records.len() == batch.len() {
                trace!(entity = %entity.name(), records = records.len(), "Batch insert");
                if let Err(error) = self.backend.store_entries(&entity, records.clone()) {
                    return Err(Interrupted {
                        error,
                        unfinished: batch,
                    });
                }
                for (key, entry) in records {
                    self.cache_entry(&root, key, entry);
                }
                return Ok(batch
                    .iter_mut()
                    .flat_map(|op| op.take_cascade_operations())
                    .collect());
            }
        }

        let mut cascades = Vec::new();
        let mut operations = batch.into_iter();
        while let Some(mut operation) = operations.next() {
            if let Err(error) = self.write_record(&operation) {
                let mut unfinished = vec![operation];
                unfinished.extend(operations);
                unfinished.extend(cascades);
                return Err(Interrupted { error, unfinished });
            }
            cascades.extend(operation.take_cascade_operations());
        }
        Ok(cascades)
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Start a session-scoped transaction
    pub fn begin_transaction(&mut self) -> Result<&Transaction> {
        self.ensure_connected()?;
        if self.transaction.is_some() {
            return Err(DatastoreError::transaction("a transaction is already active"));
        }
        self.backend.begin_transaction()?;
        let transaction = self.transaction.insert(Transaction::begin());
        debug!(transaction = %transaction.id(), "Transaction started");
        Ok(&*transaction)
    }

    /// Flush and commit the active transaction
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_connected()?;
        if self.transaction.is_none() {
            return Err(DatastoreError::transaction("no active transaction"));
        }
        self.flush()?;
        self.backend.commit()?;
        if let Some(transaction) = self.transaction.take() {
            debug!(transaction = %transaction.id(), "Transaction committed");
        }
        Ok(())
    }

    /// Discard pending operations and caches, then roll back natively
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_connected()?;
        let Some(transaction) = self.transaction.take() else {
            return Err(DatastoreError::transaction("no active transaction"));
        };
        self.clear();
        debug!(transaction = %transaction.id(), "Transaction rolled back");
        self.backend.rollback()
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Release the native connection
    ///
    /// Any active transaction is rolled back first. The connection is
    /// released even if that fails; the first error is returned.
    pub fn disconnect(&mut self) -> Result<()> {
        if self.state == SessionState::Disconnected {
            return Ok(());
        }

        let mut first_error = None;
        if self.transaction.take().is_some() {
            if let Err(e) = self.backend.rollback() {
                warn!(error = %e, "Rollback failed during disconnect");
                first_error = Some(e);
            }
        }
        self.clear();
        self.persisters.clear();
        self.state = SessionState::Disconnected;

        if let Err(e) = self.backend.release() {
            warn!(error = %e, "Releasing native connection failed");
            first_error.get_or_insert(e);
        }
        debug!(backend = %self.backend.name(), "Session disconnected");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<B: NativeBackend> Drop for Session<B> {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!(error = %e, "Disconnect on drop failed");
        }
    }
}

impl<B: NativeBackend> std::fmt::Debug for Session<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("backend", &self.backend.name())
            .field("state", &self.state)
            .field("cached_objects", &self.objects.len())
            .field("pending_operations", &self.pending_operation_count())
            .field("flush_mode", &self.flush_mode)
            .field("transaction", &self.transaction)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Datastore;
    use crate::document::{DocumentBackend, MemoryDocumentClient};
    use crate::document::memory::MemoryDocumentConnection;
    use crate::model::{EntityBuilder, object};
    use crate::types::PropertyType;

    type DocumentSession = Session<DocumentBackend<MemoryDocumentConnection>>;

    #[derive(Debug, Default)]
    struct Note {
        id: Option<i64>,
        version: Option<i64>,
        text: String,
    }

    fn datastore(client: &MemoryDocumentClient) -> Datastore<MemoryDocumentClient> {
        let context = MappingContext::new();
        context
            .add(
                EntityBuilder::<Note>::new()
                    .identity("id", PropertyType::Integer, |n| n.id, |n, v| n.id = v)
                    .version("version", |n| n.version, |n, v| n.version = v)
                    .property("text", PropertyType::String, |n| n.text.clone(), |n, v| n.text = v),
            )
            .unwrap();
        let config = DatastoreConfig::builder("memory://local").build();
        Datastore::new(client.clone(), Arc::new(context), config).unwrap()
    }

    fn note(text: &str) -> Rc<RefCell<Note>> {
        object(Note {
            text: text.to_string(),
            ..Default::default()
        })
    }

    fn recording(
        session: &DocumentSession,
        kind: OperationKind,
        log: &Rc<RefCell<Vec<&'static str>>>,
        label: &'static str,
    ) -> PendingOperation<DocumentBackend<MemoryDocumentConnection>> {
        let entity = session.context().persistent_entity("Note").unwrap();
        let log = Rc::clone(log);
        PendingOperation::new(kind, entity, None, move |_: &mut DocumentSession| {
            log.borrow_mut().push(label);
            Ok(())
        })
    }

    // =========================================================================
    // Flush Ordering
    // =========================================================================

    #[test]
    fn test_flush_runs_inserts_then_updates_then_deletes() {
        let client = MemoryDocumentClient::new();
        let datastore = datastore(&client);
        let mut session = datastore.connect().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));

        let delete = recording(&session, OperationKind::Delete, &log, "delete");
        let update = recording(&session, OperationKind::Update, &log, "update");
        let mut insert = recording(&session, OperationKind::Insert, &log, "insert");
        insert.add_pre_operation(recording(&session, OperationKind::Insert, &log, "pre"));
        insert.add_cascade_operation(recording(&session, OperationKind::Insert, &log, "cascade"));

        session.add_pending_delete(delete);
        session.add_pending_update(update);
        session.add_pending_insert(insert);
        assert_eq!(session.pending_operation_count(), 3);

        session.flush().unwrap();
        assert_eq!(*log.borrow(), vec!["pre", "insert", "cascade", "update", "delete"]);
        assert_eq!(session.pending_operation_count(), 0);
    }

    #[test]
    fn test_group_runs_all_pre_operations_first() {
        let client = MemoryDocumentClient::new();
        let datastore = datastore(&client);
        let mut session = datastore.connect().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));

        for (label, pre, cascade) in [("a", "pre-a", "post-a"), ("b", "pre-b", "post-b")] {
            let mut operation = recording(&session, OperationKind::Insert, &log, label);
            operation.add_pre_operation(recording(&session, OperationKind::Insert, &log, pre));
            operation.add_cascade_operation(recording(&session, OperationKind::Insert, &log, cascade));
            session.add_pending_insert(operation);
        }

        session.flush().unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["pre-a", "pre-b", "a", "b", "post-a", "post-b"]
        );
    }

    #[test]
    fn test_version_conflict_skips_cascades_and_continues() {
        let client = MemoryDocumentClient::new();
        let datastore = datastore(&client);
        let mut session = datastore.connect().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let entity = session.context().persistent_entity("Note").unwrap();

        let mut failing = PendingOperation::new(
            OperationKind::Update,
            Arc::clone(&entity),
            None,
            |_: &mut DocumentSession| Err(DatastoreError::optimistic_locking("Note", 1)),
        );
        failing.add_cascade_operation(recording(&session, OperationKind::Update, &log, "skipped"));
        session.add_pending_update(failing);
        session.add_pending_update(recording(&session, OperationKind::Update, &log, "after"));
        session.add_pending_delete(recording(&session, OperationKind::Delete, &log, "delete"));

        let err = session.flush().unwrap_err();
        assert!(matches!(err, DatastoreError::OptimisticLocking { .. }));
        assert_eq!(*log.borrow(), vec!["after", "delete"]);
    }

    #[test]
    fn test_other_errors_abort_flush() {
        let client = MemoryDocumentClient::new();
        let datastore = datastore(&client);
        let mut session = datastore.connect().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let entity = session.context().persistent_entity("Note").unwrap();

        session.add_pending_insert(PendingOperation::new(
            OperationKind::Insert,
            entity,
            None,
            |_: &mut DocumentSession| Err(DatastoreError::backend("boom")),
        ));
        session.add_pending_delete(recording(&session, OperationKind::Delete, &log, "delete"));

        assert!(matches!(session.flush(), Err(DatastoreError::Backend(_))));
        assert!(log.borrow().is_empty());

        // The failed action is gone; the delete it blocked is still queued
        assert_eq!(session.pending_operation_count(), 1);
        session.flush().unwrap();
        assert_eq!(*log.borrow(), vec!["delete"]);
    }

    #[test]
    fn test_failed_store_stays_queued() {
        let client = MemoryDocumentClient::new();
        let datastore = datastore(&client);
        let mut session = datastore.connect().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));

        let first = note("first");
        let second = note("second");
        session.persist(&first).unwrap();
        let key = session.persist(&second).unwrap().unwrap();
        session.add_pending_update(recording(&session, OperationKind::Update, &log, "update"));

        client.set_fail_writes(true);
        assert!(matches!(session.flush(), Err(DatastoreError::Backend(_))));
        assert_eq!(session.pending_operation_count(), 3);
        assert!(session.has_pending_insert("Note", &key));
        assert!(session.cached_entry("Note", &key).is_none());
        assert!(log.borrow().is_empty());

        client.set_fail_writes(false);
        session.flush().unwrap();
        assert_eq!(session.pending_operation_count(), 0);
        assert_eq!(client.documents("test", "note").len(), 2);
        assert_eq!(*log.borrow(), vec!["update"]);
        assert!(session.cached_entry("Note", &key).is_some());
    }

    // =========================================================================
    // Identity Map and Dirty Checking
    // =========================================================================

    #[test]
    fn test_retrieve_returns_cached_instance() {
        let client = MemoryDocumentClient::new();
        let datastore = datastore(&client);
        let mut session = datastore.connect().unwrap();

        let original = note("hello");
        let key = session.persist(&original).unwrap().unwrap();
        session.flush().unwrap();
        assert!(session.contains(&original));

        let loaded = session.retrieve::<Note>(&key).unwrap().unwrap();
        assert!(Rc::ptr_eq(&original, &loaded));
        assert!(session.cached_entry("Note", &key).is_some());
    }

    #[test]
    fn test_unchanged_instance_queues_nothing() {
        let client = MemoryDocumentClient::new();
        let datastore = datastore(&client);
        let mut session = datastore.connect().unwrap();

        let original = note("hello");
        session.persist(&original).unwrap();
        session.flush().unwrap();
        let writes = client.stats().writes;

        session.persist(&original).unwrap();
        assert_eq!(session.pending_operation_count(), 0);
        session.flush().unwrap();
        assert_eq!(client.stats().writes, writes);

        original.borrow_mut().text = "changed".to_string();
        session.persist(&original).unwrap();
        assert_eq!(session.pending_operation_count(), 1);
        session.flush().unwrap();
        assert_eq!(original.borrow().version, Some(1));
    }

    #[test]
    fn test_clear_forgets_instances() {
        let client = MemoryDocumentClient::new();
        let datastore = datastore(&client);
        let mut session = datastore.connect().unwrap();

        let original = note("hello");
        let key = session.persist(&original).unwrap().unwrap();
        session.flush().unwrap();
        session.clear();
        assert!(!session.contains(&original));

        let loaded = session.retrieve::<Note>(&key).unwrap().unwrap();
        assert!(!Rc::ptr_eq(&original, &loaded));
        assert_eq!(loaded.borrow().text, "hello");
    }

    // =========================================================================
    // Flush Modes and Transactions
    // =========================================================================

    #[test]
    fn test_commit_flush_mode_defers_writes() {
        let client = MemoryDocumentClient::new();
        let datastore = datastore(&client);
        let mut session = datastore.connect().unwrap();
        session.set_flush_mode(FlushMode::Commit);

        session.persist(&note("a")).unwrap();
        let query = session.create_query("Note").unwrap();
        assert_eq!(query.count(&mut session).unwrap(), 0);

        session.flush().unwrap();
        assert_eq!(query.count(&mut session).unwrap(), 1);
    }

    #[test]
    fn test_auto_flush_before_query() {
        let client = MemoryDocumentClient::new();
        let datastore = datastore(&client);
        let mut session = datastore.connect().unwrap();

        session.persist(&note("a")).unwrap();
        let query = session.create_query("Note").unwrap();
        assert_eq!(query.count(&mut session).unwrap(), 1);
    }

    #[test]
    fn test_rollback_discards_pending_writes() {
        let client = MemoryDocumentClient::new();
        let datastore = datastore(&client);
        let mut session = datastore.connect().unwrap();

        session.begin_transaction().unwrap();
        assert!(session.begin_transaction().is_err());
        session.persist(&note("a")).unwrap();
        session.rollback().unwrap();

        assert_eq!(session.pending_operation_count(), 0);
        assert!(session.transaction().is_none());
        assert!(client.documents("test", "note").is_empty());
        assert!(matches!(session.commit(), Err(DatastoreError::Transaction(_))));
    }

    #[test]
    fn test_commit_flushes() {
        let client = MemoryDocumentClient::new();
        let datastore = datastore(&client);
        let mut session = datastore.connect().unwrap();

        session.begin_transaction().unwrap();
        session.persist(&note("a")).unwrap();
        session.commit().unwrap();
        assert_eq!(client.documents("test", "note").len(), 1);
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    #[test]
    fn test_disconnect_releases_once() {
        let client = MemoryDocumentClient::new();
        let datastore = datastore(&client);
        let mut session = datastore.connect().unwrap();
        assert_eq!(client.open_connections(), 1);

        session.disconnect().unwrap();
        session.disconnect().unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(client.stats().releases, 1);

        let err = session.persist(&note("late")).unwrap_err();
        assert!(matches!(err, DatastoreError::Connection(_)));
        drop(session);
        assert_eq!(client.stats().releases, 1);
    }

    #[test]
    fn test_drop_disconnects() {
        let client = MemoryDocumentClient::new();
        let datastore = datastore(&client);
        {
            let _session = datastore.connect().unwrap();
            assert_eq!(client.open_connections(), 1);
        }
        assert_eq!(client.open_connections(), 0);
    }
}
