//! Conversion between domain objects and native entries
//!
//! A [`NativeEntryPersister`] exists per (entity, session). It builds native
//! entries from live objects, queues the resulting writes on the session,
//! runs the version-checked update path at flush time and reconstitutes
//! objects from stored entries, resolving associations through the session's
//! identity map.

use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, trace, warn};

use crate::access::EntityAccess;
use crate::engine::{NativeBackend, VersionGuard};
use crate::error::{DatastoreError, Result};
use crate::model::{
    CollectionKind, IdentityGenerator, MappingContext, ObjectRef, PersistentEntity,
    PersistentProperty, PropertyKind, PropertyValue, object_address,
};
use crate::query::{Junction, restrictions};
use crate::session::{OperationKind, Payload, PendingOperation, Session};
use crate::types::version_number;

#[derive(Debug, Clone, Copy)]
enum Event {
    Insert,
    Update,
    Delete,
}

/// Operations collected while building an entry
struct Cascades<B: NativeBackend> {
    pre: Vec<PendingOperation<B>>,
    post: Vec<PendingOperation<B>>,
}

impl<B: NativeBackend> Cascades<B> {
    fn new() -> Self {
        Self {
            pre: Vec::new(),
            post: Vec::new(),
        }
    }

    fn attach(self, operation: &mut PendingOperation<B>) {
        for pre in self.pre {
            operation.add_pre_operation(pre);
        }
        for post in self.post {
            operation.add_cascade_operation(post);
        }
    }

    /// Queue collected operations on their own
    fn requeue(self, session: &mut Session<B>) {
        for operation in self.pre.into_iter().chain(self.post) {
            session.enqueue(operation);
        }
    }
}

/// Per-entity persister bound to a session's backend type
pub struct NativeEntryPersister<B: NativeBackend> {
    entity: Arc<PersistentEntity>,
    context: Arc<MappingContext>,
    _backend: PhantomData<fn() -> B>,
}

impl<B: NativeBackend> NativeEntryPersister<B> {
    pub fn new(entity: Arc<PersistentEntity>, context: Arc<MappingContext>) -> Self {
        Self {
            entity,
            context,
            _backend: PhantomData,
        }
    }

    pub fn entity(&self) -> &Arc<PersistentEntity> {
        &self.entity
    }

    fn access(&self, entity: &Arc<PersistentEntity>, object: &ObjectRef) -> EntityAccess {
        EntityAccess::new(
            Arc::clone(entity),
            Rc::clone(object),
            self.context.conversion_service(),
        )
    }

    fn entity_of(&self, object: &ObjectRef) -> Result<Arc<PersistentEntity>> {
        self.context.entity_for_object(object).ok_or_else(|| {
            DatastoreError::illegal_argument("object is not an instance of a persistent entity")
        })
    }

    fn target_of(&self, property: &PersistentProperty) -> Result<Arc<PersistentEntity>> {
        let name = property.target_entity().unwrap_or_default();
        self.context.persistent_entity(name).ok_or_else(|| {
            DatastoreError::mapping(format!(
                "{}.{} targets unregistered entity '{}'",
                self.entity.name(),
                property.name(),
                name
            ))
        })
    }

    // =========================================================================
    // Persist
    // =========================================================================

    /// Queue an insert or update for `object`
    ///
    /// Returns the record key, or `None` when a listener cancelled the insert.
    /// Nothing is written until the session flushes.
    pub fn persist(&self, session: &mut Session<B>, object: &ObjectRef) -> Result<Option<B::Key>> {
        let entity = &self.entity;
        if entity.is_external() {
            return Err(DatastoreError::illegal_argument(format!(
                "'{}' is managed by another datastore",
                entity.name()
            )));
        }
        if entity.is_embedded() {
            return Err(DatastoreError::illegal_argument(format!(
                "'{}' is embedded and is persisted with its owner",
                entity.name()
            )));
        }

        let address = object_address(object);
        if let Some(key) = session.persisting_key(address) {
            return Ok(Some(key));
        }

        let access = self.access(entity, object);
        let root = entity.root_name();
        let generator = entity.mapping().identity_generator;

        let existing = match access.identifier()? {
            Some(id) => Some(session.backend().key_from_value(&id)?),
            None => None,
        };

        let (key, insert) = match existing {
            Some(key) => {
                let insert = if session.has_pending_insert(root, &key) {
                    true
                } else if generator == IdentityGenerator::Assigned {
                    !session.is_tracked(root, &key)
                        && session.backend_mut().retrieve_entry(entity, &key)?.is_none()
                } else {
                    false
                };
                (Some(key), insert)
            }
            None if generator == IdentityGenerator::Assigned => {
                return Err(DatastoreError::illegal_argument(format!(
                    "'{}' uses assigned identifiers but none was set",
                    entity.name()
                )));
            }
            None => (None, true),
        };

        if insert {
            if !self.fire(session, &access, Event::Insert)? {
                debug!(entity = %entity.name(), "Insert cancelled by listener");
                return Ok(None);
            }
            self.validate(&access)?;

            let key = match key {
                Some(key) => key,
                None => {
                    let key = session.backend_mut().generate_identifier(entity, generator)?;
                    access.set_identifier(session.backend().key_to_value(&key))?;
                    key
                }
            };

            session.begin_persisting(address, key.clone());
            let result = self.queue_insert(session, &access, &key);
            session.end_persisting(address);
            result.map(|()| Some(key))
        } else {
            let Some(key) = key else {
                return Err(DatastoreError::illegal_argument("update without identifier"));
            };
            session.begin_persisting(address, key.clone());
            let result = self.queue_update(session, &access, &key);
            session.end_persisting(address);
            result.map(|()| Some(key))
        }
    }

    fn queue_insert(&self, session: &mut Session<B>, access: &EntityAccess, key: &B::Key) -> Result<()> {
        let entity = &self.entity;
        let root = entity.root_name();

        if let Some(version) = entity.version() {
            if access.get_value(version.name())?.is_null() {
                access.set(version.name(), json!(0).into())?;
            }
        }

        // Re-persisting an unflushed object replaces its pending insert
        self.discard_pending(session, root, key);

        let mut entry = session.backend().create_new_entry(entity);
        self.write_scalars(session.backend(), entity, access, &mut entry)?;
        let mut cascades = self.write_associations(session, access, key, &mut entry)?;
        cascades
            .post
            .extend(self.index_properties(session.backend(), key, &entry, None));

        session.cache_object(root, key.clone(), Rc::clone(access.object()));

        let mut operation = PendingOperation::with_payload(
            OperationKind::Insert,
            Arc::clone(entity),
            Some(key.clone()),
            Payload::Store { entry },
        );
        cascades.attach(&mut operation);
        trace!(entity = %entity.name(), key = %key, "Queued insert");
        session.enqueue(operation);
        Ok(())
    }

    fn queue_update(&self, session: &mut Session<B>, access: &EntityAccess, key: &B::Key) -> Result<()> {
        let entity = &self.entity;
        let root = entity.root_name();

        let mut entry = session.backend().create_new_entry(entity);
        self.write_scalars(session.backend(), entity, access, &mut entry)?;
        let cascades = self.write_associations(session, access, key, &mut entry)?;

        let snapshot = session.snapshot(root, key).cloned();
        if snapshot.as_ref() == Some(&entry) {
            debug!(entity = %entity.name(), key = %key, "No changes, skipping update");
            cascades.requeue(session);
            return Ok(());
        }

        if !self.fire(session, access, Event::Update)? {
            debug!(entity = %entity.name(), key = %key, "Update cancelled by listener");
            cascades.requeue(session);
            return Ok(());
        }
        self.validate(access)?;

        // Listeners may have changed scalar properties
        self.write_scalars(session.backend(), entity, access, &mut entry)?;

        let mut cascades = cascades;
        cascades.post.extend(self.index_properties(
            session.backend(),
            key,
            &entry,
            snapshot.as_ref(),
        ));

        self.discard_pending(session, root, key);
        session.cache_object(root, key.clone(), Rc::clone(access.object()));

        let mut operation = PendingOperation::with_payload(
            OperationKind::Update,
            Arc::clone(entity),
            Some(key.clone()),
            Payload::Update {
                entry,
                object: Rc::clone(access.object()),
            },
        );
        cascades.attach(&mut operation);
        trace!(entity = %entity.name(), key = %key, "Queued update");
        session.enqueue(operation);
        Ok(())
    }

    /// Drop the queued write for a record, keeping the child writes it carried
    ///
    /// Index actions are left out; they are rebuilt with the replacement.
    fn discard_pending(&self, session: &mut Session<B>, root: &str, key: &B::Key) {
        let Some(mut previous) = session.take_pending(root, key) else {
            return;
        };
        trace!(?previous, "Replacing pending operation");
        let nested = previous
            .take_pre_operations()
            .into_iter()
            .chain(previous.take_cascade_operations());
        for operation in nested.filter(|op| !op.is_action()) {
            session.enqueue(operation);
        }
    }

    fn fire(&self, session: &Session<B>, access: &EntityAccess, event: Event) -> Result<bool> {
        for listener in session.listeners() {
            let proceed = match event {
                Event::Insert => listener.before_insert(access)?,
                Event::Update => listener.before_update(access)?,
                Event::Delete => listener.before_delete(access)?,
            };
            if !proceed {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn validate(&self, access: &EntityAccess) -> Result<()> {
        let entity = access.entity();
        let mut errors = Vec::new();

        for property in entity.persistent_properties() {
            if property.is_nullable() || property.kind().is_to_many() {
                continue;
            }
            if access.get(property.name())?.is_null() {
                errors.push(format!("{} cannot be null", property.name()));
            }
        }
        if let Some(validator) = self.context.entity_validator(entity.name()) {
            if let Err(mut violations) = validator.validate(access) {
                errors.append(&mut violations);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DatastoreError::Validation {
                entity: entity.name().to_string(),
                errors,
            })
        }
    }

    // =========================================================================
    // Entry Building
    // =========================================================================

    /// Write identity, version, simple and embedded properties into `entry`
    fn write_scalars(
        &self,
        backend: &B,
        entity: &Arc<PersistentEntity>,
        access: &EntityAccess,
        entry: &mut B::Entry,
    ) -> Result<()> {
        let conversion = self.context.conversion_service();

        for property in entity.properties() {
            let field = backend.property_key(property);
            match property.kind() {
                PropertyKind::Identity => {
                    if let Some(id) = access.identifier()? {
                        let key = backend.key_from_value(&id)?;
                        backend.set_entry_value(entry, &field, backend.key_to_value(&key));
                    }
                }
                PropertyKind::Version => {
                    let raw = access.get_value(property.name())?;
                    let version = if raw.is_null() {
                        Value::Null
                    } else {
                        let number = version_number(&raw).ok_or_else(|| {
                            DatastoreError::conversion(format!(
                                "version of '{}' is not numeric: {}",
                                entity.name(),
                                raw
                            ))
                        })?;
                        json!(number)
                    };
                    backend.set_entry_value(entry, &field, version);
                }
                PropertyKind::Simple => {
                    let raw = access.get_value(property.name())?;
                    let value = match conversion.convert(&raw, property.property_type()) {
                        Ok(value) => value,
                        Err(e) => {
                            warn!(
                                entity = %entity.name(),
                                property = %property.name(),
                                error = %e,
                                "Conversion failed, storing string form"
                            );
                            match raw {
                                Value::String(s) => Value::String(s),
                                other => Value::String(other.to_string()),
                            }
                        }
                    };
                    backend.set_entry_value(entry, &field, value);
                }
                PropertyKind::Embedded { .. } => {
                    let value = match access.get(property.name())? {
                        PropertyValue::One(Some(target)) => self.embed(backend, &target)?,
                        _ => Value::Null,
                    };
                    backend.set_entry_value(entry, &field, value);
                }
                PropertyKind::EmbeddedCollection { .. } => {
                    let values = match access.get(property.name())? {
                        PropertyValue::Many(targets) => targets
                            .iter()
                            .map(|target| self.embed(backend, target))
                            .collect::<Result<Vec<_>>>()?,
                        _ => Vec::new(),
                    };
                    backend.set_entry_value(entry, &field, Value::Array(values));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn embed(&self, backend: &B, target: &ObjectRef) -> Result<Value> {
        let entity = self.entity_of(target)?;
        let access = self.access(&entity, target);
        let mut entry = backend.create_new_entry(&entity);
        self.write_scalars(backend, &entity, &access, &mut entry)?;
        Ok(backend.entry_to_value(entry))
    }

    /// Write reference associations, persisting targets as needed
    fn write_associations(
        &self,
        session: &mut Session<B>,
        access: &EntityAccess,
        key: &B::Key,
        entry: &mut B::Entry,
    ) -> Result<Cascades<B>> {
        let entity = &self.entity;
        let mut cascades = Cascades::new();

        for property in entity.associations() {
            if property.kind().is_to_one() {
                self.write_to_one(session, access, property, entry, &mut cascades)?;
            } else if property.kind().is_to_many() {
                self.write_to_many(session, access, key, property, entry, &mut cascades)?;
            }
        }
        Ok(cascades)
    }

    fn write_to_one(
        &self,
        session: &mut Session<B>,
        access: &EntityAccess,
        property: &PersistentProperty,
        entry: &mut B::Entry,
        cascades: &mut Cascades<B>,
    ) -> Result<()> {
        let field = session.backend().property_key(property);
        let target = match access.get(property.name())? {
            PropertyValue::One(target) => target,
            _ => None,
        };
        let Some(target) = target else {
            if property.is_owning_side() {
                session.backend().set_entry_value(entry, &field, Value::Null);
            }
            return Ok(());
        };

        let target_entity = self.entity_of(&target)?;
        let target_access = self.access(&target_entity, &target);

        if !property.is_owning_side() {
            // The target holds the foreign key back to us
            if let Some(inverse) = property.inverse_side() {
                target_access
                    .set_no_conversion(inverse, PropertyValue::One(Some(Rc::clone(access.object()))))?;
            }
            if !target_entity.is_external() {
                if let Some(target_key) = session.persister(&target_entity).persist(session, &target)? {
                    if let Some(operation) = session.take_pending(target_entity.root_name(), &target_key) {
                        cascades.post.push(operation);
                    }
                }
            }
            return Ok(());
        }

        let target_key = match target_access.identifier()? {
            Some(id) => session.backend().key_from_value(&id)?,
            None if target_entity.is_external() => {
                return Err(DatastoreError::illegal_argument(format!(
                    "{}.{}: external target must be saved by its own datastore first",
                    self.entity.name(),
                    property.name()
                )));
            }
            None => {
                let persister = session.persister(&target_entity);
                match persister.persist(session, &target)? {
                    Some(target_key) => {
                        if let Some(operation) =
                            session.take_pending(target_entity.root_name(), &target_key)
                        {
                            cascades.pre.push(operation);
                        }
                        target_key
                    }
                    None => {
                        session.backend().set_entry_value(entry, &field, Value::Null);
                        return Ok(());
                    }
                }
            }
        };

        let reference = session
            .backend()
            .reference(&target_entity, &target_key, property);
        session.backend().set_entry_value(entry, &field, reference);
        Ok(())
    }

    fn write_to_many(
        &self,
        session: &mut Session<B>,
        access: &EntityAccess,
        key: &B::Key,
        property: &PersistentProperty,
        entry: &mut B::Entry,
        cascades: &mut Cascades<B>,
    ) -> Result<()> {
        let entity = &self.entity;
        let owner = access.object();
        let children = match access.get(property.name())? {
            PropertyValue::Many(children) => children,
            _ => Vec::new(),
        };

        let mut keys: Vec<B::Key> = Vec::with_capacity(children.len());
        for child in &children {
            let child_entity = self.entity_of(child)?;
            let child_access = self.access(&child_entity, child);

            if let Some(inverse) = property.inverse_side() {
                match property.kind() {
                    PropertyKind::OneToMany { .. } => {
                        child_access
                            .set_no_conversion(inverse, PropertyValue::One(Some(Rc::clone(owner))))?;
                    }
                    PropertyKind::ManyToMany { .. } => {
                        let mut owners = match child_access.get(inverse)? {
                            PropertyValue::Many(owners) => owners,
                            _ => Vec::new(),
                        };
                        if !owners.iter().any(|o| Rc::ptr_eq(o, owner)) {
                            owners.push(Rc::clone(owner));
                            child_access.set_no_conversion(inverse, PropertyValue::Many(owners))?;
                        }
                    }
                    _ => {}
                }
            }

            let child_key = if child_entity.is_external() {
                match child_access.identifier()? {
                    Some(id) => session.backend().key_from_value(&id)?,
                    None => continue,
                }
            } else {
                match session.persister(&child_entity).persist(session, child)? {
                    Some(child_key) => child_key,
                    None => continue,
                }
            };
            if let Some(operation) = session.take_pending(child_entity.root_name(), &child_key) {
                cascades.post.push(operation);
            }
            keys.push(child_key);
        }

        if property.kind().collection() == Some(CollectionKind::Set) {
            let mut unique: Vec<B::Key> = Vec::with_capacity(keys.len());
            for key in keys {
                if !unique.contains(&key) {
                    unique.push(key);
                }
            }
            keys = unique;
        }

        let Some(indexer) = session.backend().association_indexer(&self.context, entity, property) else {
            return Ok(());
        };
        if indexer.embeds_keys() {
            indexer.index_entry(session.backend(), entry, &keys);
            return Ok(());
        }

        let root = entity.root_name().to_string();
        if session.association_snapshot(&root, key, property.name()) == Some(&keys) {
            return Ok(());
        }
        let owner_key = key.clone();
        let name = property.name().to_string();
        cascades.post.push(PendingOperation::new(
            OperationKind::Insert,
            Arc::clone(entity),
            Some(key.clone()),
            move |session: &mut Session<B>| {
                indexer.index(session.backend_mut(), &owner_key, &keys)?;
                session.cache_association(&root, owner_key, &name, keys);
                Ok(())
            },
        ));
        Ok(())
    }

    /// Index/deindex operations for indexed properties whose value changed
    fn index_properties(
        &self,
        backend: &B,
        key: &B::Key,
        entry: &B::Entry,
        previous: Option<&B::Entry>,
    ) -> Vec<PendingOperation<B>> {
        let entity = &self.entity;
        let mut operations = Vec::new();

        for property in entity.persistent_properties() {
            if !property.mapping().index {
                continue;
            }
            let Some(indexer) = backend.property_indexer(entity, property) else {
                continue;
            };
            let field = backend.property_key(property);
            let current = backend.entry_value(entry, &field);
            let old = previous.and_then(|p| backend.entry_value(p, &field));
            if current == old {
                continue;
            }

            let key = key.clone();
            operations.push(PendingOperation::new(
                OperationKind::Update,
                Arc::clone(entity),
                None,
                move |session: &mut Session<B>| {
                    if let Some(old) = old {
                        indexer.deindex(session.backend_mut(), &old, &key)?;
                    }
                    if let Some(current) = current {
                        indexer.index(session.backend_mut(), &current, &key)?;
                    }
                    Ok(())
                },
            ));
        }
        operations
    }

    // =========================================================================
    // Flush-Time Execution
    // =========================================================================

    /// Compare the stored version with the in-memory one
    ///
    /// Returns the in-memory version when they agree. Versions compare by
    /// numeric value; a missing record also counts as a conflict.
    pub fn check_version(
        &self,
        session: &mut Session<B>,
        access: &EntityAccess,
        key: &B::Key,
    ) -> Result<i64> {
        let entity = access.entity();
        let Some(version) = entity.version() else {
            return Ok(0);
        };
        let raw = access.get_value(version.name())?;
        let current = if raw.is_null() {
            0
        } else {
            version_number(&raw).ok_or_else(|| {
                DatastoreError::conversion(format!("version is not numeric: {}", raw))
            })?
        };

        let stored = session
            .backend_mut()
            .retrieve_entry(entity, key)?
            .ok_or_else(|| DatastoreError::optimistic_locking(entity.name(), key))?;
        let field = session.backend().property_key(version);
        let stored_version = match session.backend().entry_value(&stored, &field) {
            Some(value) => version_number(&value).ok_or_else(|| {
                DatastoreError::conversion(format!("stored version is not numeric: {}", value))
            })?,
            None => 0,
        };

        if stored_version != current {
            debug!(
                entity = %entity.name(),
                key = %key,
                stored = stored_version,
                current,
                "Version mismatch"
            );
            return Err(DatastoreError::optimistic_locking(entity.name(), key));
        }
        Ok(current)
    }

    /// Run a queued update: check the version, write, then bump it in memory
    pub(crate) fn run_update(
        &self,
        session: &mut Session<B>,
        key: &B::Key,
        mut entry: B::Entry,
        object: &ObjectRef,
    ) -> Result<()> {
        let entity = &self.entity;
        let access = self.access(entity, object);

        match entity.version() {
            Some(version) => {
                let current = self.check_version(session, &access, key)?;
                let next = current + 1;
                let field = session.backend().property_key(version);
                session
                    .backend()
                    .set_entry_value(&mut entry, &field, json!(next));
                let guard = VersionGuard {
                    field,
                    expected: current,
                };
                session
                    .backend_mut()
                    .update_entry(entity, key, entry.clone(), Some(&guard))?;
                access.set_no_conversion(version.name(), json!(next).into())?;
            }
            None => {
                session
                    .backend_mut()
                    .update_entry(entity, key, entry.clone(), None)?;
            }
        }

        session.cache_entry(entity.root_name(), key.clone(), entry);
        Ok(())
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Queue removal of `object` and of its side indexes
    pub fn delete(&self, session: &mut Session<B>, object: &ObjectRef) -> Result<()> {
        let entity = &self.entity;
        let access = self.access(entity, object);
        let Some(id) = access.identifier()? else {
            return Ok(());
        };
        let key = session.backend().key_from_value(&id)?;

        if !self.fire(session, &access, Event::Delete)? {
            debug!(entity = %entity.name(), key = %key, "Delete cancelled by listener");
            return Ok(());
        }

        let root = entity.root_name();
        self.discard_pending(session, root, &key);

        let mut operation = PendingOperation::with_payload(
            OperationKind::Delete,
            Arc::clone(entity),
            Some(key.clone()),
            Payload::Delete,
        );

        for property in entity.associations().filter(|p| p.kind().is_to_many()) {
            let Some(indexer) = session.backend().association_indexer(&self.context, entity, property) else {
                continue;
            };
            if indexer.embeds_keys() {
                continue;
            }
            let owner = key.clone();
            operation.add_cascade_operation(PendingOperation::new(
                OperationKind::Delete,
                Arc::clone(entity),
                None,
                move |session: &mut Session<B>| indexer.delete_index(session.backend_mut(), &owner),
            ));
        }

        let has_indexed = entity.persistent_properties().any(|p| p.mapping().index);
        if has_indexed {
            let stored = match session.snapshot(root, &key).cloned() {
                Some(entry) => Some(entry),
                None => session.backend_mut().retrieve_entry(entity, &key)?,
            };
            if let Some(stored) = stored {
                for property in entity.persistent_properties().filter(|p| p.mapping().index) {
                    let Some(indexer) = session.backend().property_indexer(entity, property) else {
                        continue;
                    };
                    let field = session.backend().property_key(property);
                    let Some(value) = session.backend().entry_value(&stored, &field) else {
                        continue;
                    };
                    let owner = key.clone();
                    operation.add_cascade_operation(PendingOperation::new(
                        OperationKind::Delete,
                        Arc::clone(entity),
                        None,
                        move |session: &mut Session<B>| {
                            indexer.deindex(session.backend_mut(), &value, &owner)
                        },
                    ));
                }
            }
        }

        trace!(entity = %entity.name(), key = %key, "Queued delete");
        session.enqueue(operation);
        Ok(())
    }

    // =========================================================================
    // Load
    // =========================================================================

    /// Load one record, `None` if absent or not an instance of this entity
    pub fn retrieve(&self, session: &mut Session<B>, key: &B::Key) -> Result<Option<ObjectRef>> {
        let root = self.entity.root_name();
        if let Some(object) = session.cached_object(root, key) {
            return Ok(self.is_instance(&object).then_some(object));
        }
        let Some(entry) = session.backend_mut().retrieve_entry(&self.entity, key)? else {
            return Ok(None);
        };
        let concrete = self.discriminate(session.backend(), &entry);
        if !self.context.is_subtype_of(&concrete, self.entity.name()) {
            return Ok(None);
        }
        self.create_object_from_native_entry(session, key, entry).map(Some)
    }

    /// Load several records, preserving the order of `keys`
    pub fn retrieve_all(
        &self,
        session: &mut Session<B>,
        keys: &[B::Key],
    ) -> Result<Vec<Option<ObjectRef>>> {
        let root = self.entity.root_name();
        let mut results: Vec<Option<ObjectRef>> = vec![None; keys.len()];
        let mut missing = Vec::new();

        for (index, key) in keys.iter().enumerate() {
            match session.cached_object(root, key) {
                Some(object) => {
                    if self.is_instance(&object) {
                        results[index] = Some(object);
                    }
                }
                None => missing.push(index),
            }
        }
        if missing.is_empty() {
            return Ok(results);
        }

        let wanted: Vec<B::Key> = missing.iter().map(|&i| keys[i].clone()).collect();
        let entries = session.backend_mut().retrieve_entries(&self.entity, &wanted)?;
        for (index, entry) in missing.into_iter().zip(entries) {
            let Some(entry) = entry else {
                continue;
            };
            let concrete = self.discriminate(session.backend(), &entry);
            if self.context.is_subtype_of(&concrete, self.entity.name()) {
                results[index] = Some(self.create_object_from_native_entry(session, &keys[index], entry)?);
            }
        }
        Ok(results)
    }

    fn is_instance(&self, object: &ObjectRef) -> bool {
        self.context
            .entity_for_object(object)
            .is_some_and(|e| self.context.is_subtype_of(&e, self.entity.name()))
    }

    /// Concrete entity of a stored entry
    ///
    /// Unknown discriminators fall back to the requested entity.
    pub fn discriminate(&self, backend: &B, entry: &B::Entry) -> Arc<PersistentEntity> {
        match backend.discriminator(entry) {
            None => self
                .context
                .persistent_entity(self.entity.root_name())
                .unwrap_or_else(|| Arc::clone(&self.entity)),
            Some(value) if value == self.entity.discriminator() => Arc::clone(&self.entity),
            Some(value) => self
                .context
                .child_entity_by_discriminator(self.entity.root_name(), &value)
                .unwrap_or_else(|| {
                    debug!(
                        entity = %self.entity.name(),
                        discriminator = %value,
                        "Unknown discriminator, using requested entity"
                    );
                    Arc::clone(&self.entity)
                }),
        }
    }

    /// Instantiate and populate a domain object from a stored entry
    ///
    /// The instance is cached before its associations are resolved, so
    /// cyclic graphs load without recursion.
    pub fn create_object_from_native_entry(
        &self,
        session: &mut Session<B>,
        key: &B::Key,
        entry: B::Entry,
    ) -> Result<ObjectRef> {
        let entity = self.discriminate(session.backend(), &entry);
        let root = entity.root_name().to_string();
        if let Some(object) = session.cached_object(&root, key) {
            return Ok(object);
        }

        let object = entity.new_instance()?;
        let access = self.access(&entity, &object);
        access.set_identifier(session.backend().key_to_value(key))?;

        session.cache_object(&root, key.clone(), Rc::clone(&object));
        session.cache_entry(&root, key.clone(), entry.clone());

        let populated = self
            .populate_scalars(session.backend(), &access, &entry)
            .and_then(|()| self.populate_associations(session, &access, key, &entry));
        if let Err(e) = populated {
            session.evict(&root, key);
            return Err(e);
        }

        for listener in session.listeners() {
            listener.after_load(&access)?;
        }
        trace!(entity = %entity.name(), key = %key, "Loaded object");
        Ok(object)
    }

    /// Reload an instance from its stored entry
    pub fn refresh(&self, session: &mut Session<B>, object: &ObjectRef) -> Result<()> {
        let entity = self.entity_of(object)?;
        let access = self.access(&entity, object);
        let id = access.identifier()?.ok_or_else(|| {
            DatastoreError::illegal_argument("cannot refresh an object without identifier")
        })?;
        let key = session.backend().key_from_value(&id)?;
        let entry = session
            .backend_mut()
            .retrieve_entry(&entity, &key)?
            .ok_or_else(|| {
                DatastoreError::illegal_argument(format!(
                    "{} with key {} no longer exists",
                    entity.name(),
                    key
                ))
            })?;

        session.cache_entry(entity.root_name(), key.clone(), entry.clone());
        self.populate_scalars(session.backend(), &access, &entry)?;
        self.populate_associations(session, &access, &key, &entry)
    }

    fn populate_scalars(&self, backend: &B, access: &EntityAccess, entry: &B::Entry) -> Result<()> {
        let entity = access.entity();

        for property in entity.properties() {
            let field = backend.property_key(property);
            match property.kind() {
                PropertyKind::Version => {
                    let value = backend.entry_value(entry, &field).unwrap_or(json!(0));
                    access.set(property.name(), value.into())?;
                }
                PropertyKind::Simple => {
                    let value = backend.entry_value(entry, &field).unwrap_or(Value::Null);
                    if let Err(e) = access.set(property.name(), value.into()) {
                        warn!(
                            entity = %entity.name(),
                            property = %property.name(),
                            error = %e,
                            "Skipping unreadable stored value"
                        );
                    }
                }
                PropertyKind::Embedded { .. } => {
                    let target = match backend.entry_value(entry, &field) {
                        Some(value) if !value.is_null() => Some(self.unembed(backend, property, value)?),
                        _ => None,
                    };
                    access.set_no_conversion(property.name(), PropertyValue::One(target))?;
                }
                PropertyKind::EmbeddedCollection { .. } => {
                    let values = match backend.entry_value(entry, &field) {
                        Some(Value::Array(values)) => values,
                        _ => Vec::new(),
                    };
                    let targets = values
                        .into_iter()
                        .map(|value| self.unembed(backend, property, value))
                        .collect::<Result<Vec<_>>>()?;
                    access.set_no_conversion(property.name(), PropertyValue::Many(targets))?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn unembed(&self, backend: &B, property: &PersistentProperty, value: Value) -> Result<ObjectRef> {
        let declared = self.target_of(property)?;
        let entry = backend.entry_from_value(value)?;
        let entity = match backend.discriminator(&entry) {
            Some(d) if d != declared.discriminator() => self
                .context
                .child_entity_by_discriminator(declared.root_name(), &d)
                .unwrap_or(declared),
            _ => declared,
        };
        let object = entity.new_instance()?;
        let access = self.access(&entity, &object);
        self.populate_scalars(backend, &access, &entry)?;
        Ok(object)
    }

    fn populate_associations(
        &self,
        session: &mut Session<B>,
        access: &EntityAccess,
        key: &B::Key,
        entry: &B::Entry,
    ) -> Result<()> {
        let entity = Arc::clone(access.entity());

        for property in entity.associations() {
            let kind = property.kind();
            if kind.is_to_one() {
                let target = self.load_to_one(session, &entity, property, key, entry)?;
                access.set_no_conversion(property.name(), PropertyValue::One(target))?;
            } else if kind.is_to_many() {
                let Some(indexer) = session.backend().association_indexer(&self.context, &entity, property) else {
                    continue;
                };
                let keys = indexer.query(session.backend_mut(), key, entry)?;
                session.cache_association(entity.root_name(), key.clone(), property.name(), keys.clone());

                let target = self.target_of(property)?;
                let targets = if target.is_external() {
                    Vec::new()
                } else {
                    session
                        .persister(&target)
                        .retrieve_all(session, &keys)?
                        .into_iter()
                        .flatten()
                        .collect()
                };
                access.set_no_conversion(property.name(), PropertyValue::Many(targets))?;
            }
        }
        Ok(())
    }

    fn load_to_one(
        &self,
        session: &mut Session<B>,
        entity: &PersistentEntity,
        property: &PersistentProperty,
        key: &B::Key,
        entry: &B::Entry,
    ) -> Result<Option<ObjectRef>> {
        let target = self.target_of(property)?;
        if target.is_external() {
            debug!(
                entity = %entity.name(),
                property = %property.name(),
                "Not resolving reference to external entity"
            );
            return Ok(None);
        }

        if !property.is_owning_side() {
            let Some(inverse) = property.inverse_side() else {
                return Ok(None);
            };
            let criteria = Junction::conjunction()
                .add(restrictions::eq(inverse, session.backend().key_to_value(key)));
            let query = session
                .backend()
                .compile_query(&self.context, &target, &criteria, &[])?;
            let rows = session.backend_mut().execute_query(&target, &query, 0, Some(1))?;
            return match rows.into_iter().next() {
                Some((target_key, target_entry)) => session
                    .persister(&target)
                    .create_object_from_native_entry(session, &target_key, target_entry)
                    .map(Some),
                None => Ok(None),
            };
        }

        let field = session.backend().property_key(property);
        let Some(raw) = session.backend().entry_value(entry, &field) else {
            return Ok(None);
        };
        let Some(target_key) = session.backend().dereference(&raw) else {
            warn!(
                entity = %entity.name(),
                property = %property.name(),
                value = %raw,
                "Unreadable reference"
            );
            return Ok(None);
        };
        session.persister(&target).retrieve(session, &target_key)
    }
}

impl<B: NativeBackend> std::fmt::Debug for NativeEntryPersister<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeEntryPersister")
            .field("entity", &self.entity.name())
            .finish()
    }
}
