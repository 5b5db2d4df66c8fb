//! Deferred writes queued by a session

use std::fmt;
use std::sync::Arc;

use crate::engine::NativeBackend;
use crate::error::Result;
use crate::model::{ObjectRef, PersistentEntity};

use super::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

/// Boxed action run against the session at flush time
pub type Action<B> = Box<dyn FnOnce(&mut Session<B>) -> Result<()>>;

pub(crate) enum Payload<B: NativeBackend> {
    /// New record; consecutive stores of one entity are batched
    Store { entry: B::Entry },
    /// Version-checked replacement of an existing record
    Update { entry: B::Entry, object: ObjectRef },
    Delete,
    Run(Action<B>),
}

/// One deferred write with the operations that must run around it
///
/// Pre-operations complete before the operation runs. Cascade operations run
/// after every primary operation of the flush batch has run.
pub struct PendingOperation<B: NativeBackend> {
    pub(crate) kind: OperationKind,
    pub(crate) entity: Arc<PersistentEntity>,
    pub(crate) key: Option<B::Key>,
    pub(crate) payload: Payload<B>,
    pub(crate) pre_operations: Vec<PendingOperation<B>>,
    pub(crate) cascade_operations: Vec<PendingOperation<B>>,
}

impl<B: NativeBackend> PendingOperation<B> {
    /// Operation running a custom action
    pub fn new(
        kind: OperationKind,
        entity: Arc<PersistentEntity>,
        key: Option<B::Key>,
        action: impl FnOnce(&mut Session<B>) -> Result<()> + 'static,
    ) -> Self {
        Self::with_payload(kind, entity, key, Payload::Run(Box::new(action)))
    }

    pub(crate) fn with_payload(
        kind: OperationKind,
        entity: Arc<PersistentEntity>,
        key: Option<B::Key>,
        payload: Payload<B>,
    ) -> Self {
        Self {
            kind,
            entity,
            key,
            payload,
            pre_operations: Vec::new(),
            cascade_operations: Vec::new(),
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn entity(&self) -> &Arc<PersistentEntity> {
        &self.entity
    }

    pub fn key(&self) -> Option<&B::Key> {
        self.key.as_ref()
    }

    pub fn pre_operations(&self) -> &[PendingOperation<B>] {
        &self.pre_operations
    }

    pub fn cascade_operations(&self) -> &[PendingOperation<B>] {
        &self.cascade_operations
    }

    pub fn add_pre_operation(&mut self, operation: PendingOperation<B>) {
        self.pre_operations.push(operation);
    }

    pub fn add_cascade_operation(&mut self, operation: PendingOperation<B>) {
        self.cascade_operations.push(operation);
    }

    pub(crate) fn take_pre_operations(&mut self) -> Vec<PendingOperation<B>> {
        std::mem::take(&mut self.pre_operations)
    }

    pub(crate) fn take_cascade_operations(&mut self) -> Vec<PendingOperation<B>> {
        std::mem::take(&mut self.cascade_operations)
    }

    /// Custom action rather than a record write
    pub(crate) fn is_action(&self) -> bool {
        matches!(self.payload, Payload::Run(_))
    }

    /// Whether this is the record write for `key` in the hierarchy of `root`
    pub(crate) fn targets(&self, root: &str, key: &B::Key) -> bool {
        !self.is_action() && self.entity.root_name() == root && self.key.as_ref() == Some(key)
    }

    /// Whether this operation, or one nested under it, is the write for `key`
    pub(crate) fn carries(&self, root: &str, key: &B::Key) -> bool {
        self.targets(root, key)
            || self
                .pre_operations
                .iter()
                .chain(&self.cascade_operations)
                .any(|op| op.carries(root, key))
    }

    /// Detach the nested record write for `key`
    fn take_nested(&mut self, root: &str, key: &B::Key) -> Option<PendingOperation<B>> {
        for operations in [&mut self.pre_operations, &mut self.cascade_operations] {
            if let Some(index) = operations.iter().position(|op| op.targets(root, key)) {
                return Some(operations.remove(index));
            }
            if let Some(found) = operations.iter_mut().find_map(|op| op.take_nested(root, key)) {
                return Some(found);
            }
        }
        None
    }
}

impl<B: NativeBackend> fmt::Debug for PendingOperation<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let payload = match &self.payload {
            Payload::Store { .. } => "store",
            Payload::Update { .. } => "update",
            Payload::Delete => "delete",
            Payload::Run(_) => "action",
        };
        f.debug_struct("PendingOperation")
            .field("kind", &self.kind)
            .field("entity", &self.entity.name())
            .field("key", &self.key)
            .field("payload", &payload)
            .field("pre_operations", &self.pre_operations.len())
            .field("cascade_operations", &self.cascade_operations.len())
            .finish()
    }
}

/// Pending operations grouped by entity, groups in first-seen order
pub(crate) struct OperationQueue<B: NativeBackend> {
    groups: Vec<(String, Vec<PendingOperation<B>>)>,
}

impl<B: NativeBackend> Default for OperationQueue<B> {
    fn default() -> Self {
        Self { groups: Vec::new() }
    }
}

impl<B: NativeBackend> OperationQueue<B> {
    pub(crate) fn push(&mut self, operation: PendingOperation<B>) {
        let name = operation.entity().name();
        match self.groups.iter_mut().find(|(entity, _)| entity == name) {
            Some((_, operations)) => operations.push(operation),
            None => self.groups.push((name.to_string(), vec![operation])),
        }
    }

    /// Remove and return the queued operation for a record
    ///
    /// Writes nested under another queued operation are found too; a
    /// requeued flush keeps child writes under their parent.
    pub(crate) fn take(&mut self, root: &str, key: &B::Key) -> Option<PendingOperation<B>> {
        for (_, operations) in &mut self.groups {
            if let Some(index) = operations.iter().position(|op| op.targets(root, key)) {
                return Some(operations.remove(index));
            }
        }
        self.groups
            .iter_mut()
            .flat_map(|(_, operations)| operations.iter_mut())
            .find_map(|op| op.take_nested(root, key))
    }

    pub(crate) fn contains(&self, root: &str, key: &B::Key) -> bool {
        self.groups
            .iter()
            .any(|(_, operations)| operations.iter().any(|op| op.carries(root, key)))
    }

    pub(crate) fn len(&self) -> usize {
        self.groups.iter().map(|(_, operations)| operations.len()).sum()
    }

    /// Remove the first non-empty group
    pub(crate) fn pop_group(&mut self) -> Option<(String, Vec<PendingOperation<B>>)> {
        self.groups.retain(|(_, operations)| !operations.is_empty());
        if self.groups.is_empty() {
            return None;
        }
        Some(self.groups.remove(0))
    }

    /// Put operations back ahead of everything still queued
    pub(crate) fn restore(&mut self, operations: Vec<PendingOperation<B>>) {
        if operations.is_empty() {
            return;
        }
        let queued = std::mem::take(&mut self.groups);
        for operation in operations {
            self.push(operation);
        }
        for operation in queued.into_iter().flat_map(|(_, operations)| operations) {
            self.push(operation);
        }
    }
}
