//! Registry of persistent entities
//!
//! One `MappingContext` exists per configured datastore. Registration takes a
//! write lock; lookups only read. Listeners are notified after the lock is
//! released so they may register further entities themselves.

use std::any::TypeId;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::{EntityBuilder, ObjectRef, PersistentEntity, PersistentProperty};
use crate::access::EntityAccess;
use crate::conversion::{ConversionService, DefaultConversionService};
use crate::error::{DatastoreError, Result};

/// Notified once for every entity added to a context
pub trait MappingContextListener: Send + Sync {
    fn persistent_entity_added(&self, entity: &Arc<PersistentEntity>);
}

/// Per-entity validation hook run before insert and update
pub trait EntityValidator: Send + Sync {
    /// Return the list of violations, if any
    fn validate(&self, access: &EntityAccess) -> std::result::Result<(), Vec<String>>;
}

#[derive(Default)]
struct Registry {
    by_name: HashMap<String, Arc<PersistentEntity>>,
    by_type: HashMap<TypeId, String>,
    order: Vec<String>,
}

/// Process-wide description of every persistable type
pub struct MappingContext {
    registry: RwLock<Registry>,
    listeners: RwLock<Vec<Arc<dyn MappingContextListener>>>,
    validators: RwLock<HashMap<String, Arc<dyn EntityValidator>>>,
    conversion: Arc<dyn ConversionService>,
}

impl Default for MappingContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MappingContext {
    pub fn new() -> Self {
        Self::with_conversion_service(Arc::new(DefaultConversionService))
    }

    pub fn with_conversion_service(conversion: Arc<dyn ConversionService>) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            listeners: RwLock::new(Vec::new()),
            validators: RwLock::new(HashMap::new()),
            conversion,
        }
    }

    pub fn conversion_service(&self) -> Arc<dyn ConversionService> {
        Arc::clone(&self.conversion)
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Build and register a mapping
    pub fn add<T: 'static>(&self, builder: EntityBuilder<T>) -> Result<Arc<PersistentEntity>> {
        self.add_persistent_entity(builder.build()?)
    }

    /// Register an entity, resolving its parent linkage
    ///
    /// Registering a type that is already known returns the existing entity.
    pub fn add_persistent_entity(&self, mut entity: PersistentEntity) -> Result<Arc<PersistentEntity>> {
        let added = {
            let mut registry = self.registry.write();

            if let Some(existing) = registry.by_name.get(&entity.name) {
                if existing.type_id == entity.type_id {
                    return Ok(Arc::clone(existing));
                }
                return Err(DatastoreError::mapping(format!(
                    "entity name '{}' is already registered for {}",
                    entity.name, existing.type_name
                )));
            }
            if let Some(name) = registry.by_type.get(&entity.type_id) {
                return Err(DatastoreError::mapping(format!(
                    "{} is already registered as '{}'",
                    entity.type_name, name
                )));
            }

            if let Some(parent_name) = entity.parent.clone() {
                let parent = registry.by_name.get(&parent_name).ok_or_else(|| {
                    DatastoreError::mapping(format!(
                        "parent entity '{}' of '{}' must be registered first",
                        parent_name, entity.name
                    ))
                })?;
                if parent.embedded != entity.embedded {
                    return Err(DatastoreError::mapping(format!(
                        "'{}' and its parent '{}' disagree on being embedded",
                        entity.name, parent_name
                    )));
                }
                entity.root = parent.root.clone();
                if entity.mapping.family.is_none() {
                    entity.mapping.family = parent.mapping.family.clone();
                }
                if entity.mapping.sort.is_none() {
                    entity.mapping.sort = parent.mapping.sort.clone();
                }
                if entity.mapping.identity_generator == Default::default() {
                    entity.mapping.identity_generator = parent.mapping.identity_generator;
                }
            }

            let clash = registry.by_name.values().find(|other| {
                other.root == entity.root && other.discriminator == entity.discriminator
            });
            if let Some(other) = clash {
                return Err(DatastoreError::mapping(format!(
                    "discriminator '{}' of '{}' is already used by '{}'",
                    entity.discriminator, entity.name, other.name
                )));
            }

            let entity = Arc::new(entity);
            registry.by_type.insert(entity.type_id, entity.name.clone());
            registry.order.push(entity.name.clone());
            registry
                .by_name
                .insert(entity.name.clone(), Arc::clone(&entity));
            entity
        };

        debug!(
            entity = %added.name,
            root = %added.root,
            properties = added.properties.len(),
            "Registered persistent entity"
        );

        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();
        for listener in listeners {
            listener.persistent_entity_added(&added);
        }
        Ok(added)
    }

    /// Add a listener; it is immediately told about entities registered so far
    pub fn add_listener(&self, listener: Arc<dyn MappingContextListener>) {
        self.listeners.write().push(Arc::clone(&listener));
        for entity in self.persistent_entities() {
            listener.persistent_entity_added(&entity);
        }
    }

    pub fn add_entity_validator(&self, entity: &str, validator: Arc<dyn EntityValidator>) {
        self.validators.write().insert(entity.to_string(), validator);
    }

    pub fn entity_validator(&self, entity: &str) -> Option<Arc<dyn EntityValidator>> {
        self.validators.read().get(entity).cloned()
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub fn persistent_entity(&self, name: &str) -> Option<Arc<PersistentEntity>> {
        self.registry.read().by_name.get(name).cloned()
    }

    /// Entity registered for the domain type `T`
    pub fn persistent_entity_for<T: 'static>(&self) -> Option<Arc<PersistentEntity>> {
        self.entity_for_type(TypeId::of::<std::cell::RefCell<T>>())
    }

    pub fn entity_for_object(&self, object: &ObjectRef) -> Option<Arc<PersistentEntity>> {
        self.entity_for_type((**object).type_id())
    }

    fn entity_for_type(&self, type_id: TypeId) -> Option<Arc<PersistentEntity>> {
        let registry = self.registry.read();
        let name = registry.by_type.get(&type_id)?;
        registry.by_name.get(name).cloned()
    }

    /// All entities in registration order
    pub fn persistent_entities(&self) -> Vec<Arc<PersistentEntity>> {
        let registry = self.registry.read();
        registry
            .order
            .iter()
            .filter_map(|name| registry.by_name.get(name).cloned())
            .collect()
    }

    /// Direct children of an entity
    pub fn child_entities(&self, parent: &str) -> Vec<Arc<PersistentEntity>> {
        self.persistent_entities()
            .into_iter()
            .filter(|e| e.parent.as_deref() == Some(parent))
            .collect()
    }

    /// All entities inheriting from `ancestor`, nearest first
    pub fn descendants(&self, ancestor: &str) -> Vec<Arc<PersistentEntity>> {
        let mut found = self.child_entities(ancestor);
        let mut next = 0;
        while next < found.len() {
            let children = self.child_entities(found[next].name());
            found.extend(children);
            next += 1;
        }
        found
    }

    /// Property `name` of `entity`, or of the nearest subtype declaring it
    ///
    /// Queries against a root entity may filter, sort and project on
    /// subtype-only properties.
    pub fn hierarchy_property<'e>(
        &self,
        entity: &'e PersistentEntity,
        name: &str,
    ) -> Result<Cow<'e, PersistentProperty>> {
        if let Some(property) = entity.property(name) {
            return Ok(Cow::Borrowed(property));
        }
        self.descendants(entity.name())
            .iter()
            .find_map(|child| child.property(name).cloned())
            .map(Cow::Owned)
            .ok_or_else(|| {
                DatastoreError::illegal_argument(format!("{} has no property '{}'", entity.name(), name))
            })
    }

    /// Whether `entity` is `ancestor` or inherits from it
    pub fn is_subtype_of(&self, entity: &PersistentEntity, ancestor: &str) -> bool {
        let mut current = Some(entity.name.clone());
        while let Some(name) = current {
            if name == ancestor {
                return true;
            }
            current = self
                .persistent_entity(&name)
                .and_then(|e| e.parent.clone());
        }
        false
    }

    /// Entity in the hierarchy of `root` stored with `discriminator`
    pub fn child_entity_by_discriminator(
        &self,
        root: &str,
        discriminator: &str,
    ) -> Option<Arc<PersistentEntity>> {
        self.registry
            .read()
            .by_name
            .values()
            .find(|e| e.root == root && e.discriminator == discriminator)
            .cloned()
    }

    /// Check that association targets and inverse sides are registered
    pub fn verify_associations(&self) -> Result<()> {
        for entity in self.persistent_entities() {
            for property in entity.associations() {
                let Some(target_name) = property.target_entity() else {
                    continue;
                };
                let target = self.persistent_entity(target_name).ok_or_else(|| {
                    DatastoreError::mapping(format!(
                        "{}.{} targets unregistered entity '{}'",
                        entity.name, property.name, target_name
                    ))
                })?;
                if property.kind.is_embedded() != target.embedded {
                    return Err(DatastoreError::mapping(format!(
                        "{}.{}: target '{}' {} embeddable",
                        entity.name,
                        property.name,
                        target_name,
                        if target.embedded { "is" } else { "is not" }
                    )));
                }
                if let Some(inverse) = property.inverse_side() {
                    if target.property(inverse).is_none() {
                        return Err(DatastoreError::mapping(format!(
                            "{}.{}: inverse property '{}' not found on '{}'",
                            entity.name, property.name, inverse, target_name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for MappingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingContext")
            .field("entities", &self.registry.read().order)
            .field("conversion", &self.conversion)
            .finish()
    }
}
