//! Entity metadata model
//!
//! A [`PersistentEntity`] describes one persistable type: its identity,
//! optional version, scalar properties and associations, together with the
//! field-accessor table used to read and write live instances. Entities are
//! declared with an [`EntityBuilder`] and registered with a [`MappingContext`].

pub mod builder;
pub mod context;

use std::any::{Any, TypeId};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{DatastoreError, Result};
use crate::query::Order;
use crate::types::PropertyType;

pub use builder::{EntityBuilder, object};
pub use context::{EntityValidator, MappingContext, MappingContextListener};

/// A live domain object: an `Rc<RefCell<T>>` for some registered `T`
pub type ObjectRef = Rc<dyn Any>;

/// Address of the instance behind an [`ObjectRef`], stable for its lifetime
pub(crate) fn object_address(object: &ObjectRef) -> usize {
    Rc::as_ptr(object).cast::<()>() as usize
}

/// Value of a property as seen through the accessor table
#[derive(Clone)]
pub enum PropertyValue {
    /// Scalar or JSON value of a simple property, identity or version
    Scalar(Value),
    /// Target of a to-one association or embedded value
    One(Option<ObjectRef>),
    /// Targets of a to-many association or embedded collection
    Many(Vec<ObjectRef>),
}

impl PropertyValue {
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            PropertyValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_scalar(self) -> Option<Value> {
        match self {
            PropertyValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            PropertyValue::Scalar(v) => v.is_null(),
            PropertyValue::One(o) => o.is_none(),
            PropertyValue::Many(_) => false,
        }
    }
}

impl From<Value> for PropertyValue {
    fn from(value: Value) -> Self {
        PropertyValue::Scalar(value)
    }
}

impl fmt::Debug for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Scalar(v) => f.debug_tuple("Scalar").field(v).finish(),
            PropertyValue::One(o) => f
                .debug_tuple("One")
                .field(&o.as_ref().map(|_| "<object>"))
                .finish(),
            PropertyValue::Many(m) => f.debug_tuple("Many").field(&m.len()).finish(),
        }
    }
}

// ============================================================================
// Properties
// ============================================================================

/// Ordering semantics of a collection association
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectionKind {
    /// Ordered, duplicates preserved
    #[default]
    List,
    /// Unordered, duplicate targets collapse
    Set,
}

/// What a property is, including the association target where relevant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    Identity,
    Version,
    Simple,
    /// Value object inlined into the owner's native entry
    Embedded { target: String },
    /// Collection of value objects inlined into the owner's native entry
    EmbeddedCollection {
        target: String,
        collection: CollectionKind,
    },
    OneToOne { target: String },
    ManyToOne { target: String },
    OneToMany {
        target: String,
        collection: CollectionKind,
    },
    ManyToMany {
        target: String,
        collection: CollectionKind,
    },
}

impl PropertyKind {
    pub fn target(&self) -> Option<&str> {
        match self {
            PropertyKind::Embedded { target }
            | PropertyKind::EmbeddedCollection { target, .. }
            | PropertyKind::OneToOne { target }
            | PropertyKind::ManyToOne { target }
            | PropertyKind::OneToMany { target, .. }
            | PropertyKind::ManyToMany { target, .. } => Some(target),
            _ => None,
        }
    }

    pub fn is_association(&self) -> bool {
        self.target().is_some()
    }

    pub fn is_embedded(&self) -> bool {
        matches!(
            self,
            PropertyKind::Embedded { .. } | PropertyKind::EmbeddedCollection { .. }
        )
    }

    /// To-one reference association (not embedded)
    pub fn is_to_one(&self) -> bool {
        matches!(
            self,
            PropertyKind::OneToOne { .. } | PropertyKind::ManyToOne { .. }
        )
    }

    /// To-many reference association (not embedded)
    pub fn is_to_many(&self) -> bool {
        matches!(
            self,
            PropertyKind::OneToMany { .. } | PropertyKind::ManyToMany { .. }
        )
    }

    pub fn collection(&self) -> Option<CollectionKind> {
        match self {
            PropertyKind::EmbeddedCollection { collection, .. }
            | PropertyKind::OneToMany { collection, .. }
            | PropertyKind::ManyToMany { collection, .. } => Some(*collection),
            _ => None,
        }
    }
}

/// Backend-facing overrides for a property
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyMapping {
    /// Explicit native field name
    pub field: Option<String>,
    /// Store to-one targets as references (`true`) or as raw keys
    pub reference: bool,
    /// Maintain a secondary index on this property where the backend needs one
    pub index: bool,
}

impl Default for PropertyMapping {
    fn default() -> Self {
        Self {
            field: None,
            reference: true,
            index: false,
        }
    }
}

type Getter = Arc<dyn Fn(&dyn Any) -> Result<PropertyValue> + Send + Sync>;
type Setter = Arc<dyn Fn(&dyn Any, PropertyValue) -> Result<()> + Send + Sync>;

/// Erased get/set pair for one property, built once at registration
#[derive(Clone)]
pub(crate) struct PropertyAccessor {
    pub(crate) get: Getter,
    pub(crate) set: Setter,
}

/// One persistent property of an entity
#[derive(Clone)]
pub struct PersistentProperty {
    pub(crate) name: String,
    pub(crate) kind: PropertyKind,
    pub(crate) property_type: PropertyType,
    pub(crate) nullable: bool,
    pub(crate) owner: String,
    pub(crate) mapping: PropertyMapping,
    pub(crate) inverse: Option<String>,
    pub(crate) owning_side: bool,
    pub(crate) accessor: PropertyAccessor,
}

impl PersistentProperty {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &PropertyKind {
        &self.kind
    }

    /// Declared scalar type (`Json` for associations)
    pub fn property_type(&self) -> &PropertyType {
        &self.property_type
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// Name of the entity that declared this property
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn mapping(&self) -> &PropertyMapping {
        &self.mapping
    }

    pub fn is_bidirectional(&self) -> bool {
        self.inverse.is_some()
    }

    /// Name of the property on the target that points back here
    pub fn inverse_side(&self) -> Option<&str> {
        self.inverse.as_deref()
    }

    pub fn is_owning_side(&self) -> bool {
        self.owning_side
    }

    pub fn target_entity(&self) -> Option<&str> {
        self.kind.target()
    }

    pub(crate) fn read(&self, object: &dyn Any) -> Result<PropertyValue> {
        (self.accessor.get)(object)
    }

    pub(crate) fn write(&self, object: &dyn Any, value: PropertyValue) -> Result<()> {
        (self.accessor.set)(object, value)
    }
}

impl fmt::Debug for PersistentProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentProperty")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("property_type", &self.property_type)
            .field("nullable", &self.nullable)
            .field("owner", &self.owner)
            .field("mapping", &self.mapping)
            .field("inverse", &self.inverse)
            .finish()
    }
}

// ============================================================================
// Entities
// ============================================================================

/// How identifiers are produced for new instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentityGenerator {
    /// Let the backend choose from the identity type
    #[default]
    Auto,
    /// Monotonic counter per storage family, optimistic retry
    Increment,
    /// The backend's own identifier facility
    Native,
    /// Supplied by the caller before persist
    Assigned,
}

/// Entity-level mapping options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityMapping {
    /// Storage family (collection, key prefix); defaults per backend
    pub family: Option<String>,
    /// Sort applied when a query specifies none
    pub sort: Option<Order>,
    pub identity_generator: IdentityGenerator,
}

type Factory = Arc<dyn Fn() -> ObjectRef + Send + Sync>;

/// Describes one persistable type
#[derive(Clone)]
pub struct PersistentEntity {
    pub(crate) name: String,
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) properties: Vec<PersistentProperty>,
    pub(crate) parent: Option<String>,
    pub(crate) root: String,
    pub(crate) discriminator: String,
    pub(crate) external: bool,
    pub(crate) embedded: bool,
    pub(crate) mapping: EntityMapping,
    pub(crate) factory: Option<Factory>,
}

impl PersistentEntity {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type handle of the `RefCell<T>` behind instances of this entity
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn parent_name(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// Name of the topmost persistent ancestor (self for roots)
    pub fn root_name(&self) -> &str {
        &self.root
    }

    pub fn discriminator(&self) -> &str {
        &self.discriminator
    }

    /// Managed by another datastore; only referenced by key
    pub fn is_external(&self) -> bool {
        self.external
    }

    /// Value type inlined into owners, without identity of its own
    pub fn is_embedded(&self) -> bool {
        self.embedded
    }

    pub fn mapping(&self) -> &EntityMapping {
        &self.mapping
    }

    /// All properties in declaration order
    pub fn properties(&self) -> &[PersistentProperty] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&PersistentProperty> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn identity(&self) -> Option<&PersistentProperty> {
        self.properties
            .iter()
            .find(|p| p.kind == PropertyKind::Identity)
    }

    pub fn version(&self) -> Option<&PersistentProperty> {
        self.properties
            .iter()
            .find(|p| p.kind == PropertyKind::Version)
    }

    pub fn is_versioned(&self) -> bool {
        self.version().is_some()
    }

    /// Every property except identity and version
    pub fn persistent_properties(&self) -> impl Iterator<Item = &PersistentProperty> {
        self.properties
            .iter()
            .filter(|p| !matches!(p.kind, PropertyKind::Identity | PropertyKind::Version))
    }

    pub fn associations(&self) -> impl Iterator<Item = &PersistentProperty> {
        self.properties.iter().filter(|p| p.kind.is_association())
    }

    /// Whether `object` is an instance of exactly this entity's type
    pub fn is_instance(&self, object: &ObjectRef) -> bool {
        (**object).type_id() == self.type_id
    }

    /// Instantiate an empty domain object
    pub fn new_instance(&self) -> Result<ObjectRef> {
        match &self.factory {
            Some(factory) => Ok(factory()),
            None => Err(DatastoreError::entity_creation(format!(
                "entity '{}' ({}) has no factory",
                self.name, self.type_name
            ))),
        }
    }
}

impl fmt::Debug for PersistentEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentEntity")
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .field("properties", &self.properties)
            .field("parent", &self.parent)
            .field("root", &self.root)
            .field("discriminator", &self.discriminator)
            .field("external", &self.external)
            .field("embedded", &self.embedded)
            .field("mapping", &self.mapping)
            .finish()
    }
}
