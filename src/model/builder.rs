//! Declarative entity mapping
//!
//! An [`EntityBuilder`] plays the role of a mapping configuration strategy:
//! it collects typed get/set closures for each property of `T` and erases them
//! into the field-accessor table of a [`PersistentEntity`].
//!
//! ```
//! use runtara_datastore::model::EntityBuilder;
//! use runtara_datastore::types::PropertyType;
//!
//! #[derive(Debug, Default)]
//! struct Person {
//!     id: Option<i64>,
//!     name: String,
//! }
//!
//! let entity = EntityBuilder::<Person>::new()
//!     .identity("id", PropertyType::Integer, |p| p.id, |p, v| p.id = v)
//!     .property("name", PropertyType::String, |p| p.name.clone(), |p, v| p.name = v)
//!     .not_null()
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(entity.name(), "Person");
//! assert_eq!(entity.identity().unwrap().name(), "id");
//! ```

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{
    CollectionKind, EntityMapping, IdentityGenerator, ObjectRef, PersistentEntity,
    PersistentProperty, PropertyAccessor, PropertyKind, PropertyMapping, PropertyValue,
};
use crate::error::{DatastoreError, Result};
use crate::query::Order;
use crate::types::PropertyType;

/// Wrap a value as a shareable domain object
pub fn object<T: 'static>(value: T) -> Rc<RefCell<T>> {
    Rc::new(RefCell::new(value))
}

/// Recover the typed handle behind an [`ObjectRef`]
pub fn downcast<T: 'static>(object: ObjectRef) -> Result<Rc<RefCell<T>>> {
    object.downcast::<RefCell<T>>().map_err(|_| {
        DatastoreError::illegal_argument(format!(
            "object is not an instance of {}",
            std::any::type_name::<T>()
        ))
    })
}

/// Last path segment of a type name, without generic arguments
pub(crate) fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

type TypedGetter<T> = Arc<dyn Fn(&T) -> Result<PropertyValue> + Send + Sync>;
type TypedSetter<T> = Arc<dyn Fn(&mut T, PropertyValue) -> Result<()> + Send + Sync>;

struct TypedProperty<T> {
    name: String,
    kind: PropertyKind,
    property_type: PropertyType,
    nullable: bool,
    owner: String,
    mapping: PropertyMapping,
    inverse: Option<String>,
    owning_side: bool,
    get: TypedGetter<T>,
    set: TypedSetter<T>,
}

/// Builder collecting the mapping of one domain type
pub struct EntityBuilder<T> {
    name: String,
    properties: Vec<TypedProperty<T>>,
    parent: Option<String>,
    discriminator: Option<String>,
    external: bool,
    embedded: bool,
    mapping: EntityMapping,
    factory: Option<Arc<dyn Fn() -> T + Send + Sync>>,
    errors: Vec<String>,
}

impl<T: Default + 'static> EntityBuilder<T> {
    /// Start a mapping named after the type, instantiated with `T::default()`
    pub fn new() -> Self {
        Self::named(short_type_name::<T>())
    }

    /// Start a mapping with an explicit entity name
    pub fn named(name: impl Into<String>) -> Self {
        let mut builder = Self::without_factory(name);
        builder.factory = Some(Arc::new(T::default));
        builder
    }
}

impl<T: Default + 'static> Default for EntityBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> EntityBuilder<T> {
    /// Start a mapping for a type that cannot be instantiated by the engine
    pub fn without_factory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
            parent: None,
            discriminator: None,
            external: false,
            embedded: false,
            mapping: EntityMapping::default(),
            factory: None,
            errors: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Use a custom constructor for new instances
    pub fn factory(mut self, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    // =========================================================================
    // Entity Options
    // =========================================================================

    /// Mark as a value type inlined into its owners
    pub fn embeddable(mut self) -> Self {
        self.embedded = true;
        self
    }

    /// Mark as managed by another datastore
    pub fn external(mut self) -> Self {
        self.external = true;
        self
    }

    /// Override the stored type marker (default: entity name)
    pub fn discriminator(mut self, value: impl Into<String>) -> Self {
        self.discriminator = Some(value.into());
        self
    }

    /// Override the storage family (collection / key prefix)
    pub fn family(mut self, family: impl Into<String>) -> Self {
        self.mapping.family = Some(family.into());
        self
    }

    /// Sort used by queries that specify no ordering
    pub fn default_sort(mut self, order: Order) -> Self {
        self.mapping.sort = Some(order);
        self
    }

    pub fn identity_generator(mut self, generator: IdentityGenerator) -> Self {
        self.mapping.identity_generator = generator;
        self
    }

    /// Inherit the properties of a parent mapping through a projection
    ///
    /// The parent must be registered before this entity.
    pub fn extends<P: 'static>(
        mut self,
        parent: EntityBuilder<P>,
        project: impl Fn(&T) -> &P + Send + Sync + 'static,
        project_mut: impl Fn(&mut T) -> &mut P + Send + Sync + 'static,
    ) -> Self {
        let project = Arc::new(project);
        let project_mut = Arc::new(project_mut);
        let mut lifted: Vec<TypedProperty<T>> = parent
            .properties
            .into_iter()
            .map(|p| {
                let get = p.get;
                let set = p.set;
                let project = Arc::clone(&project);
                let project_mut = Arc::clone(&project_mut);
                TypedProperty {
                    name: p.name,
                    kind: p.kind,
                    property_type: p.property_type,
                    nullable: p.nullable,
                    owner: p.owner,
                    mapping: p.mapping,
                    inverse: p.inverse,
                    owning_side: p.owning_side,
                    get: Arc::new(move |obj: &T| get(project(obj))),
                    set: Arc::new(move |obj: &mut T, value| set(project_mut(obj), value)),
                }
            })
            .collect();
        lifted.append(&mut self.properties);
        self.properties = lifted;
        self.parent = Some(parent.name);
        // a hierarchy shares one family and one key space
        if self.mapping.family.is_none() {
            self.mapping.family = parent.mapping.family;
        }
        if self.mapping.identity_generator == IdentityGenerator::default() {
            self.mapping.identity_generator = parent.mapping.identity_generator;
        }
        self
    }

    // =========================================================================
    // Scalar Properties
    // =========================================================================

    /// Declare the identity property
    pub fn identity<V, G, S>(self, name: &str, property_type: PropertyType, get: G, set: S) -> Self
    where
        V: Serialize + DeserializeOwned + 'static,
        G: Fn(&T) -> V + Send + Sync + 'static,
        S: Fn(&mut T, V) + Send + Sync + 'static,
    {
        self.scalar(name, PropertyKind::Identity, property_type, get, set)
    }

    /// Declare the optimistic-locking version property (an integer)
    pub fn version<V, G, S>(self, name: &str, get: G, set: S) -> Self
    where
        V: Serialize + DeserializeOwned + 'static,
        G: Fn(&T) -> V + Send + Sync + 'static,
        S: Fn(&mut T, V) + Send + Sync + 'static,
    {
        self.scalar(name, PropertyKind::Version, PropertyType::Integer, get, set)
    }

    /// Declare a simple property
    pub fn property<V, G, S>(self, name: &str, property_type: PropertyType, get: G, set: S) -> Self
    where
        V: Serialize + DeserializeOwned + 'static,
        G: Fn(&T) -> V + Send + Sync + 'static,
        S: Fn(&mut T, V) + Send + Sync + 'static,
    {
        self.scalar(name, PropertyKind::Simple, property_type, get, set)
    }

    fn scalar<V, G, S>(
        self,
        name: &str,
        kind: PropertyKind,
        property_type: PropertyType,
        get: G,
        set: S,
    ) -> Self
    where
        V: Serialize + DeserializeOwned + 'static,
        G: Fn(&T) -> V + Send + Sync + 'static,
        S: Fn(&mut T, V) + Send + Sync + 'static,
    {
        let property = name.to_string();
        let getter: TypedGetter<T> =
            Arc::new(move |obj: &T| Ok(PropertyValue::Scalar(serde_json::to_value(get(obj))?)));
        let setter: TypedSetter<T> = Arc::new(move |obj: &mut T, value| match value {
            PropertyValue::Scalar(v) => {
                let typed: V = serde_json::from_value(v).map_err(|e| {
                    DatastoreError::conversion(format!("property '{}': {}", property, e))
                })?;
                set(obj, typed);
                Ok(())
            }
            other => Err(DatastoreError::illegal_argument(format!(
                "property '{}' expects a scalar, got {:?}",
                property, other
            ))),
        });
        self.push(name, kind, property_type, getter, setter)
    }

    // =========================================================================
    // Associations
    // =========================================================================

    /// Value object stored inside the owner's entry
    pub fn embedded<U, G, S>(self, name: &str, get: G, set: S) -> Self
    where
        U: 'static,
        G: Fn(&T) -> Option<Rc<RefCell<U>>> + Send + Sync + 'static,
        S: Fn(&mut T, Option<Rc<RefCell<U>>>) + Send + Sync + 'static,
    {
        let kind = PropertyKind::Embedded {
            target: short_type_name::<U>(),
        };
        self.to_one(name, kind, get, set)
    }

    /// Collection of value objects stored inside the owner's entry
    pub fn embedded_collection<U, G, S>(self, name: &str, get: G, set: S) -> Self
    where
        U: 'static,
        G: Fn(&T) -> Vec<Rc<RefCell<U>>> + Send + Sync + 'static,
        S: Fn(&mut T, Vec<Rc<RefCell<U>>>) + Send + Sync + 'static,
    {
        let kind = PropertyKind::EmbeddedCollection {
            target: short_type_name::<U>(),
            collection: CollectionKind::List,
        };
        self.to_many(name, kind, get, set)
    }

    pub fn one_to_one<U, G, S>(self, name: &str, get: G, set: S) -> Self
    where
        U: 'static,
        G: Fn(&T) -> Option<Rc<RefCell<U>>> + Send + Sync + 'static,
        S: Fn(&mut T, Option<Rc<RefCell<U>>>) + Send + Sync + 'static,
    {
        let kind = PropertyKind::OneToOne {
            target: short_type_name::<U>(),
        };
        self.to_one(name, kind, get, set)
    }

    pub fn many_to_one<U, G, S>(self, name: &str, get: G, set: S) -> Self
    where
        U: 'static,
        G: Fn(&T) -> Option<Rc<RefCell<U>>> + Send + Sync + 'static,
        S: Fn(&mut T, Option<Rc<RefCell<U>>>) + Send + Sync + 'static,
    {
        let kind = PropertyKind::ManyToOne {
            target: short_type_name::<U>(),
        };
        self.to_one(name, kind, get, set)
    }

    pub fn one_to_many<U, G, S>(self, name: &str, get: G, set: S) -> Self
    where
        U: 'static,
        G: Fn(&T) -> Vec<Rc<RefCell<U>>> + Send + Sync + 'static,
        S: Fn(&mut T, Vec<Rc<RefCell<U>>>) + Send + Sync + 'static,
    {
        let kind = PropertyKind::OneToMany {
            target: short_type_name::<U>(),
            collection: CollectionKind::List,
        };
        self.to_many(name, kind, get, set)
    }

    pub fn many_to_many<U, G, S>(self, name: &str, get: G, set: S) -> Self
    where
        U: 'static,
        G: Fn(&T) -> Vec<Rc<RefCell<U>>> + Send + Sync + 'static,
        S: Fn(&mut T, Vec<Rc<RefCell<U>>>) + Send + Sync + 'static,
    {
        let kind = PropertyKind::ManyToMany {
            target: short_type_name::<U>(),
            collection: CollectionKind::List,
        };
        self.to_many(name, kind, get, set)
    }

    fn to_one<U, G, S>(self, name: &str, kind: PropertyKind, get: G, set: S) -> Self
    where
        U: 'static,
        G: Fn(&T) -> Option<Rc<RefCell<U>>> + Send + Sync + 'static,
        S: Fn(&mut T, Option<Rc<RefCell<U>>>) + Send + Sync + 'static,
    {
        let property = name.to_string();
        let getter: TypedGetter<T> = Arc::new(move |obj: &T| {
            Ok(PropertyValue::One(get(obj).map(|target| target as ObjectRef)))
        });
        let setter: TypedSetter<T> = Arc::new(move |obj: &mut T, value| {
            let target = match value {
                PropertyValue::One(target) => target.map(downcast::<U>).transpose()?,
                PropertyValue::Scalar(serde_json::Value::Null) => None,
                other => {
                    return Err(DatastoreError::illegal_argument(format!(
                        "property '{}' expects a single object, got {:?}",
                        property, other
                    )));
                }
            };
            set(obj, target);
            Ok(())
        });
        self.push(name, kind, PropertyType::Json, getter, setter)
    }

    fn to_many<U, G, S>(self, name: &str, kind: PropertyKind, get: G, set: S) -> Self
    where
        U: 'static,
        G: Fn(&T) -> Vec<Rc<RefCell<U>>> + Send + Sync + 'static,
        S: Fn(&mut T, Vec<Rc<RefCell<U>>>) + Send + Sync + 'static,
    {
        let property = name.to_string();
        let getter: TypedGetter<T> = Arc::new(move |obj: &T| {
            Ok(PropertyValue::Many(
                get(obj)
                    .into_iter()
                    .map(|target| target as ObjectRef)
                    .collect(),
            ))
        });
        let setter: TypedSetter<T> = Arc::new(move |obj: &mut T, value| {
            let targets = match value {
                PropertyValue::Many(targets) => targets
                    .into_iter()
                    .map(downcast::<U>)
                    .collect::<Result<Vec<_>>>()?,
                PropertyValue::Scalar(serde_json::Value::Null) => Vec::new(),
                other => {
                    return Err(DatastoreError::illegal_argument(format!(
                        "property '{}' expects a collection, got {:?}",
                        property, other
                    )));
                }
            };
            set(obj, targets);
            Ok(())
        });
        self.push(name, kind, PropertyType::Json, getter, setter)
    }

    fn push(
        mut self,
        name: &str,
        kind: PropertyKind,
        property_type: PropertyType,
        get: TypedGetter<T>,
        set: TypedSetter<T>,
    ) -> Self {
        let nullable = kind != PropertyKind::Identity && kind != PropertyKind::Version;
        self.properties.push(TypedProperty {
            name: name.to_string(),
            kind,
            property_type,
            nullable,
            owner: self.name.clone(),
            mapping: PropertyMapping::default(),
            inverse: None,
            owning_side: true,
            get,
            set,
        });
        self
    }

    // =========================================================================
    // Modifiers (apply to the most recently declared property)
    // =========================================================================

    fn modify(mut self, modifier: &str, apply: impl FnOnce(&mut TypedProperty<T>)) -> Self {
        match self.properties.last_mut() {
            Some(property) => apply(property),
            None => self
                .errors
                .push(format!("'{}' used before any property was declared", modifier)),
        }
        self
    }

    pub fn not_null(self) -> Self {
        self.modify("not_null", |p| p.nullable = false)
    }

    /// Store under a different native field name
    pub fn field(self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.modify("field", |p| p.mapping.field = Some(field))
    }

    /// Store a to-one association as a raw key instead of a reference
    pub fn embed(self) -> Self {
        self.modify("embed", |p| p.mapping.reference = false)
    }

    /// Maintain a secondary index for this property
    pub fn index(self) -> Self {
        self.modify("index", |p| p.mapping.index = true)
    }

    /// Collection association with set semantics
    pub fn as_set(self) -> Self {
        self.modify("as_set", |p| match &mut p.kind {
            PropertyKind::EmbeddedCollection { collection, .. }
            | PropertyKind::OneToMany { collection, .. }
            | PropertyKind::ManyToMany { collection, .. } => *collection = CollectionKind::Set,
            _ => {}
        })
    }

    /// Name the target entity explicitly (default: the target type's name)
    pub fn target(self, entity: impl Into<String>) -> Self {
        let entity = entity.into();
        self.modify("target", |p| match &mut p.kind {
            PropertyKind::Embedded { target }
            | PropertyKind::EmbeddedCollection { target, .. }
            | PropertyKind::OneToOne { target }
            | PropertyKind::ManyToOne { target }
            | PropertyKind::OneToMany { target, .. }
            | PropertyKind::ManyToMany { target, .. } => *target = entity,
            _ => {}
        })
    }

    /// Inverse side of a bidirectional association; the target holds the key
    pub fn mapped_by(self, inverse: impl Into<String>) -> Self {
        let inverse = inverse.into();
        self.modify("mapped_by", |p| {
            p.inverse = Some(inverse);
            p.owning_side = false;
        })
    }

    /// Owning side of a bidirectional association
    pub fn inverse_of(self, inverse: impl Into<String>) -> Self {
        let inverse = inverse.into();
        self.modify("inverse_of", |p| p.inverse = Some(inverse))
    }

    // =========================================================================
    // Build
    // =========================================================================

    /// Erase the typed closures into a [`PersistentEntity`]
    pub fn build(self) -> Result<PersistentEntity> {
        if let Some(error) = self.errors.first() {
            return Err(DatastoreError::mapping(format!("{}: {}", self.name, error)));
        }
        if self.name.is_empty() {
            return Err(DatastoreError::mapping("entity name cannot be empty"));
        }

        let mut seen = HashSet::new();
        for property in &self.properties {
            if !seen.insert(property.name.as_str()) {
                return Err(DatastoreError::mapping(format!(
                    "{}: duplicate property '{}'",
                    self.name, property.name
                )));
            }
        }

        let identities = self
            .properties
            .iter()
            .filter(|p| p.kind == PropertyKind::Identity)
            .count();
        let versions = self
            .properties
            .iter()
            .filter(|p| p.kind == PropertyKind::Version)
            .count();
        match (self.embedded, identities) {
            (false, 1) | (true, 0) => {}
            (false, 0) => {
                return Err(DatastoreError::mapping(format!(
                    "{}: no identity property",
                    self.name
                )));
            }
            (_, n) => {
                return Err(DatastoreError::mapping(format!(
                    "{}: expected one identity property, found {}",
                    self.name, n
                )));
            }
        }
        if versions > 1 {
            return Err(DatastoreError::mapping(format!(
                "{}: more than one version property",
                self.name
            )));
        }

        let entity_name = self.name.clone();
        let properties = self
            .properties
            .into_iter()
            .map(|p| erase(&entity_name, p))
            .collect();
        let factory = self.factory.map(|make| {
            Arc::new(move || Rc::new(RefCell::new(make())) as ObjectRef)
                as Arc<dyn Fn() -> ObjectRef + Send + Sync>
        });

        Ok(PersistentEntity {
            discriminator: self.discriminator.unwrap_or_else(|| self.name.clone()),
            root: self.parent.clone().unwrap_or_else(|| self.name.clone()),
            name: self.name,
            type_id: TypeId::of::<RefCell<T>>(),
            type_name: std::any::type_name::<T>(),
            properties,
            parent: self.parent,
            external: self.external,
            embedded: self.embedded,
            mapping: self.mapping,
            factory,
        })
    }
}

fn erase<T: 'static>(entity: &str, property: TypedProperty<T>) -> PersistentProperty {
    let get = property.get;
    let set = property.set;
    let read_label = format!("{}.{}", entity, property.name);
    let write_label = read_label.clone();

    let accessor = PropertyAccessor {
        get: Arc::new(move |object: &dyn Any| {
            let cell = object.downcast_ref::<RefCell<T>>().ok_or_else(|| {
                DatastoreError::illegal_argument(format!("{}: wrong instance type", read_label))
            })?;
            let instance = cell.try_borrow().map_err(|_| {
                DatastoreError::illegal_argument(format!(
                    "{}: instance is mutably borrowed",
                    read_label
                ))
            })?;
            get(&instance)
        }),
        set: Arc::new(move |object: &dyn Any, value| {
            let cell = object.downcast_ref::<RefCell<T>>().ok_or_else(|| {
                DatastoreError::illegal_argument(format!("{}: wrong instance type", write_label))
            })?;
            let mut instance = cell.try_borrow_mut().map_err(|_| {
                DatastoreError::illegal_argument(format!("{}: instance is borrowed", write_label))
            })?;
            set(&mut instance, value)
        }),
    };

    PersistentProperty {
        name: property.name,
        kind: property.kind,
        property_type: property.property_type,
        nullable: property.nullable,
        owner: property.owner,
        mapping: property.mapping,
        inverse: property.inverse,
        owning_side: property.owning_side,
        accessor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Default)]
    struct Animal {
        id: Option<i64>,
        name: String,
    }

    #[derive(Debug, Default)]
    struct Dog {
        animal: Animal,
        breed: Option<String>,
        owner: Option<Rc<RefCell<Animal>>>,
    }

    fn animal_mapping() -> EntityBuilder<Animal> {
        EntityBuilder::<Animal>::new()
            .identity("id", PropertyType::Integer, |a| a.id, |a, v| a.id = v)
            .property("name", PropertyType::String, |a| a.name.clone(), |a, v| a.name = v)
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<Animal>(), "Animal");
        assert_eq!(short_type_name::<Vec<Animal>>(), "Vec");
    }

    #[test]
    fn test_accessor_table_reads_and_writes() {
        let entity = animal_mapping().build().unwrap();
        let rex: ObjectRef = object(Animal {
            id: Some(1),
            name: "Rex".to_string(),
        });

        let name = entity.property("name").unwrap();
        assert_eq!(name.read(&*rex).unwrap().into_scalar(), Some(json!("Rex")));

        name.write(&*rex, PropertyValue::Scalar(json!("Max"))).unwrap();
        let typed = downcast::<Animal>(rex).unwrap();
        assert_eq!(typed.borrow().name, "Max");
    }

    #[test]
    fn test_setter_rejects_wrong_shape() {
        let entity = animal_mapping().build().unwrap();
        let rex: ObjectRef = object(Animal::default());
        let id = entity.property("id").unwrap();

        let err = id.write(&*rex, PropertyValue::Scalar(json!("abc"))).unwrap_err();
        assert!(matches!(err, DatastoreError::Conversion(_)));

        let err = id.write(&*rex, PropertyValue::Many(vec![])).unwrap_err();
        assert!(matches!(err, DatastoreError::IllegalArgument(_)));
    }

    #[test]
    fn test_borrowed_instance_is_reported() {
        let entity = animal_mapping().build().unwrap();
        let typed = object(Animal::default());
        let rex: ObjectRef = typed.clone();
        let _guard = typed.borrow_mut();

        let err = entity.property("name").unwrap().read(&*rex).unwrap_err();
        assert!(matches!(err, DatastoreError::IllegalArgument(_)));
    }

    #[test]
    fn test_extends_lifts_parent_properties() {
        let dog = EntityBuilder::<Dog>::new()
            .extends(animal_mapping(), |d| &d.animal, |d| &mut d.animal)
            .property("breed", PropertyType::String, |d| d.breed.clone(), |d, v| d.breed = v)
            .many_to_one::<Animal, _, _>("owner", |d| d.owner.clone(), |d, v| d.owner = v)
            .build()
            .unwrap();

        assert_eq!(dog.parent_name(), Some("Animal"));
        assert_eq!(dog.discriminator(), "Dog");
        let names: Vec<_> = dog.properties().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["id", "name", "breed", "owner"]);
        assert_eq!(dog.property("name").unwrap().owner(), "Animal");

        let fido: ObjectRef = object(Dog::default());
        dog.property("name")
            .unwrap()
            .write(&*fido, PropertyValue::Scalar(json!("Fido")))
            .unwrap();
        let typed = downcast::<Dog>(fido).unwrap();
        assert_eq!(typed.borrow().animal.name, "Fido");
    }

    #[test]
    fn test_association_setter_downcasts() {
        let dog = EntityBuilder::<Dog>::new()
            .extends(animal_mapping(), |d| &d.animal, |d| &mut d.animal)
            .many_to_one::<Animal, _, _>("owner", |d| d.owner.clone(), |d, v| d.owner = v)
            .build()
            .unwrap();
        let owner = dog.property("owner").unwrap();
        assert_eq!(owner.target_entity(), Some("Animal"));

        let fido: ObjectRef = object(Dog::default());
        let wrong: ObjectRef = object(Dog::default());
        assert!(owner.write(&*fido, PropertyValue::One(Some(wrong))).is_err());

        let person: ObjectRef = object(Animal::default());
        owner.write(&*fido, PropertyValue::One(Some(person))).unwrap();
        assert!(matches!(owner.read(&*fido).unwrap(), PropertyValue::One(Some(_))));
    }

    #[test]
    fn test_build_requires_identity() {
        let err = EntityBuilder::<Animal>::new()
            .property("name", PropertyType::String, |a| a.name.clone(), |a, v| a.name = v)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("no identity"));
    }

    #[test]
    fn test_build_rejects_duplicate_property() {
        let err = animal_mapping()
            .property("name", PropertyType::String, |a| a.name.clone(), |a, v| a.name = v)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate property 'name'"));
    }

    #[test]
    fn test_modifier_without_property_is_an_error() {
        let err = EntityBuilder::<Animal>::new().not_null().build().unwrap_err();
        assert!(matches!(err, DatastoreError::Mapping(_)));
    }

    #[test]
    fn test_without_factory_cannot_instantiate() {
        let entity = EntityBuilder::<Animal>::without_factory("Animal")
            .identity("id", PropertyType::Integer, |a| a.id, |a, v| a.id = v)
            .build()
            .unwrap();
        assert!(matches!(
            entity.new_instance(),
            Err(DatastoreError::EntityCreation(_))
        ));
    }
}
