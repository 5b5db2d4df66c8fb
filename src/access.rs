//! Typed access to a live domain object through its entity's accessor table

use std::sync::Arc;

use serde_json::Value;

use crate::conversion::ConversionService;
use crate::error::{DatastoreError, Result};
use crate::model::{ObjectRef, PersistentEntity, PersistentProperty, PropertyKind, PropertyValue};
use crate::types::PropertyType;

/// Get/set access over one domain object
#[derive(Clone)]
pub struct EntityAccess {
    entity: Arc<PersistentEntity>,
    object: ObjectRef,
    conversion: Arc<dyn ConversionService>,
}

impl EntityAccess {
    pub fn new(
        entity: Arc<PersistentEntity>,
        object: ObjectRef,
        conversion: Arc<dyn ConversionService>,
    ) -> Self {
        Self {
            entity,
            object,
            conversion,
        }
    }

    pub fn entity(&self) -> &Arc<PersistentEntity> {
        &self.entity
    }

    pub fn object(&self) -> &ObjectRef {
        &self.object
    }

    /// Declared property, or `IllegalArgument` for unknown names
    pub fn property(&self, name: &str) -> Result<&PersistentProperty> {
        self.entity.property(name).ok_or_else(|| {
            DatastoreError::illegal_argument(format!(
                "no property '{}' on entity '{}'",
                name, self.entity.name()
            ))
        })
    }

    pub fn property_type(&self, name: &str) -> Result<&PropertyType> {
        Ok(self.property(name)?.property_type())
    }

    pub fn get(&self, name: &str) -> Result<PropertyValue> {
        self.property(name)?.read(&*self.object)
    }

    /// Scalar value of a simple property, identity or version
    pub fn get_value(&self, name: &str) -> Result<Value> {
        match self.get(name)? {
            PropertyValue::Scalar(value) => Ok(value),
            other => Err(DatastoreError::illegal_argument(format!(
                "property '{}' is an association ({:?})",
                name, other
            ))),
        }
    }

    /// Set a property, converting scalars to the declared type first
    pub fn set(&self, name: &str, value: PropertyValue) -> Result<()> {
        let property = self.property(name)?;
        let value = match value {
            PropertyValue::Scalar(v) if !property.kind().is_association() => {
                PropertyValue::Scalar(self.conversion.convert(&v, property.property_type())?)
            }
            other => other,
        };
        property.write(&*self.object, value)
    }

    /// Set a property whose value is already in its native form
    pub fn set_no_conversion(&self, name: &str, value: PropertyValue) -> Result<()> {
        self.property(name)?.write(&*self.object, value)
    }

    /// Identifier value, `None` while unassigned
    pub fn identifier(&self) -> Result<Option<Value>> {
        let Some(identity) = self.entity.identity() else {
            return Ok(None);
        };
        match identity.read(&*self.object)? {
            PropertyValue::Scalar(Value::Null) => Ok(None),
            PropertyValue::Scalar(value) => Ok(Some(value)),
            other => Err(DatastoreError::illegal_argument(format!(
                "identity of '{}' is not a scalar: {:?}",
                self.entity.name(),
                other
            ))),
        }
    }

    /// Assign the identifier; conversion failures propagate
    pub fn set_identifier(&self, id: Value) -> Result<()> {
        let identity = self.entity.identity().ok_or_else(|| {
            DatastoreError::illegal_argument(format!(
                "entity '{}' has no identity",
                self.entity.name()
            ))
        })?;
        let id = self.conversion.convert(&id, identity.property_type())?;
        identity.write(&*self.object, PropertyValue::Scalar(id))
    }

    /// Re-read every property and write it back unchanged
    ///
    /// Forces derived state maintained by setters to resynchronise.
    pub fn refresh(&self) -> Result<()> {
        for property in self.entity.properties() {
            if property.kind() == &PropertyKind::Identity {
                continue;
            }
            let value = property.read(&*self.object)?;
            property.write(&*self.object, value)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for EntityAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityAccess")
            .field("entity", &self.entity.name())
            .finish()
    }
}
