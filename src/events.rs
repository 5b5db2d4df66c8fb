//! Persistence lifecycle hooks and automatic timestamps

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;

use crate::access::EntityAccess;
use crate::conversion::format_timestamp;
use crate::error::Result;
use crate::model::{MappingContextListener, PersistentEntity, PropertyKind};
use crate::types::PropertyType;

/// Hooks fired by the persister around writes and after loads
///
/// Returning `Ok(false)` from a `before_*` hook cancels that operation.
pub trait PersistenceListener: Send + Sync {
    fn before_insert(&self, _access: &EntityAccess) -> Result<bool> {
        Ok(true)
    }

    fn before_update(&self, _access: &EntityAccess) -> Result<bool> {
        Ok(true)
    }

    fn before_delete(&self, _access: &EntityAccess) -> Result<bool> {
        Ok(true)
    }

    fn after_load(&self, _access: &EntityAccess) -> Result<()> {
        Ok(())
    }
}

pub const DATE_CREATED: &str = "dateCreated";
pub const LAST_UPDATED: &str = "lastUpdated";

#[derive(Debug, Default, Clone, Copy)]
struct Timestamps {
    date_created: bool,
    last_updated: bool,
}

/// Maintains `dateCreated` and `lastUpdated` on entities that declare them
#[derive(Debug, Default)]
pub struct AutoTimestampListener {
    entities: RwLock<HashMap<String, Timestamps>>,
}

impl AutoTimestampListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `entity` has at least one managed timestamp
    pub fn is_tracked(&self, entity: &str) -> bool {
        self.entities.read().contains_key(entity)
    }

    fn timestamps(&self, entity: &str) -> Option<Timestamps> {
        self.entities.read().get(entity).copied()
    }
}

fn is_timestamp(entity: &PersistentEntity, name: &str) -> bool {
    entity.property(name).is_some_and(|p| {
        p.kind() == &PropertyKind::Simple && p.property_type() == &PropertyType::Timestamp
    })
}

impl MappingContextListener for AutoTimestampListener {
    fn persistent_entity_added(&self, entity: &Arc<PersistentEntity>) {
        let found = Timestamps {
            date_created: is_timestamp(entity, DATE_CREATED),
            last_updated: is_timestamp(entity, LAST_UPDATED),
        };
        if found.date_created || found.last_updated {
            self.entities
                .write()
                .insert(entity.name().to_string(), found);
        }
    }
}

impl PersistenceListener for AutoTimestampListener {
    fn before_insert(&self, access: &EntityAccess) -> Result<bool> {
        if let Some(found) = self.timestamps(access.entity().name()) {
            let now = Value::String(format_timestamp(&Utc::now()));
            if found.date_created {
                access.set(DATE_CREATED, now.clone().into())?;
            }
            if found.last_updated {
                access.set(LAST_UPDATED, now.into())?;
            }
        }
        Ok(true)
    }

    fn before_update(&self, access: &EntityAccess) -> Result<bool> {
        if let Some(found) = self.timestamps(access.entity().name()) {
            if found.last_updated {
                let now = Value::String(format_timestamp(&Utc::now()));
                access.set(LAST_UPDATED, now.into())?;
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::DefaultConversionService;
    use crate::model::{EntityBuilder, MappingContext, object};

    #[derive(Debug, Default)]
    struct Post {
        id: Option<i64>,
        date_created: Option<String>,
        last_updated: Option<String>,
    }

    #[derive(Debug, Default)]
    struct Tag {
        id: Option<i64>,
    }

    fn post() -> EntityBuilder<Post> {
        EntityBuilder::<Post>::new()
            .identity("id", PropertyType::Integer, |p| p.id, |p, v| p.id = v)
            .property(
                DATE_CREATED,
                PropertyType::Timestamp,
                |p| p.date_created.clone(),
                |p, v| p.date_created = v,
            )
            .property(
                LAST_UPDATED,
                PropertyType::Timestamp,
                |p| p.last_updated.clone(),
                |p, v| p.last_updated = v,
            )
    }

    #[test]
    fn test_tracks_only_entities_with_timestamps() {
        let context = MappingContext::new();
        let listener = Arc::new(AutoTimestampListener::new());
        context.add_listener(listener.clone());
        context.add(post()).unwrap();
        context
            .add(EntityBuilder::<Tag>::new().identity(
                "id",
                PropertyType::Integer,
                |t| t.id,
                |t, v| t.id = v,
            ))
            .unwrap();

        assert!(listener.is_tracked("Post"));
        assert!(!listener.is_tracked("Tag"));
    }

    #[test]
    fn test_insert_sets_both_update_sets_last_updated() {
        let context = MappingContext::new();
        let listener = Arc::new(AutoTimestampListener::new());
        let entity = context.add(post()).unwrap();
        context.add_listener(listener.clone());

        let instance = object(Post::default());
        let access = EntityAccess::new(entity, instance.clone(), Arc::new(DefaultConversionService));

        assert!(listener.before_insert(&access).unwrap());
        let created = instance.borrow().date_created.clone().unwrap();
        assert!(created.ends_with('Z'));
        assert_eq!(instance.borrow().last_updated.as_deref(), Some(created.as_str()));

        instance.borrow_mut().last_updated = None;
        assert!(listener.before_update(&access).unwrap());
        assert_eq!(instance.borrow().date_created.as_deref(), Some(created.as_str()));
        assert!(instance.borrow().last_updated.is_some());
    }
}
