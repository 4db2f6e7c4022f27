// ============================================================================
// Entity Metadata
// ============================================================================
//
// Typed entities convert to and from untyped `Record`s. Their mapping
// metadata (table, view, columns, children, list-only fields) is collected in
// an `EntityRegistry` that is built once at startup and shared read-only.
//
// ============================================================================

pub mod info;
pub mod policy;

pub use info::{
    ChildCardinality, ChildInfo, ChildKind, EntityInfo, EntityInfoBuilder, FieldInfo,
    FieldTransformer, ListOnlyInfo,
};
pub use policy::{EntityPolicy, VersionedEntityPolicy};

use crate::core::{DbError, ErrorCode, Record, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// A typed persistent entity.
pub trait Entity: Sized + Send + Sync + 'static {
    /// Logical entity name, the key into the `EntityRegistry`.
    const ENTITY: &'static str;

    fn to_record(&self) -> Record;

    fn from_record(record: Record) -> Result<Self>;
}

/// Immutable lookup table of entity metadata.
#[derive(Default)]
pub struct EntityRegistry {
    entities: HashMap<String, Arc<EntityInfo>>,
}

impl EntityRegistry {
    pub fn builder() -> EntityRegistryBuilder {
        EntityRegistryBuilder::default()
    }

    pub fn get(&self, entity: &str) -> Result<&Arc<EntityInfo>> {
        self.entities.get(entity).ok_or_else(|| {
            DbError::coded(
                ErrorCode::EntityNotRegistered,
                format!("Entity '{}' is not registered", entity),
            )
        })
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.entities.contains_key(entity)
    }

    pub fn entity_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entities.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[derive(Default)]
pub struct EntityRegistryBuilder {
    entities: HashMap<String, Arc<EntityInfo>>,
}

impl EntityRegistryBuilder {
    pub fn register(mut self, info: EntityInfo) -> Self {
        self.entities.insert(info.name().to_string(), Arc::new(info));
        self
    }

    /// Freeze the registry. Fails when a child or list-only mapping refers
    /// to an entity that was never registered.
    pub fn build(self) -> Result<Arc<EntityRegistry>> {
        for info in self.entities.values() {
            let referenced = info
                .children()
                .iter()
                .map(|child| child.child_entity.as_str())
                .chain(info.list_only().iter().map(|lo| lo.foreign_entity.as_str()));
            for name in referenced {
                if !self.entities.contains_key(name) {
                    return Err(DbError::coded(
                        ErrorCode::EntityNotRegistered,
                        format!(
                            "Entity '{}' references unregistered entity '{}'",
                            info.name(),
                            name
                        ),
                    ));
                }
            }
        }

        Ok(Arc::new(EntityRegistry {
            entities: self.entities,
        }))
    }
}
