use ahash::{AHashMap, AHashSet};
use rota_model::{
    Category, Classification, DynamicType, Entity, EntityBody, EntityId, EntityKind, UpdateEvent,
};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::StoreError;
use crate::snapshot::Snapshot;

pub fn super_category_id() -> EntityId {
    EntityId::internal(EntityKind::Category, "root")
}

pub fn template_type_id() -> EntityId {
    EntityId::internal(EntityKind::DynamicType, "template")
}

pub fn period_type_id() -> EntityId {
    EntityId::internal(EntityKind::DynamicType, "period")
}

/// Built-in entities present in every cache and never persisted.
pub fn internal_entities() -> Vec<Entity> {
    let seeds = [
        (
            super_category_id(),
            EntityBody::Category(Category {
                key: "supercategory".into(),
                name: "Root".into(),
                parent: None,
            }),
        ),
        (
            template_type_id(),
            EntityBody::DynamicType(DynamicType {
                key: "rota:template".into(),
                name: "Template".into(),
                classification: Classification::Internal,
                attributes: Vec::new(),
            }),
        ),
        (
            period_type_id(),
            EntityBody::DynamicType(DynamicType {
                key: "rota:period".into(),
                name: "Period".into(),
                classification: Classification::Internal,
                attributes: Vec::new(),
            }),
        ),
    ];
    // Internal ids always encode the kind of their body.
    seeds
        .into_iter()
        .filter_map(|(id, body)| Entity::new(id, body).ok())
        .collect()
}

/// Id → entity map plus password hashes. Every entity held here is resolved
/// and read-only; a published cache is never mutated, writers build a new one.
#[derive(Debug, Clone, Default)]
pub struct LocalCache {
    entities: AHashMap<EntityId, Arc<Entity>>,
    passwords: AHashMap<EntityId, String>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// An otherwise empty cache holding the internal entities.
    pub fn seeded() -> Self {
        let mut cache = Self::new();
        for entity in internal_entities() {
            cache.put(entity);
        }
        cache
    }

    pub fn super_category(&self) -> Option<&Arc<Entity>> {
        self.entities.get(&super_category_id())
    }

    pub fn get(&self, id: &EntityId) -> Option<&Arc<Entity>> {
        self.entities.get(id)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.entities.contains_key(id)
    }

    pub fn put(&mut self, mut entity: Entity) {
        entity.set_read_only();
        self.entities.insert(entity.id.clone(), Arc::new(entity));
    }

    pub fn remove(&mut self, id: &EntityId) -> Option<Arc<Entity>> {
        self.passwords.remove(id);
        self.entities.remove(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Entity>> {
        self.entities.values()
    }

    /// Entities that live in the backing store, i.e. everything but the
    /// internal ones.
    pub fn persistent(&self) -> impl Iterator<Item = &Arc<Entity>> {
        self.entities.values().filter(|e| !e.id.is_internal())
    }

    pub fn users(&self) -> Vec<Arc<Entity>> {
        let mut users: Vec<Arc<Entity>> = self
            .entities
            .values()
            .filter(|e| e.as_user().is_some())
            .cloned()
            .collect();
        users.sort_by_key(|e| e.as_user().map(|u| u.username.clone()));
        users
    }

    pub fn put_password(&mut self, id: EntityId, hash: String) {
        self.passwords.insert(id, hash);
    }

    pub fn remove_password(&mut self, id: &EntityId) {
        self.passwords.remove(id);
    }

    pub fn password(&self, id: &EntityId) -> Option<&str> {
        self.passwords.get(id).map(String::as_str)
    }

    /// Rejects a batch that would leave references pointing nowhere: stored
    /// entities must reference existing (or co-stored) entities, patched
    /// preferences must belong to a user that stays, and removed entities must
    /// not be referenced by anything that stays.
    pub fn check_dependencies(&self, event: &UpdateEvent) -> Result<(), StoreError> {
        let removed: AHashSet<&EntityId> = event.remove.iter().collect();
        let stored: AHashSet<&EntityId> = event.store.iter().map(|e| &e.id).collect();

        for entity in &event.store {
            for reference in entity.references() {
                let exists = stored.contains(&reference.id)
                    || (self.contains(&reference.id) && !removed.contains(&reference.id));
                if !reference.is_well_formed() || !exists {
                    return Err(StoreError::DanglingReference {
                        id: entity.id.clone(),
                        target: reference.id.clone(),
                    });
                }
            }
        }

        for patch in &event.patches {
            let Some(owner) = &patch.user_id else {
                continue;
            };
            let is_user = |e: &Entity| e.id == *owner && e.kind() == EntityKind::User;
            let exists = event.store.iter().any(is_user)
                || (!removed.contains(owner) && self.get(owner).is_some_and(|e| is_user(e)));
            if !exists {
                return Err(StoreError::DanglingReference {
                    id: patch.preferences_id(),
                    target: owner.clone(),
                });
            }
        }

        if removed.is_empty() {
            return Ok(());
        }
        for entity in self.entities.values() {
            if removed.contains(&entity.id) || stored.contains(&entity.id) {
                continue;
            }
            if let Some(reference) = entity
                .references()
                .into_iter()
                .find(|r| removed.contains(&r.id))
            {
                return Err(StoreError::StillReferenced {
                    id: reference.id.clone(),
                    by: entity.id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Persistent content in the neutral export format.
    pub fn snapshot(&self) -> Snapshot {
        let mut entities: Vec<Entity> = self.persistent().map(|e| e.edit()).collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        let passwords: BTreeMap<EntityId, String> = self
            .passwords
            .iter()
            .map(|(id, hash)| (id.clone(), hash.clone()))
            .collect();
        Snapshot::new(entities, passwords)
    }
}
