use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::entity::Entity;
use crate::error::ModelError;
use crate::id::EntityId;
use crate::preferences::PreferencePatch;

/// One atomic batch of changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateEvent {
    /// Acting user; `None` for system-initiated changes.
    #[serde(default)]
    pub user_id: Option<EntityId>,
    #[serde(default)]
    pub store: Vec<Entity>,
    #[serde(default)]
    pub remove: Vec<EntityId>,
    #[serde(default)]
    pub patches: Vec<PreferencePatch>,
}

impl UpdateEvent {
    pub fn by(user_id: Option<EntityId>) -> Self {
        Self {
            user_id,
            ..Default::default()
        }
    }

    pub fn store(mut self, entity: Entity) -> Self {
        self.store.push(entity);
        self
    }

    pub fn remove(mut self, id: EntityId) -> Self {
        self.remove.push(id);
        self
    }

    pub fn patch(mut self, patch: PreferencePatch) -> Self {
        self.patches.push(patch);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty() && self.remove.is_empty() && self.patches.is_empty()
    }

    /// Checks the batch-level invariants before any lock is taken.
    pub fn validate(&self) -> Result<(), ModelError> {
        let mut stored = BTreeSet::new();
        for entity in &self.store {
            entity.check_kind()?;
            if entity.id.is_internal() {
                return Err(ModelError::InternalEntity(entity.id.clone()));
            }
            if !stored.insert(&entity.id) {
                return Err(ModelError::DuplicateStore(entity.id.clone()));
            }
        }
        for id in &self.remove {
            id.kind()?;
            if id.is_internal() {
                return Err(ModelError::InternalEntity(id.clone()));
            }
            if stored.contains(id) {
                return Err(ModelError::StoreAndRemove(id.clone()));
            }
        }
        Ok(())
    }

    /// Ids of every stored or removed entity, in batch order.
    pub fn touched_ids(&self) -> Vec<EntityId> {
        let mut seen = BTreeSet::new();
        self.store
            .iter()
            .map(|e| &e.id)
            .chain(self.remove.iter())
            .filter(|id| seen.insert(*id))
            .cloned()
            .collect()
    }

    pub fn touches_type_definition(&self) -> bool {
        self.touched_ids().iter().any(EntityId::is_type_defining)
    }
}
