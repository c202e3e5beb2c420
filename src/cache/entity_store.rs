use ahash::{AHashMap, AHashSet};
use rota_model::{Entity, EntityId, EntityKind};
use std::collections::BTreeMap;
use std::fmt;

use crate::cache::local::LocalCache;

/// Longest parent chain accepted for a category.
pub const MAX_CATEGORY_DEPTH: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inconsistency {
    /// The referenced entity is neither loaded nor internal.
    Dangling(EntityId),
    /// The reference kind disagrees with the referenced id.
    MalformedReference(EntityId),
    CategoryCycle,
    CategoryTooDeep,
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inconsistency::Dangling(target) => write!(f, "references missing {target}"),
            Inconsistency::MalformedReference(target) => {
                write!(f, "holds a malformed reference to {target}")
            }
            Inconsistency::CategoryCycle => f.write_str("category parent chain forms a cycle"),
            Inconsistency::CategoryTooDeep => write!(
                f,
                "category parent chain is deeper than {MAX_CATEGORY_DEPTH}"
            ),
        }
    }
}

/// Staging area of a load pass. Raw rows are collected first; references are
/// only checked once everything has been read, so rows may arrive in any order.
pub struct EntityStore<'a> {
    base: &'a LocalCache,
    pending: BTreeMap<EntityId, Entity>,
    passwords: AHashMap<EntityId, String>,
}

impl<'a> EntityStore<'a> {
    pub fn new(base: &'a LocalCache) -> Self {
        Self {
            base,
            pending: BTreeMap::new(),
            passwords: AHashMap::new(),
        }
    }

    pub fn put(&mut self, entity: Entity) {
        self.pending.insert(entity.id.clone(), entity);
    }

    pub fn put_password(&mut self, id: EntityId, hash: String) {
        self.passwords.insert(id, hash);
    }

    pub fn password(&self, id: &EntityId) -> Option<&str> {
        self.passwords.get(id).map(String::as_str)
    }

    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.pending
            .get(id)
            .or_else(|| self.base.get(id).map(|e| &**e))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drops every staged entity whose references do not resolve, repeating
    /// until nothing changes since each drop can orphan further entities.
    pub fn remove_inconsistent(&mut self) -> Vec<(EntityId, Inconsistency)> {
        let mut dropped = Vec::new();
        loop {
            let round: Vec<(EntityId, Inconsistency)> = self
                .pending
                .values()
                .filter_map(|e| self.check(e).err().map(|why| (e.id.clone(), why)))
                .collect();
            if round.is_empty() {
                break;
            }
            for (id, _) in &round {
                self.pending.remove(id);
            }
            dropped.extend(round);
        }

        let users: AHashSet<&EntityId> = self
            .pending
            .values()
            .filter(|e| e.kind() == EntityKind::User)
            .map(|e| &e.id)
            .collect();
        self.passwords.retain(|id, _| users.contains(id));
        dropped
    }

    fn check(&self, entity: &Entity) -> Result<(), Inconsistency> {
        for reference in entity.references() {
            if !reference.is_well_formed() {
                return Err(Inconsistency::MalformedReference(reference.id.clone()));
            }
            if self.get(&reference.id).is_none() {
                return Err(Inconsistency::Dangling(reference.id.clone()));
            }
        }
        if entity.as_category().is_some() {
            self.check_category_chain(entity)?;
        }
        Ok(())
    }

    fn check_category_chain(&self, entity: &Entity) -> Result<(), Inconsistency> {
        let mut seen: AHashSet<&EntityId> = AHashSet::from_iter([&entity.id]);
        let mut current = entity;
        let mut depth = 0;
        while let Some(parent) = current.as_category().and_then(|c| c.parent.as_ref()) {
            if parent.kind != EntityKind::Category {
                return Err(Inconsistency::MalformedReference(parent.id.clone()));
            }
            depth += 1;
            if depth > MAX_CATEGORY_DEPTH {
                return Err(Inconsistency::CategoryTooDeep);
            }
            if !seen.insert(&parent.id) {
                return Err(Inconsistency::CategoryCycle);
            }
            match self.get(&parent.id) {
                Some(next) => current = next,
                // reported as dangling by the reference check
                None => return Ok(()),
            }
        }
        Ok(())
    }

    /// Publishes the staged entities on top of the base cache, read-only.
    pub fn into_cache(self) -> LocalCache {
        let mut cache = self.base.clone();
        for entity in self.pending.into_values() {
            cache.put(entity);
        }
        for (id, hash) in self.passwords {
            cache.put_password(id, hash);
        }
        cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::local::super_category_id;
    use rota_model::{Category, EntityBody, Reference, User};

    fn category_with_parent(suffix: &str, parent: &EntityId) -> Entity {
        Entity::new(
            EntityId::new(EntityKind::Category, suffix),
            EntityBody::Category(Category {
                key: suffix.into(),
                name: suffix.into(),
                parent: Some(Reference::to(parent).unwrap()),
            }),
        )
        .unwrap()
    }

    fn cat(suffix: &str) -> EntityId {
        EntityId::new(EntityKind::Category, suffix)
    }

    #[test]
    fn rows_resolve_regardless_of_order() {
        let base = LocalCache::seeded();
        let mut store = EntityStore::new(&base);
        store.put(category_with_parent("child", &cat("parent")));
        store.put(category_with_parent("parent", &super_category_id()));

        assert!(store.remove_inconsistent().is_empty());
        let cache = store.into_cache();
        assert!(cache.get(&cat("child")).unwrap().is_read_only());
    }

    #[test]
    fn orphans_are_dropped_transitively() {
        let base = LocalCache::seeded();
        let mut store = EntityStore::new(&base);
        store.put(category_with_parent("a", &cat("gone")));
        store.put(category_with_parent("b", &cat("a")));
        store.put(category_with_parent("c", &cat("b")));

        let dropped = store.remove_inconsistent();
        assert_eq!(dropped.len(), 3);
        assert_eq!(dropped[0], (cat("a"), Inconsistency::Dangling(cat("gone"))));
        assert!(store.is_empty());
    }

    #[test]
    fn category_cycles_are_dropped() {
        let base = LocalCache::seeded();
        let mut store = EntityStore::new(&base);
        store.put(category_with_parent("x", &cat("y")));
        store.put(category_with_parent("y", &cat("x")));

        let dropped = store.remove_inconsistent();
        assert!(dropped.iter().all(|(_, why)| *why == Inconsistency::CategoryCycle));
        assert_eq!(dropped.len(), 2);
    }

    #[test]
    fn overly_deep_category_chains_are_dropped() {
        let base = LocalCache::seeded();
        let mut store = EntityStore::new(&base);
        let mut parent = super_category_id();
        for level in 0..=MAX_CATEGORY_DEPTH {
            let entity = category_with_parent(&format!("l{level}"), &parent);
            parent = entity.id.clone();
            store.put(entity);
        }

        let dropped = store.remove_inconsistent();
        assert!(dropped.contains(&(parent, Inconsistency::CategoryTooDeep)));
    }

    #[test]
    fn passwords_of_dropped_users_are_forgotten() {
        let base = LocalCache::seeded();
        let mut store = EntityStore::new(&base);
        let user = Entity::new(
            EntityId::new(EntityKind::User, 1),
            EntityBody::User(User {
                username: "bob".into(),
                name: "Bob".into(),
                email: None,
                admin: false,
                groups: vec![Reference::to(&cat("missing")).unwrap()],
            }),
        )
        .unwrap();
        store.put(user.clone());
        store.put_password(user.id.clone(), "hash".into());

        store.remove_inconsistent();
        assert!(store.password(&user.id).is_none());
    }
}
