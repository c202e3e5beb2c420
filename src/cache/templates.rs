use rota_model::{Entity, EntityBody, EntityId, EntityKind, Reference, Resource};
use std::collections::BTreeMap;

use crate::cache::local::{LocalCache, template_type_id};

/// Reservation annotation that named a template before templates became resources.
pub const TEMPLATE_ANNOTATION: &str = "template";

/// Turns `template` annotations into references to template resources.
///
/// Returns the entities to persist: newly created template resources first,
/// then the rewritten reservations. Annotations naming the same template share
/// one resource, and existing template resources are reused by name.
pub fn migrate_templates(cache: &LocalCache) -> Vec<Entity> {
    let template_type = template_type_id();
    let mut by_name: BTreeMap<String, EntityId> = cache
        .iter()
        .filter_map(|e| match &e.body {
            EntityBody::Resource(r) if r.type_ref.id == template_type => {
                Some((r.name.clone(), e.id.clone()))
            }
            _ => None,
        })
        .collect();

    let mut reservations: Vec<&Entity> = cache
        .iter()
        .map(|e| &**e)
        .filter(|e| match &e.body {
            EntityBody::Reservation(r) => r.annotations.contains_key(TEMPLATE_ANNOTATION),
            _ => false,
        })
        .collect();
    reservations.sort_by(|a, b| a.id.cmp(&b.id));

    let mut created = Vec::new();
    let mut rewritten = Vec::new();
    for entity in reservations {
        let mut edited = entity.edit();
        let EntityBody::Reservation(reservation) = &mut edited.body else {
            continue;
        };
        let Some(name) = reservation.annotations.remove(TEMPLATE_ANNOTATION) else {
            continue;
        };

        if reservation.template.is_none() {
            let template_id = by_name
                .entry(name.clone())
                .or_insert_with(|| {
                    let template = Entity::create(EntityBody::Resource(Resource {
                        type_ref: Reference {
                            kind: EntityKind::DynamicType,
                            id: template_type.clone(),
                        },
                        name,
                        owner: reservation.owner.clone(),
                        attributes: BTreeMap::new(),
                        categories: Vec::new(),
                    }));
                    let id = template.id.clone();
                    created.push(template);
                    id
                })
                .clone();
            reservation.template = Some(Reference {
                kind: EntityKind::Resource,
                id: template_id,
            });
        }
        rewritten.push(edited);
    }

    created.extend(rewritten);
    created
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::local::period_type_id;
    use rota_model::Reservation;

    fn reservation(template: Option<&str>) -> Entity {
        let mut annotations = BTreeMap::new();
        if let Some(name) = template {
            annotations.insert(TEMPLATE_ANNOTATION.to_string(), name.to_string());
        }
        Entity::create(EntityBody::Reservation(Reservation {
            type_ref: Reference::to(&period_type_id()).unwrap(),
            name: "Lecture".into(),
            owner: None,
            appointments: Vec::new(),
            resources: Vec::new(),
            template: None,
            annotations,
        }))
    }

    fn template_of(entity: &Entity) -> Option<&EntityId> {
        match &entity.body {
            EntityBody::Reservation(r) => r.template.as_ref().map(|t| &t.id),
            _ => None,
        }
    }

    #[test]
    fn annotations_become_shared_template_resources() {
        let mut cache = LocalCache::seeded();
        cache.put(reservation(Some("Weekly")));
        cache.put(reservation(Some("Weekly")));
        cache.put(reservation(None));

        let migrated = migrate_templates(&cache);
        assert_eq!(migrated.len(), 3);
        let template = &migrated[0];
        assert_eq!(template.kind(), EntityKind::Resource);
        assert!(
            migrated[1..]
                .iter()
                .all(|r| template_of(r) == Some(&template.id))
        );
        assert!(migrated[1..].iter().all(|r| !r.is_read_only()));
    }

    #[test]
    fn existing_template_resources_are_reused() {
        let mut cache = LocalCache::seeded();
        let existing = Entity::create(EntityBody::Resource(Resource {
            type_ref: Reference::to(&template_type_id()).unwrap(),
            name: "Weekly".into(),
            owner: None,
            attributes: BTreeMap::new(),
            categories: Vec::new(),
        }));
        cache.put(existing.clone());
        cache.put(reservation(Some("Weekly")));

        let migrated = migrate_templates(&cache);
        assert_eq!(migrated.len(), 1);
        assert_eq!(template_of(&migrated[0]), Some(&existing.id));
    }

    #[test]
    fn nothing_to_migrate_yields_nothing() {
        let mut cache = LocalCache::seeded();
        cache.put(reservation(None));
        assert!(migrate_templates(&cache).is_empty());
    }
}
