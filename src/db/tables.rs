use rota_model::{Entity, EntityBody, EntityKind, Reference};

/// A column of an entity table beyond the common ones.
#[derive(Debug)]
pub struct ColumnSpec {
    pub name: &'static str,
    /// Type and constraints as written in `CREATE TABLE` / `ADD COLUMN`.
    pub decl: &'static str,
    /// Derives the stored value from an entity. `None` for columns that are
    /// maintained outside of entity writes.
    pub extract: Option<fn(&Entity) -> Option<String>>,
}

/// Columns every entity table starts with.
pub const COMMON_COLUMNS: [ColumnSpec; 4] = [
    ColumnSpec {
        name: "id",
        decl: "TEXT PRIMARY KEY NOT NULL",
        extract: None,
    },
    ColumnSpec {
        name: "data",
        decl: "TEXT NOT NULL",
        extract: None,
    },
    ColumnSpec {
        name: "last_changed",
        decl: "INTEGER NULL",
        extract: None,
    },
    ColumnSpec {
        name: "last_changed_by",
        decl: "TEXT NULL",
        extract: None,
    },
];

#[derive(Debug)]
pub struct TableMapping {
    pub kind: EntityKind,
    pub table: &'static str,
    pub extra: &'static [ColumnSpec],
}

impl TableMapping {
    pub fn for_kind(kind: EntityKind) -> &'static TableMapping {
        match kind {
            EntityKind::Category => &MAPPINGS[0],
            EntityKind::DynamicType => &MAPPINGS[1],
            EntityKind::User => &MAPPINGS[2],
            EntityKind::Resource => &MAPPINGS[3],
            EntityKind::Reservation => &MAPPINGS[4],
            EntityKind::Preferences => &MAPPINGS[5],
        }
    }

    /// All mappings in load order.
    pub fn all() -> &'static [TableMapping] {
        &MAPPINGS
    }

    pub fn columns(&self) -> impl Iterator<Item = &'static ColumnSpec> {
        COMMON_COLUMNS.iter().chain(self.extra.iter())
    }

    /// Extra columns written together with the entity.
    pub fn derived(&self) -> impl Iterator<Item = (&'static str, fn(&Entity) -> Option<String>)> {
        self.extra
            .iter()
            .filter_map(|col| col.extract.map(|extract| (col.name, extract)))
    }

    pub fn create_table_sql(&self) -> String {
        let columns: Vec<String> = self
            .columns()
            .map(|col| format!("{} {}", col.name, col.decl))
            .collect();
        format!("CREATE TABLE {} ({})", self.table, columns.join(", "))
    }
}

static MAPPINGS: [TableMapping; 6] = [
    TableMapping {
        kind: EntityKind::Category,
        table: "rota_category",
        extra: &[ColumnSpec {
            name: "parent_id",
            decl: "TEXT NULL",
            extract: Some(category_parent),
        }],
    },
    TableMapping {
        kind: EntityKind::DynamicType,
        table: "rota_dynamic_type",
        extra: &[ColumnSpec {
            name: "type_key",
            decl: "TEXT NULL",
            extract: Some(type_key),
        }],
    },
    TableMapping {
        kind: EntityKind::User,
        table: "rota_user",
        extra: &[
            ColumnSpec {
                name: "username",
                decl: "TEXT NULL",
                extract: Some(username),
            },
            ColumnSpec {
                name: "password",
                decl: "TEXT NULL",
                extract: None,
            },
        ],
    },
    TableMapping {
        kind: EntityKind::Resource,
        table: "rota_resource",
        extra: &[
            ColumnSpec {
                name: "type_id",
                decl: "TEXT NULL",
                extract: Some(classified_type),
            },
            ColumnSpec {
                name: "owner_id",
                decl: "TEXT NULL",
                extract: Some(owner),
            },
        ],
    },
    TableMapping {
        kind: EntityKind::Reservation,
        table: "rota_reservation",
        extra: &[
            ColumnSpec {
                name: "type_id",
                decl: "TEXT NULL",
                extract: Some(classified_type),
            },
            ColumnSpec {
                name: "owner_id",
                decl: "TEXT NULL",
                extract: Some(owner),
            },
        ],
    },
    TableMapping {
        kind: EntityKind::Preferences,
        table: "rota_preferences",
        extra: &[ColumnSpec {
            name: "owner_id",
            decl: "TEXT NULL",
            extract: Some(owner),
        }],
    },
];

fn reference_id(reference: Option<&Reference>) -> Option<String> {
    reference.map(|r| r.id.to_string())
}

fn category_parent(entity: &Entity) -> Option<String> {
    reference_id(entity.as_category().and_then(|c| c.parent.as_ref()))
}

fn type_key(entity: &Entity) -> Option<String> {
    match &entity.body {
        EntityBody::DynamicType(t) => Some(t.key.clone()),
        _ => None,
    }
}

fn username(entity: &Entity) -> Option<String> {
    entity.as_user().map(|u| u.username.clone())
}

fn classified_type(entity: &Entity) -> Option<String> {
    match &entity.body {
        EntityBody::Resource(r) => reference_id(Some(&r.type_ref)),
        EntityBody::Reservation(r) => reference_id(Some(&r.type_ref)),
        _ => None,
    }
}

fn owner(entity: &Entity) -> Option<String> {
    match &entity.body {
        EntityBody::Resource(r) => reference_id(r.owner.as_ref()),
        EntityBody::Reservation(r) => reference_id(r.owner.as_ref()),
        EntityBody::Preferences(p) => reference_id(p.owner.as_ref()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_its_own_table() {
        for kind in EntityKind::ALL {
            assert_eq!(TableMapping::for_kind(kind).kind, kind);
        }
        let mut tables: Vec<_> = TableMapping::all().iter().map(|m| m.table).collect();
        tables.dedup();
        assert_eq!(tables.len(), EntityKind::ALL.len());
    }

    #[test]
    fn password_column_is_not_derived_from_entities() {
        let users = TableMapping::for_kind(EntityKind::User);
        let derived: Vec<_> = users.derived().map(|(name, _)| name).collect();
        assert_eq!(derived, vec!["username"]);
        assert!(users.create_table_sql().contains("password TEXT NULL"));
    }
}
