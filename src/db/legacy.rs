use rota_model::{Entity, EntityBody, EntityId, EntityKind, Preferences};
use serde_json::{Value, json};
use sqlx::{Connection, SqliteConnection};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{info, warn};

use crate::db::io;
use crate::db::schema::{self, TableDef};
use crate::db::tables::TableMapping;
use crate::error::StoreError;
use crate::snapshot::Snapshot;

/// One-shot conversion of stores written with integer primary keys and
/// integer references into the typed-id layout.
pub struct LegacyMigration<'a> {
    export_path: &'a Path,
}

impl<'a> LegacyMigration<'a> {
    pub fn new(export_path: &'a Path) -> Self {
        Self { export_path }
    }

    /// A store is legacy when every entity table exists and still has an
    /// integer `id` column. Partially converted stores are left alone.
    pub fn detect(schema: &BTreeMap<String, TableDef>) -> bool {
        let unpatched = TableMapping::all()
            .iter()
            .filter(|mapping| {
                schema
                    .get(mapping.table)
                    .is_some_and(TableDef::has_integer_id)
            })
            .count();
        unpatched == TableMapping::all().len()
    }

    /// Exports the legacy rows, rebuilds the tables and imports the converted
    /// data in one transaction. The export stays on disk as a backup.
    pub async fn run(
        &self,
        conn: &mut SqliteConnection,
        schema: &BTreeMap<String, TableDef>,
    ) -> Result<Snapshot, StoreError> {
        warn!(
            export = %self.export_path.display(),
            "Legacy database layout detected, converting"
        );

        let mut entities = Vec::new();
        for mapping in TableMapping::all() {
            let rows: Vec<(i64, String)> =
                sqlx::query_as(&format!("SELECT id, data FROM {} ORDER BY id", mapping.table))
                    .fetch_all(&mut *conn)
                    .await?;
            for (key, data) in rows {
                match convert_row(mapping.kind, key, &data) {
                    Ok(entity) => entities.push(entity),
                    Err(e) => warn!(
                        table = mapping.table,
                        key,
                        error = %e,
                        "Dropping unconvertible legacy row"
                    ),
                }
            }
        }

        let mut passwords = BTreeMap::new();
        let has_passwords = schema
            .get(TableMapping::for_kind(EntityKind::User).table)
            .and_then(|table| table.column("password"))
            .is_some();
        if has_passwords {
            let rows: Vec<(i64, String)> =
                sqlx::query_as("SELECT id, password FROM rota_user WHERE password IS NOT NULL")
                    .fetch_all(&mut *conn)
                    .await?;
            for (key, hash) in rows {
                passwords.insert(EntityId::legacy(EntityKind::User, key), hash);
            }
        }

        let snapshot = Snapshot::new(entities, passwords);
        snapshot.write(self.export_path).await?;
        info!(
            path = %self.export_path.display(),
            count = snapshot.entities.len(),
            "Exported legacy data"
        );

        let mut tx = conn.begin().await?;
        schema::drop_and_recreate(&mut tx).await?;
        let timestamp = io::get_database_timestamp(&mut tx).await?;
        io::create_all(&mut tx, &snapshot.entities, &snapshot.passwords, timestamp).await?;
        tx.commit().await?;

        info!(count = snapshot.entities.len(), "Legacy data converted");
        Ok(snapshot)
    }
}

fn convert_row(kind: EntityKind, key: i64, data: &str) -> Result<Entity, StoreError> {
    let mut value: Value = serde_json::from_str(data)?;
    rewrite_legacy_references(&mut value);
    let body: EntityBody = serde_json::from_value(json!({ "kind": kind, "data": value }))?;

    let id = match &body {
        // Preferences are addressed through their owner.
        EntityBody::Preferences(prefs) => {
            Preferences::id_for(prefs.owner.as_ref().map(|owner| &owner.id))
        }
        _ => EntityId::legacy(kind, key),
    };
    Ok(Entity::new(id, body)?)
}

/// Replaces every `{"kind": k, "id": <integer>}` reference with the typed id
/// the same entity gets after conversion.
fn rewrite_legacy_references(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let keys: BTreeSet<&str> = map.keys().map(String::as_str).collect();
            let is_reference = keys == BTreeSet::from(["id", "kind"]);
            let legacy = is_reference
                .then(|| {
                    let kind = serde_json::from_value::<EntityKind>(map["kind"].clone()).ok()?;
                    let key = map["id"].as_i64()?;
                    Some(EntityId::legacy(kind, key))
                })
                .flatten();
            match legacy {
                Some(id) => {
                    map.insert("id".to_string(), Value::String(id.into_string()));
                }
                None => map.values_mut().for_each(rewrite_legacy_references),
            }
        }
        Value::Array(items) => items.iter_mut().for_each(rewrite_legacy_references),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::ColumnDef;

    fn table(name: &str, id_type: &str) -> TableDef {
        TableDef {
            name: name.to_string(),
            columns: vec![ColumnDef {
                name: "id".to_string(),
                decl_type: id_type.to_string(),
                not_null: true,
                primary_key: true,
            }],
        }
    }

    fn schema_with(id_type: &str) -> BTreeMap<String, TableDef> {
        TableMapping::all()
            .iter()
            .map(|m| (m.table.to_string(), table(m.table, id_type)))
            .collect()
    }

    #[test]
    fn integer_ids_in_every_table_are_legacy() {
        assert!(LegacyMigration::detect(&schema_with("INTEGER")));
        assert!(!LegacyMigration::detect(&schema_with("TEXT")));
    }

    #[test]
    fn partially_converted_stores_are_not_legacy() {
        let mut schema = schema_with("INTEGER");
        schema.insert("rota_user".into(), table("rota_user", "TEXT"));
        assert!(!LegacyMigration::detect(&schema));
        assert!(!LegacyMigration::detect(&BTreeMap::new()));
    }

    #[test]
    fn nested_references_are_rewritten() {
        let data = r#"{
            "type_ref": {"kind": "dynamic_type", "id": 3},
            "name": "Room",
            "owner": {"kind": "user", "id": 9},
            "categories": [{"kind": "category", "id": 12}]
        }"#;
        let entity = convert_row(EntityKind::Resource, 5, data).unwrap();
        assert_eq!(entity.id.as_str(), "resource_5");
        let ids: Vec<&str> = entity.references().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["dynamictype_3", "user_9", "category_12"]);
    }

    #[test]
    fn preferences_are_keyed_by_owner() {
        let data = r#"{"owner": {"kind": "user", "id": 4}, "entries": {"zoom": 2}}"#;
        let entity = convert_row(EntityKind::Preferences, 77, data).unwrap();
        assert_eq!(entity.id.as_str(), "preferences_4");

        let system = convert_row(EntityKind::Preferences, 1, r#"{"entries": {}}"#).unwrap();
        assert_eq!(system.id.as_str(), "preferences_0");
    }
}
