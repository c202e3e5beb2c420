use sqlx::SqliteConnection;
use std::collections::BTreeMap;
use tracing::info;

use crate::db::tables::TableMapping;
use crate::error::StoreError;

/// Bookkeeping tables shared by every process using the store:
/// - `rota_write_lock`: row locks and the global lock token
/// - `rota_last_updated`: single-row marker holding the newest commit time,
///   starting at the creation time of the store
/// - `rota_change_log`: every committed store/removal, read back by refresh
/// - `rota_preference_patch`: committed preference patches
pub const AUX_TABLES: &str = concat!(
    r"
CREATE TABLE IF NOT EXISTS rota_write_lock (
    lock_id TEXT PRIMARY KEY NOT NULL,
    acquired_at INTEGER NOT NULL -- epoch millis, database clock
);

CREATE TABLE IF NOT EXISTS rota_last_updated (
    id INTEGER PRIMARY KEY NOT NULL CHECK (id = 1),
    last_updated INTEGER NOT NULL -- epoch millis
);

INSERT OR IGNORE INTO rota_last_updated (id, last_updated) VALUES (1, ",
    db_now_millis!(),
    r");

CREATE TABLE IF NOT EXISTS rota_change_log (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id TEXT NOT NULL,
    changed_at INTEGER NOT NULL, -- epoch millis
    is_delete INTEGER NOT NULL DEFAULT 0,
    data TEXT NULL
);

CREATE INDEX IF NOT EXISTS idx_rota_change_log_changed_at ON rota_change_log(changed_at);

CREATE TABLE IF NOT EXISTS rota_preference_patch (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_key TEXT NOT NULL,
    changed_at INTEGER NOT NULL, -- epoch millis
    data TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rota_preference_patch_changed_at ON rota_preference_patch(changed_at);
"
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub decl_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

impl ColumnDef {
    pub fn is_integer(&self) -> bool {
        self.decl_type.to_ascii_uppercase().starts_with("INT")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns
            .iter()
            .find(|col| col.name.eq_ignore_ascii_case(name))
    }

    pub fn has_integer_id(&self) -> bool {
        self.column("id").is_some_and(ColumnDef::is_integer)
    }
}

/// DDL applied by [`create_or_update_if_necessary`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaChange {
    pub created_tables: Vec<&'static str>,
    /// `table.column` for every added column.
    pub added_columns: Vec<String>,
}

impl SchemaChange {
    pub fn is_empty(&self) -> bool {
        self.created_tables.is_empty() && self.added_columns.is_empty()
    }
}

type PragmaColumn = (i64, String, String, i64, Option<String>, i64);

/// Reads every table of every attached catalog, keyed by lowercase table name.
/// Tables of `main` shadow same-named tables of later catalogs.
pub async fn load_db_schema(
    conn: &mut SqliteConnection,
) -> Result<BTreeMap<String, TableDef>, StoreError> {
    let catalogs: Vec<(i64, String, Option<String>)> = sqlx::query_as("PRAGMA database_list")
        .fetch_all(&mut *conn)
        .await?;

    let mut tables = BTreeMap::new();
    for (_, catalog, _) in catalogs {
        let names: Vec<String> = sqlx::query_scalar(&format!(
            r#"SELECT name FROM "{catalog}".sqlite_master
               WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
               ORDER BY name"#
        ))
        .fetch_all(&mut *conn)
        .await?;

        for name in names {
            let key = name.to_ascii_lowercase();
            if tables.contains_key(&key) {
                continue;
            }
            let columns: Vec<PragmaColumn> =
                sqlx::query_as(&format!(r#"PRAGMA "{catalog}".table_info("{name}")"#))
                    .fetch_all(&mut *conn)
                    .await?;
            let columns = columns
                .into_iter()
                .map(|(_, name, decl_type, not_null, _, pk)| ColumnDef {
                    name,
                    decl_type,
                    not_null: not_null != 0,
                    primary_key: pk != 0,
                })
                .collect();
            tables.insert(key, TableDef { name, columns });
        }
    }
    Ok(tables)
}

/// Brings the store up to the expected layout. Only ever adds tables and
/// columns; nothing is dropped or narrowed.
pub async fn create_or_update_if_necessary(
    conn: &mut SqliteConnection,
    schema: &BTreeMap<String, TableDef>,
) -> Result<SchemaChange, StoreError> {
    let mut change = SchemaChange::default();

    for mapping in TableMapping::all() {
        let Some(existing) = schema.get(mapping.table) else {
            sqlx::query(&mapping.create_table_sql())
                .execute(&mut *conn)
                .await?;
            change.created_tables.push(mapping.table);
            continue;
        };

        for col in mapping.columns() {
            if existing.column(col.name).is_some() {
                continue;
            }
            if col.decl.contains("NOT NULL") {
                return Err(StoreError::Schema(format!(
                    "table {} lacks required column {}",
                    mapping.table, col.name
                )));
            }
            sqlx::query(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                mapping.table, col.name, col.decl
            ))
            .execute(&mut *conn)
            .await?;
            change
                .added_columns
                .push(format!("{}.{}", mapping.table, col.name));
        }
    }

    apply_aux_tables(conn).await?;

    if !change.is_empty() {
        info!(
            created = ?change.created_tables,
            added = ?change.added_columns,
            "Database schema updated"
        );
    }
    Ok(change)
}

pub async fn apply_aux_tables(conn: &mut SqliteConnection) -> Result<(), StoreError> {
    for stmt in AUX_TABLES.split(';') {
        let s = stmt.trim();
        if s.is_empty() {
            continue;
        }
        sqlx::query(s).execute(&mut *conn).await?;
    }
    Ok(())
}

/// Drops every entity table and recreates it with the current layout.
pub async fn drop_and_recreate(conn: &mut SqliteConnection) -> Result<(), StoreError> {
    for mapping in TableMapping::all() {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", mapping.table))
            .execute(&mut *conn)
            .await?;
        sqlx::query(&mapping.create_table_sql())
            .execute(&mut *conn)
            .await?;
    }
    apply_aux_tables(conn).await
}
