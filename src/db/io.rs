use chrono::{DateTime, TimeDelta, Utc};
use rota_model::{Entity, EntityBody, EntityId, timestamp_from_millis};
use sqlx::SqliteConnection;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::db::models::{DbChangeRow, DbEntityRow, DbPasswordRow};
use crate::db::tables::TableMapping;
use crate::error::StoreError;

pub(crate) fn decode_entity(row: DbEntityRow) -> Result<Entity, StoreError> {
    let id = EntityId::parse(row.id)?;
    let body: EntityBody = serde_json::from_str(&row.data)?;
    let mut entity = Entity::new(id, body)?;
    entity.last_changed = row.last_changed.map(timestamp_from_millis);
    entity.last_changed_by = row.last_changed_by.map(EntityId::parse).transpose()?;
    Ok(entity)
}

/// Reads every row of every entity table. Rows that can not be decoded are
/// logged and skipped.
pub async fn load_all(conn: &mut SqliteConnection) -> Result<Vec<Entity>, StoreError> {
    let mut entities = Vec::new();
    for mapping in TableMapping::all() {
        let rows = sqlx::query_as::<_, DbEntityRow>(&format!(
            "SELECT id, data, last_changed, last_changed_by FROM {} ORDER BY id",
            mapping.table
        ))
        .fetch_all(&mut *conn)
        .await?;

        for row in rows {
            let id = row.id.clone();
            match decode_entity(row) {
                Ok(entity) if entity.id.is_internal() => {
                    warn!(id = %entity.id, "Ignoring persisted copy of an internal entity");
                }
                Ok(entity) => entities.push(entity),
                Err(e) => {
                    warn!(id = %id, table = mapping.table, error = %e, "Skipping unreadable row");
                }
            }
        }
    }
    debug!(count = entities.len(), "Loaded entity rows");
    Ok(entities)
}

pub async fn load_passwords(
    conn: &mut SqliteConnection,
) -> Result<Vec<(EntityId, String)>, StoreError> {
    let rows = sqlx::query_as::<_, DbPasswordRow>(
        "SELECT id, password FROM rota_user WHERE password IS NOT NULL",
    )
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|row| -> Result<_, StoreError> { Ok((EntityId::parse(row.id)?, row.password)) })
        .collect()
}

pub async fn load_password(
    conn: &mut SqliteConnection,
    id: &EntityId,
) -> Result<Option<String>, StoreError> {
    let password: Option<Option<String>> =
        sqlx::query_scalar("SELECT password FROM rota_user WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&mut *conn)
            .await?;
    Ok(password.flatten())
}

/// Takes the SQLite write lock up front so that the marker read by
/// [`get_database_timestamp`] can not go stale before the commit.
pub async fn claim_write_slot(conn: &mut SqliteConnection) -> Result<(), StoreError> {
    sqlx::query("UPDATE rota_last_updated SET last_updated = last_updated WHERE id = 1")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Newest commit time recorded by any writer.
pub async fn get_last_updated(conn: &mut SqliteConnection) -> Result<DateTime<Utc>, StoreError> {
    let millis: Option<i64> =
        sqlx::query_scalar("SELECT last_updated FROM rota_last_updated WHERE id = 1")
            .fetch_optional(&mut *conn)
            .await?;
    Ok(timestamp_from_millis(millis.unwrap_or_default()))
}

/// Commit time for a new write: the database clock, but always strictly after
/// the last recorded commit.
pub async fn get_database_timestamp(
    conn: &mut SqliteConnection,
) -> Result<DateTime<Utc>, StoreError> {
    let row: Option<(i64, i64)> = sqlx::query_as(concat!(
        "SELECT ",
        db_now_millis!(),
        ", last_updated FROM rota_last_updated WHERE id = 1"
    ))
    .fetch_optional(&mut *conn)
    .await?;

    let millis = match row {
        Some((now, last)) => now.max(last.saturating_add(1)),
        None => {
            sqlx::query_scalar(concat!("SELECT ", db_now_millis!()))
                .fetch_one(&mut *conn)
                .await?
        }
    };
    Ok(timestamp_from_millis(millis))
}

pub async fn touch_last_updated(
    conn: &mut SqliteConnection,
    timestamp: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE rota_last_updated SET last_updated = MAX(last_updated, ?) WHERE id = 1")
        .bind(timestamp.timestamp_millis())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn upsert_sql(mapping: &TableMapping) -> String {
    let columns: Vec<&str> = ["id", "data", "last_changed", "last_changed_by"]
        .into_iter()
        .chain(mapping.derived().map(|(name, _)| name))
        .collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    let updates: Vec<String> = columns[1..]
        .iter()
        .map(|col| format!("{col} = excluded.{col}"))
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {}",
        mapping.table,
        columns.join(", "),
        placeholders,
        updates.join(", ")
    )
}

/// Upserts `entities` and records each in the change log at `timestamp`.
/// Entity timestamps are written as given.
pub async fn store(
    conn: &mut SqliteConnection,
    entities: &[Entity],
    timestamp: DateTime<Utc>,
) -> Result<(), StoreError> {
    for entity in entities {
        write_row(conn, entity).await?;
        record_change(conn, entity, timestamp).await?;
    }
    Ok(())
}

/// Upserts the table row of `entity` only.
pub async fn write_row(conn: &mut SqliteConnection, entity: &Entity) -> Result<(), StoreError> {
    let mapping = TableMapping::for_kind(entity.id.kind()?);
    let sql = upsert_sql(mapping);
    let mut query = sqlx::query(&sql)
        .bind(entity.id.as_str())
        .bind(serde_json::to_string(&entity.body)?)
        .bind(entity.last_changed.map(|t| t.timestamp_millis()))
        .bind(entity.last_changed_by.as_ref().map(ToString::to_string));
    for (_, extract) in mapping.derived() {
        query = query.bind(extract(entity));
    }
    query.execute(&mut *conn).await?;
    Ok(())
}

pub async fn find(
    conn: &mut SqliteConnection,
    id: &EntityId,
) -> Result<Option<Entity>, StoreError> {
    let mapping = TableMapping::for_kind(id.kind()?);
    let row = sqlx::query_as::<_, DbEntityRow>(&format!(
        "SELECT id, data, last_changed, last_changed_by FROM {} WHERE id = ?",
        mapping.table
    ))
    .bind(id.as_str())
    .fetch_optional(&mut *conn)
    .await?;
    row.map(decode_entity).transpose()
}

/// Appends a change-log entry for `entity` without touching its table row.
pub async fn record_change(
    conn: &mut SqliteConnection,
    entity: &Entity,
    timestamp: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO rota_change_log (entity_id, changed_at, is_delete, data) VALUES (?, ?, 0, ?)",
    )
    .bind(entity.id.as_str())
    .bind(timestamp.timestamp_millis())
    .bind(serde_json::to_string(entity)?)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn remove(
    conn: &mut SqliteConnection,
    ids: &[EntityId],
    timestamp: DateTime<Utc>,
) -> Result<(), StoreError> {
    for id in ids {
        let mapping = TableMapping::for_kind(id.kind()?);
        sqlx::query(&format!("DELETE FROM {} WHERE id = ?", mapping.table))
            .bind(id.as_str())
            .execute(&mut *conn)
            .await?;

        sqlx::query(
            "INSERT INTO rota_change_log (entity_id, changed_at, is_delete, data) VALUES (?, ?, 1, NULL)",
        )
        .bind(id.as_str())
        .bind(timestamp.timestamp_millis())
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Writes a complete data set into (empty) tables.
pub async fn create_all(
    conn: &mut SqliteConnection,
    entities: &[Entity],
    passwords: &BTreeMap<EntityId, String>,
    timestamp: DateTime<Utc>,
) -> Result<(), StoreError> {
    store(conn, entities, timestamp).await?;
    for (id, hash) in passwords {
        set_password(conn, id, Some(hash.as_str())).await?;
    }
    touch_last_updated(conn, timestamp).await
}

pub async fn all_ids(conn: &mut SqliteConnection) -> Result<Vec<EntityId>, StoreError> {
    let mut ids = Vec::new();
    for mapping in TableMapping::all() {
        let raw: Vec<String> =
            sqlx::query_scalar(&format!("SELECT id FROM {} ORDER BY id", mapping.table))
                .fetch_all(&mut *conn)
                .await?;
        for id in raw {
            ids.push(EntityId::parse(id)?);
        }
    }
    Ok(ids)
}

/// Removes every entity row, recording the removals so other processes drop
/// them on their next refresh. Returns the number of removed entities.
pub async fn remove_all(
    conn: &mut SqliteConnection,
    timestamp: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let ids = all_ids(conn).await?;
    remove(conn, &ids, timestamp).await?;
    sqlx::query("DELETE FROM rota_preference_patch")
        .execute(&mut *conn)
        .await?;
    touch_last_updated(conn, timestamp).await?;
    Ok(ids.len())
}

pub async fn set_password(
    conn: &mut SqliteConnection,
    id: &EntityId,
    hash: Option<&str>,
) -> Result<bool, StoreError> {
    let res = sqlx::query("UPDATE rota_user SET password = ? WHERE id = ?")
        .bind(hash)
        .bind(id.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Change-log entries committed in `(since, until]`, oldest first.
pub async fn update(
    conn: &mut SqliteConnection,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<DbChangeRow>, StoreError> {
    let rows = sqlx::query_as::<_, DbChangeRow>(
        r"
        SELECT entity_id, changed_at, is_delete, data
        FROM rota_change_log
        WHERE changed_at > ? AND changed_at <= ?
        ORDER BY changed_at, seq
        ",
    )
    .bind(since.timestamp_millis())
    .bind(until.timestamp_millis())
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

/// Deletes change-log entries older than `retention` by the database clock.
pub async fn prune_change_log(
    conn: &mut SqliteConnection,
    retention: TimeDelta,
) -> Result<u64, StoreError> {
    let res = sqlx::query(concat!(
        "DELETE FROM rota_change_log WHERE changed_at < ",
        db_now_millis!(),
        " - ?"
    ))
    .bind(retention.num_milliseconds())
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected())
}

pub async fn is_empty(conn: &mut SqliteConnection) -> Result<bool, StoreError> {
    for mapping in TableMapping::all() {
        let any: bool = sqlx::query_scalar(&format!(
            "SELECT EXISTS(SELECT 1 FROM {})",
            mapping.table
        ))
        .fetch_one(&mut *conn)
        .await?;
        if any {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rota_model::EntityKind;

    #[test]
    fn upsert_keeps_password_column_untouched() {
        let sql = upsert_sql(TableMapping::for_kind(EntityKind::User));
        assert!(sql.contains("username = excluded.username"));
        assert!(!sql.contains("password"));
        assert_eq!(sql.matches('?').count(), 5);
    }

    #[test]
    fn rows_decode_with_timestamps() {
        let row = DbEntityRow {
            id: "category_1".into(),
            data: r#"{"kind":"category","data":{"key":"a","name":"A"}}"#.into(),
            last_changed: Some(1_000),
            last_changed_by: Some("user_7".into()),
        };
        let entity = decode_entity(row).unwrap();
        assert_eq!(entity.kind(), EntityKind::Category);
        assert_eq!(entity.last_changed, Some(timestamp_from_millis(1_000)));
        assert_eq!(entity.last_changed_by.unwrap().as_str(), "user_7");
    }

    #[test]
    fn rows_with_mismatched_kind_are_rejected() {
        let row = DbEntityRow {
            id: "resource_1".into(),
            data: r#"{"kind":"category","data":{"key":"a","name":"A"}}"#.into(),
            last_changed: None,
            last_changed_by: None,
        };
        assert!(matches!(
            decode_entity(row),
            Err(StoreError::Model(_))
        ));
    }
}
