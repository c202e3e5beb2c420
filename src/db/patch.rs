use chrono::{DateTime, TimeDelta, Utc};
use rota_model::{Entity, EntityBody, PreferencePatch, Preferences, timestamp_from_millis};
use sqlx::SqliteConnection;
use tracing::debug;

use crate::db::io;
use crate::db::models::DbPatchRow;
use crate::error::StoreError;

/// Merges each patch into its preferences row (creating the row on first use)
/// and appends it to the patch log. Patched rows are not written to the change
/// log; readers pick patches up through [`get_patches`].
pub async fn store_patches(
    conn: &mut SqliteConnection,
    patches: &[PreferencePatch],
    timestamp: DateTime<Utc>,
) -> Result<(), StoreError> {
    for patch in patches {
        if patch.is_empty() {
            continue;
        }
        let id = patch.preferences_id();
        let mut entity = match io::find(conn, &id).await? {
            Some(existing) => existing,
            None => Entity::new(
                id.clone(),
                EntityBody::Preferences(Preferences::for_owner(patch.user_id.as_ref())?),
            )?,
        };
        if let EntityBody::Preferences(prefs) = &mut entity.body {
            patch.apply_to(prefs);
        }
        entity.last_changed = Some(timestamp);
        entity.last_changed_by.clone_from(&patch.user_id);
        io::write_row(conn, &entity).await?;

        let mut logged = patch.clone();
        logged.changed_at = None;
        sqlx::query(
            "INSERT INTO rota_preference_patch (owner_key, changed_at, data) VALUES (?, ?, ?)",
        )
        .bind(patch.lock_id())
        .bind(timestamp.timestamp_millis())
        .bind(serde_json::to_string(&logged)?)
        .execute(&mut *conn)
        .await?;
        debug!(id = %id, "Stored preference patch");
    }
    Ok(())
}

/// Patches committed in `(since, until]`, oldest first, with `changed_at` set.
pub async fn get_patches(
    conn: &mut SqliteConnection,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<PreferencePatch>, StoreError> {
    let rows = sqlx::query_as::<_, DbPatchRow>(
        r"
        SELECT owner_key, changed_at, data
        FROM rota_preference_patch
        WHERE changed_at > ? AND changed_at <= ?
        ORDER BY changed_at, seq
        ",
    )
    .bind(since.timestamp_millis())
    .bind(until.timestamp_millis())
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|row| -> Result<_, StoreError> {
            let mut patch: PreferencePatch = serde_json::from_str(&row.data)?;
            patch.changed_at = Some(timestamp_from_millis(row.changed_at));
            Ok(patch)
        })
        .collect()
}

pub async fn prune_patches(
    conn: &mut SqliteConnection,
    retention: TimeDelta,
) -> Result<u64, StoreError> {
    let res = sqlx::query(concat!(
        "DELETE FROM rota_preference_patch WHERE changed_at < ",
        db_now_millis!(),
        " - ?"
    ))
    .bind(retention.num_milliseconds())
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected())
}
