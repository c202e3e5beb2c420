use chrono::TimeDelta;
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::db::models::DbLockRow;
use crate::error::StoreError;

/// Lock id of the token that excludes every other writer.
pub const GLOBAL_LOCK_ID: &str = "GLOBAL_LOCK";

/// Waiting writers report progress every this many failed attempts.
const WAIT_REPORT_EVERY: u64 = 100;

const INSERT_LOCK: &str = concat!(
    "INSERT INTO rota_write_lock (lock_id, acquired_at) VALUES (?, ",
    db_now_millis!(),
    ") ON CONFLICT(lock_id) DO NOTHING"
);

/// Advisory locks stored in `rota_write_lock`, visible to every process that
/// shares the database file.
///
/// Each acquisition commits on its own pooled connection so other processes
/// see the lock rows before the guarded write starts.
#[derive(Clone)]
pub struct LockManager {
    pool: SqlitePool,
    poll_interval: Duration,
    stale_after: TimeDelta,
}

impl LockManager {
    pub fn new(pool: SqlitePool, poll_interval: Duration, stale_after: TimeDelta) -> Self {
        Self {
            pool,
            poll_interval,
            stale_after,
        }
    }

    /// Claims a row lock for every id, all or nothing. Waits while any of them
    /// is held by another writer or while the global lock exists.
    pub async fn get_locks(&self, ids: &BTreeSet<String>) -> Result<(), StoreError> {
        let mut attempts: u64 = 0;
        loop {
            if self.try_row_locks(ids).await? {
                if attempts > 0 {
                    debug!(count = ids.len(), attempts, "Row locks acquired after waiting");
                }
                return Ok(());
            }
            attempts += 1;
            if attempts % WAIT_REPORT_EVERY == 0 {
                warn!(count = ids.len(), attempts, "Still waiting for row locks");
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn try_row_locks(&self, ids: &BTreeSet<String>) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            let res = sqlx::query(INSERT_LOCK)
                .bind(id.as_str())
                .execute(&mut *tx)
                .await?;
            if res.rows_affected() == 0 {
                tx.rollback().await?;
                return Ok(false);
            }
        }

        let global: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM rota_write_lock WHERE lock_id = ?")
                .bind(GLOBAL_LOCK_ID)
                .fetch_optional(&mut *tx)
                .await?;
        if global.is_some() {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    pub async fn remove_locks(&self, ids: &BTreeSet<String>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("DELETE FROM rota_write_lock WHERE lock_id = ?")
                .bind(id.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Claims the global token, then waits until every row lock taken before
    /// the claim has been released. The token is given back if waiting fails.
    pub async fn get_global_lock(&self) -> Result<(), StoreError> {
        self.claim_global_token().await?;
        let drained = self.wait_for_row_locks().await;
        self.release_global_on_error(drained).await
    }

    async fn claim_global_token(&self) -> Result<(), StoreError> {
        let mut attempts: u64 = 0;
        loop {
            let res = sqlx::query(INSERT_LOCK)
                .bind(GLOBAL_LOCK_ID)
                .execute(&self.pool)
                .await?;
            if res.rows_affected() > 0 {
                return Ok(());
            }
            attempts += 1;
            if attempts % WAIT_REPORT_EVERY == 0 {
                warn!(attempts, "Still waiting for the global lock");
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn wait_for_row_locks(&self) -> Result<(), StoreError> {
        let mut attempts: u64 = 0;
        loop {
            let held: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM rota_write_lock WHERE lock_id <> ?")
                    .bind(GLOBAL_LOCK_ID)
                    .fetch_one(&self.pool)
                    .await?;
            if held == 0 {
                return Ok(());
            }
            attempts += 1;
            if attempts % WAIT_REPORT_EVERY == 0 {
                warn!(held, attempts, "Global lock waiting for row locks to drain");
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn release_global_on_error(
        &self,
        result: Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        if let Err(e) = &result {
            warn!(error = %e, "Giving back the global lock");
            if let Err(release) = self.remove_global_lock().await {
                warn!(error = %release, "Could not give back the global lock");
            }
        }
        result
    }

    pub async fn remove_global_lock(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM rota_write_lock WHERE lock_id = ?")
            .bind(GLOBAL_LOCK_ID)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes lock rows older than the stale age, whoever holds them.
    pub async fn cleanup_old_locks(&self) -> Result<u64, StoreError> {
        let res = sqlx::query(concat!(
            "DELETE FROM rota_write_lock WHERE acquired_at < ",
            db_now_millis!(),
            " - ?"
        ))
        .bind(self.stale_after.num_milliseconds())
        .execute(&self.pool)
        .await?;

        let removed = res.rows_affected();
        if removed > 0 {
            info!(removed, "Removed stale write locks");
        }
        Ok(removed)
    }

    pub async fn held_locks(&self) -> Result<Vec<DbLockRow>, StoreError> {
        let rows = sqlx::query_as::<_, DbLockRow>(
            "SELECT lock_id, acquired_at FROM rota_write_lock ORDER BY lock_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
