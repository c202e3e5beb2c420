use backon::{ExponentialBuilder, Retryable};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::warn;

use crate::config::StoreConfig;
use crate::error::{IsRetryable, StoreError};

/// Pooled access to the backing SQLite file.
pub struct Datasource {
    pool: SqlitePool,
    url: String,
    connect_retries: usize,
    use_transactions: bool,
}

impl Datasource {
    /// Builds a lazy pool; nothing is opened until the first connection is requested.
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let connect_opts = SqliteConnectOptions::from_str(&config.database_url)?
            .create_if_missing(true)
            .busy_timeout(config.busy_timeout())
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_lazy_with(connect_opts);

        Ok(Self {
            pool,
            url: config.database_url.clone(),
            connect_retries: config.connect_retries,
            use_transactions: config.use_transactions,
        })
    }

    /// Checks out a connection, retrying transient failures `connect_retries`
    /// more times before giving up.
    pub async fn connection(&self) -> Result<PoolConnection<Sqlite>, StoreError> {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;
        let pool = &self.pool;
        let policy = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1))
            .with_max_times(self.connect_retries)
            .with_jitter();

        (|| async move {
            attempts.fetch_add(1, Ordering::Relaxed);
            pool.acquire().await
        })
        .retry(policy)
        .when(|err: &sqlx::Error| err.is_retryable())
        .notify(|err: &sqlx::Error, delay: Duration| {
            warn!(
                url = %self.url,
                error = %err,
                ?delay,
                "Database connection failed (will retry)"
            );
        })
        .await
        .map_err(|source| StoreError::ConnectionAborted {
            attempts: counter.load(Ordering::Relaxed),
            source,
        })
    }

    pub fn name(&self) -> &str {
        &self.url
    }

    pub fn supports_transactions(&self) -> bool {
        self.use_transactions
    }

    /// Product and version line logged when data is loaded.
    pub async fn banner(&self) -> Result<String, StoreError> {
        let mut conn = self.connection().await?;
        let version: String = sqlx::query_scalar("SELECT sqlite_version()")
            .fetch_one(&mut *conn)
            .await?;
        Ok(format!("SQLite {version}"))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
