use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Backing store and synchronization settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Database URL for SQLite.
    /// TOML: `store.database_url`. Default: `sqlite://rota.db`.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Maximum pooled connections.
    /// TOML: `store.max_connections`. Default: `4`.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// SQLite busy timeout in seconds.
    /// TOML: `store.busy_timeout_secs`. Default: `5`.
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,

    /// Additional attempts after a transient connection failure.
    /// TOML: `store.connect_retries`. Default: `2`.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: usize,

    /// Delay between two runs of the background refresh.
    /// TOML: `store.refresh_interval_secs`. Default: `15`.
    #[serde(default = "default_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Delay between two stale-lock sweeps.
    /// TOML: `store.cleanup_interval_secs`. Default: `15`.
    #[serde(default = "default_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Age after which a lock row counts as orphaned.
    /// TOML: `store.stale_lock_secs`. Default: `60`.
    #[serde(default = "default_stale_lock_secs")]
    pub stale_lock_secs: u64,

    /// Poll interval while waiting for a lock held by another writer.
    /// TOML: `store.lock_poll_millis`. Default: `50`.
    #[serde(default = "default_lock_poll_millis")]
    pub lock_poll_millis: u64,

    /// Retention window of the change history.
    /// TOML: `store.history_duration_secs`. Default: `3600`.
    #[serde(default = "default_history_duration_secs")]
    pub history_duration_secs: u64,

    /// Write through explicit transactions. Disable only for stores without
    /// rollback support; failed writes then force a disconnect.
    /// TOML: `store.use_transactions`. Default: `true`.
    #[serde(default = "default_use_transactions")]
    pub use_transactions: bool,

    /// Where the one-shot legacy schema migration writes its export.
    /// TOML: `store.legacy_export_path`. Default: `rota-legacy-export.json`.
    #[serde(default = "default_legacy_export_path")]
    pub legacy_export_path: PathBuf,

    /// Snapshot imported when the store is found empty.
    /// TOML: `store.import_path`. Default: unset.
    #[serde(default)]
    pub import_path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            max_connections: default_max_connections(),
            busy_timeout_secs: default_busy_timeout_secs(),
            connect_retries: default_connect_retries(),
            refresh_interval_secs: default_interval_secs(),
            cleanup_interval_secs: default_interval_secs(),
            stale_lock_secs: default_stale_lock_secs(),
            lock_poll_millis: default_lock_poll_millis(),
            history_duration_secs: default_history_duration_secs(),
            use_transactions: default_use_transactions(),
            legacy_export_path: default_legacy_export_path(),
            import_path: None,
        }
    }
}

impl StoreConfig {
    pub fn with_database_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn stale_lock_after(&self) -> TimeDelta {
        seconds_delta(self.stale_lock_secs)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_millis.max(1))
    }

    pub fn history_duration(&self) -> TimeDelta {
        seconds_delta(self.history_duration_secs)
    }

    /// How long change-log and patch-log rows are kept: twice the history
    /// window, so a refresh that passed the window check finds every entry.
    pub fn log_retention(&self) -> TimeDelta {
        self.history_duration()
            .checked_mul(2)
            .unwrap_or(TimeDelta::MAX)
    }
}

fn seconds_delta(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

fn default_database_url() -> String {
    "sqlite://rota.db".to_string()
}

fn default_max_connections() -> u32 {
    4
}

fn default_busy_timeout_secs() -> u64 {
    5
}

fn default_connect_retries() -> usize {
    2
}

fn default_interval_secs() -> u64 {
    15
}

fn default_stale_lock_secs() -> u64 {
    60
}

fn default_lock_poll_millis() -> u64 {
    50
}

fn default_history_duration_secs() -> u64 {
    3600
}

fn default_use_transactions() -> bool {
    true
}

fn default_legacy_export_path() -> PathBuf {
    PathBuf::from("rota-legacy-export.json")
}
