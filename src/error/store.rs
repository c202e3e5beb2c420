use rota_history::HistoryError;
use rota_model::{EntityId, ModelError};
use thiserror::Error as ThisError;

use super::IsRetryable;

#[derive(Debug, ThisError)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("Could not open a database connection after {attempts} attempts: {source}")]
    ConnectionAborted {
        attempts: usize,
        #[source]
        source: sqlx::Error,
    },

    #[error("Write failed and was rolled back: {0}")]
    Rollback(#[source] Box<StoreError>),

    #[error("Write failed and could not be rolled back; operator disconnected: {0}")]
    NoRollback(#[source] Box<StoreError>),

    #[error("Operator is not connected")]
    NotConnected,

    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("{id} references {target}, which does not exist")]
    DanglingReference { id: EntityId, target: EntityId },

    #[error("{id} can not be removed while {by} references it")]
    StillReferenced { id: EntityId, by: EntityId },

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Unsupported snapshot format version {0}")]
    SnapshotVersion(String),

    #[error("Rejected by lock observer: {0}")]
    Observer(String),
}

impl IsRetryable for StoreError {
    fn is_retryable(&self) -> bool {
        match self {
            StoreError::Database(err) => err.is_retryable(),
            StoreError::Rollback(inner) => inner.is_retryable(),
            _ => false,
        }
    }
}
