use sqlx::{Connection, Sqlite, SqliteConnection, Transaction};
use tracing::error;

use crate::error::StoreError;

/// Connection of one write: an explicit transaction, or plain autocommit for
/// stores configured without transactions.
pub enum WriteScope<'c> {
    Transaction(Transaction<'c, Sqlite>),
    Autocommit(&'c mut SqliteConnection),
}

impl<'c> WriteScope<'c> {
    pub async fn begin(
        conn: &'c mut SqliteConnection,
        transactional: bool,
    ) -> Result<Self, StoreError> {
        if transactional {
            Ok(Self::Transaction(conn.begin().await?))
        } else {
            Ok(Self::Autocommit(conn))
        }
    }

    pub fn conn(&mut self) -> &mut SqliteConnection {
        match self {
            Self::Transaction(tx) => &mut **tx,
            Self::Autocommit(conn) => &mut **conn,
        }
    }

    /// Commits a successful write. A failed one comes back as
    /// [`StoreError::Rollback`] if it was undone and as
    /// [`StoreError::NoRollback`] if part of it may have reached the store.
    pub async fn finish<T>(self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        match (self, result) {
            (Self::Transaction(tx), Ok(value)) => match tx.commit().await {
                Ok(()) => Ok(value),
                // the dropped transaction rolls back on the connection's next use
                Err(e) => Err(StoreError::Rollback(Box::new(e.into()))),
            },
            (Self::Autocommit(_), Ok(value)) => Ok(value),
            (Self::Transaction(tx), Err(e)) => match tx.rollback().await {
                Ok(()) => Err(StoreError::Rollback(Box::new(e))),
                Err(rollback_err) => {
                    error!(error = %e, rollback_error = %rollback_err, "Rollback failed");
                    Err(StoreError::NoRollback(Box::new(e)))
                }
            },
            (Self::Autocommit(_), Err(e)) => Err(StoreError::NoRollback(Box::new(e))),
        }
    }
}
