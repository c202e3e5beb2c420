mod store;

pub use store::StoreError;

pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

/// Primary SQLite result codes that signal contention rather than a broken
/// statement (`SQLITE_BUSY`, `SQLITE_LOCKED`).
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

impl IsRetryable for sqlx::Error {
    fn is_retryable(&self) -> bool {
        match self {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
            sqlx::Error::Database(db) => db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED)),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeouts_are_retryable() {
        assert!(sqlx::Error::PoolTimedOut.is_retryable());
        assert!(!sqlx::Error::RowNotFound.is_retryable());
        assert!(!sqlx::Error::PoolClosed.is_retryable());
    }
}
