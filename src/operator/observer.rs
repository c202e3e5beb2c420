use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::error::StoreError;

/// Database locks held by a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockScope {
    Global,
    Rows(BTreeSet<String>),
}

/// Hook invoked inside a write while its database locks are held, after every
/// statement was issued and before the commit. An error fails the write like
/// any storage error.
#[async_trait]
pub trait LockObserver: Send + Sync {
    async fn before_commit(&self, scope: &LockScope) -> Result<(), StoreError>;
}
