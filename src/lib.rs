pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod operator;
pub mod snapshot;

pub use cache::LocalCache;
pub use config::{Config, StoreConfig};
pub use error::{IsRetryable, StoreError};
pub use operator::{LockObserver, LockScope, SyncOperator};
pub use snapshot::Snapshot;
