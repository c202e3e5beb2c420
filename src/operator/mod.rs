//! The synchronizing operator and its background maintenance.

pub mod observer;
pub mod sync;
pub mod tasks;

pub use observer::{LockObserver, LockScope};
pub use sync::SyncOperator;
