//! Append-only, per-entity change log with point-in-time lookup.
//!
//! Entries for one id are kept sorted by timestamp. A lookup "as of T" yields
//! the newest entry whose timestamp is not after T; a delete entry acts as the
//! delete sentinel.

mod entry;
mod error;
mod history;

pub use entry::HistoryEntry;
pub use error::HistoryError;
pub use history::{DEFAULT_MEMO_CAPACITY, EntityHistory};
