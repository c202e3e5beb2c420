//! Relational persistence: connection handling, table layout, schema evolution,
//! row I/O and the advisory write locks shared by every process using a store.
//!
//! Layout:
//! - `datasource.rs`: pooled SQLite connections with retry on transient failures
//! - `tables.rs`: one table per entity kind and the columns derived from entities
//! - `schema.rs`: catalog introspection and additive DDL
//! - `legacy.rs`: one-shot conversion of the integer-id layout
//! - `io.rs`: entity rows, the change log and the last-updated marker
//! - `patch.rs`: preference patches
//! - `locks.rs`: row locks and the global lock
//! - `scope.rs`: commit/rollback handling of a single write

/// Current database time in epoch milliseconds, evaluated by SQLite so that
/// every process sharing the file agrees on one clock.
macro_rules! db_now_millis {
    () => {
        "CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER)"
    };
}

pub mod datasource;
pub mod io;
pub mod legacy;
pub mod locks;
pub mod models;
pub mod patch;
pub mod schema;
pub mod scope;
pub mod tables;

pub use datasource::Datasource;
pub use legacy::LegacyMigration;
pub use locks::{GLOBAL_LOCK_ID, LockManager};
pub use schema::{ColumnDef, SchemaChange, TableDef};
pub use scope::WriteScope;
pub use tables::{ColumnSpec, TableMapping};
