//! In-memory side of the store: the published cache, the load-pass resolver
//! and load-time data migrations.

pub mod entity_store;
pub mod local;
pub mod templates;

pub use entity_store::{EntityStore, Inconsistency};
pub use local::{
    LocalCache, internal_entities, period_type_id, super_category_id, template_type_id,
};
pub use templates::migrate_templates;
