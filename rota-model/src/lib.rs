pub mod entity;
pub mod error;
pub mod event;
pub mod id;
pub mod preferences;

pub use entity::{
    Appointment, AttributeDef, Category, Classification, DynamicType, Entity, EntityBody,
    Reservation, Resource, User,
};
pub use error::ModelError;
pub use event::UpdateEvent;
pub use id::{EntityId, EntityKind, Reference};
pub use preferences::{PreferencePatch, Preferences, SYSTEM_PREFERENCES_ID};

use chrono::{DateTime, Utc};

/// Converts a stored millisecond value into a UTC timestamp.
///
/// Out-of-range values clamp to the Unix epoch.
pub fn timestamp_from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::UNIX_EPOCH)
}
