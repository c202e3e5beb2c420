use chrono::{DateTime, Utc};
use rota_model::EntityId;
use std::sync::Arc;

/// One recorded change of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    id: EntityId,
    timestamp: DateTime<Utc>,
    /// Serialized entity; `None` marks a deletion.
    payload: Option<Arc<str>>,
}

impl HistoryEntry {
    pub fn changed(id: EntityId, timestamp: DateTime<Utc>, payload: Arc<str>) -> Self {
        Self {
            id,
            timestamp,
            payload: Some(payload),
        }
    }

    pub fn deleted(id: EntityId, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            timestamp,
            payload: None,
        }
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn is_delete(&self) -> bool {
        self.payload.is_none()
    }

    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }
}
