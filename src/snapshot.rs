//! Neutral JSON import/export format.

use chrono::{DateTime, Utc};
use rota_model::{Entity, EntityId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::StoreError;

pub const FORMAT_VERSION: &str = "1.0";

/// Versions [`Snapshot::read`] and `save_data` accept.
pub const SUPPORTED_VERSIONS: [&str; 2] = ["1.0", "1.1"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub format_version: String,
    pub exported_at: DateTime<Utc>,
    pub entities: Vec<Entity>,
    /// Password hashes by user id.
    #[serde(default)]
    pub passwords: BTreeMap<EntityId, String>,
}

impl Snapshot {
    pub fn new(entities: Vec<Entity>, passwords: BTreeMap<EntityId, String>) -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            exported_at: Utc::now(),
            entities,
            passwords,
        }
    }

    pub fn check_version(version: &str) -> Result<(), StoreError> {
        if SUPPORTED_VERSIONS.contains(&version) {
            Ok(())
        } else {
            Err(StoreError::SnapshotVersion(version.to_string()))
        }
    }

    pub async fn read(path: &Path) -> Result<Self, StoreError> {
        let raw = tokio::fs::read(path).await?;
        let snapshot: Snapshot = serde_json::from_slice(&raw)?;
        Self::check_version(&snapshot.format_version)?;
        Ok(snapshot)
    }

    /// Writes through a sibling temp file so a crash never leaves a truncated export.
    pub async fn write(&self, path: &Path) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(self)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_versions_are_rejected() {
        assert!(Snapshot::check_version(FORMAT_VERSION).is_ok());
        assert!(matches!(
            Snapshot::check_version("0.9"),
            Err(StoreError::SnapshotVersion(v)) if v == "0.9"
        ));
    }
}
