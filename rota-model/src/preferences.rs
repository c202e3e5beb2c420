use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::ModelError;
use crate::id::{EntityId, EntityKind, Reference};

/// Id of the preferences entity that is not owned by any user.
pub const SYSTEM_PREFERENCES_ID: &str = "preferences_0";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    /// `None` for the system preferences.
    #[serde(default)]
    pub owner: Option<Reference>,
    #[serde(default)]
    pub entries: BTreeMap<String, Value>,
}

impl Preferences {
    /// Preferences ids are derived from the owning user so patches can address
    /// them without a lookup.
    pub fn id_for(owner: Option<&EntityId>) -> EntityId {
        match owner {
            Some(user) => EntityId::new(EntityKind::Preferences, user.suffix()),
            None => EntityId::new(EntityKind::Preferences, 0),
        }
    }

    pub fn for_owner(owner: Option<&EntityId>) -> Result<Self, ModelError> {
        Ok(Self {
            owner: owner.map(Reference::to).transpose()?,
            entries: BTreeMap::new(),
        })
    }
}

/// Partial update of a preferences entity, applied by merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreferencePatch {
    /// `None` addresses the system preferences.
    #[serde(default)]
    pub user_id: Option<EntityId>,
    #[serde(default)]
    pub put: BTreeMap<String, Value>,
    #[serde(default)]
    pub remove: BTreeSet<String>,
    /// Commit timestamp, filled in when the patch is read back from the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_at: Option<DateTime<Utc>>,
}

impl PreferencePatch {
    pub fn for_user(user_id: Option<EntityId>) -> Self {
        Self {
            user_id,
            ..Default::default()
        }
    }

    pub fn put(mut self, key: impl Into<String>, value: Value) -> Self {
        let key = key.into();
        self.remove.remove(&key);
        self.put.insert(key, value);
        self
    }

    pub fn remove(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.put.remove(&key);
        self.remove.insert(key);
        self
    }

    /// Id of the row lock that serializes writers of the same preferences.
    pub fn lock_id(&self) -> String {
        self.user_id
            .as_ref()
            .map_or_else(|| SYSTEM_PREFERENCES_ID.to_string(), ToString::to_string)
    }

    pub fn preferences_id(&self) -> EntityId {
        Preferences::id_for(self.user_id.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.put.is_empty() && self.remove.is_empty()
    }

    /// Removals apply before puts so a key named in both ends up set.
    pub fn apply_to(&self, prefs: &mut Preferences) {
        for key in &self.remove {
            prefs.entries.remove(key);
        }
        for (key, value) in &self.put {
            prefs.entries.insert(key.clone(), value.clone());
        }
    }
}
