use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::ModelError;

/// Prefix of ids that belong to built-in entities which are never persisted.
const INTERNAL_SUFFIX_PREFIX: &str = "sys.";

/// The closed set of persisted entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Category,
    DynamicType,
    Resource,
    User,
    Reservation,
    Preferences,
}

impl EntityKind {
    /// Load order: kinds earlier in this list never reference kinds later in it
    /// except through two-phase resolution.
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Category,
        EntityKind::DynamicType,
        EntityKind::User,
        EntityKind::Resource,
        EntityKind::Reservation,
        EntityKind::Preferences,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            EntityKind::Category => "category",
            EntityKind::DynamicType => "dynamictype",
            EntityKind::Resource => "resource",
            EntityKind::User => "user",
            EntityKind::Reservation => "reservation",
            EntityKind::Preferences => "preferences",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.prefix() == prefix)
    }

    /// Changes to type-defining kinds can change the meaning of many other rows.
    pub fn is_type_defining(self) -> bool {
        matches!(self, EntityKind::DynamicType)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Globally unique entity id of the form `<kind-prefix>_<suffix>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(kind: EntityKind, suffix: impl fmt::Display) -> Self {
        Self(format!("{}_{}", kind.prefix(), suffix))
    }

    /// Fresh id with a random suffix.
    pub fn generate(kind: EntityKind) -> Self {
        Self::new(kind, Uuid::new_v4().simple())
    }

    /// Maps an integer key from the pre-string-id schema onto the current id space.
    pub fn legacy(kind: EntityKind, key: i64) -> Self {
        Self::new(kind, key)
    }

    pub fn internal(kind: EntityKind, name: &str) -> Self {
        Self::new(kind, format!("{INTERNAL_SUFFIX_PREFIX}{name}"))
    }

    pub fn parse(raw: impl Into<String>) -> Result<Self, ModelError> {
        let id = Self(raw.into());
        id.kind()?;
        Ok(id)
    }

    pub fn kind(&self) -> Result<EntityKind, ModelError> {
        self.0
            .split_once('_')
            .filter(|(_, suffix)| !suffix.is_empty())
            .and_then(|(prefix, _)| EntityKind::from_prefix(prefix))
            .ok_or_else(|| ModelError::MalformedId(self.0.clone()))
    }

    pub fn suffix(&self) -> &str {
        self.0.split_once('_').map_or("", |(_, suffix)| suffix)
    }

    pub fn is_internal(&self) -> bool {
        self.suffix().starts_with(INTERNAL_SUFFIX_PREFIX)
    }

    pub fn is_type_defining(&self) -> bool {
        self.kind().is_ok_and(EntityKind::is_type_defining)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Typed pointer to another entity, resolved after all rows are loaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub kind: EntityKind,
    pub id: EntityId,
}

impl Reference {
    pub fn to(id: &EntityId) -> Result<Self, ModelError> {
        Ok(Self {
            kind: id.kind()?,
            id: id.clone(),
        })
    }

    /// A reference is well-formed when its declared kind matches the id prefix.
    pub fn is_well_formed(&self) -> bool {
        self.id.kind().is_ok_and(|kind| kind == self.kind)
    }
}
