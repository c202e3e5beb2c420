use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ModelError;
use crate::id::{EntityId, EntityKind, Reference};
use crate::preferences::Preferences;

/// A persisted domain object.
///
/// Entities loaded into the shared cache are read-only; use [`Entity::edit`] to
/// obtain a mutable working copy for a new batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_changed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_changed_by: Option<EntityId>,
    #[serde(skip)]
    read_only: bool,
    pub body: EntityBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum EntityBody {
    Category(Category),
    DynamicType(DynamicType),
    Resource(Resource),
    User(User),
    Reservation(Reservation),
    Preferences(Preferences),
}

impl EntityBody {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityBody::Category(_) => EntityKind::Category,
            EntityBody::DynamicType(_) => EntityKind::DynamicType,
            EntityBody::Resource(_) => EntityKind::Resource,
            EntityBody::User(_) => EntityKind::User,
            EntityBody::Reservation(_) => EntityKind::Reservation,
            EntityBody::Preferences(_) => EntityKind::Preferences,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub parent: Option<Reference>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Resource,
    Person,
    Reservation,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDef {
    pub key: String,
    pub name: String,
    /// Category that constrains the allowed values, if any.
    #[serde(default)]
    pub constraint: Option<Reference>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicType {
    pub key: String,
    pub name: String,
    pub classification: Classification,
    #[serde(default)]
    pub attributes: Vec<AttributeDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub type_ref: Reference,
    pub name: String,
    #[serde(default)]
    pub owner: Option<Reference>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub categories: Vec<Reference>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub groups: Vec<Reference>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub type_ref: Reference,
    pub name: String,
    #[serde(default)]
    pub owner: Option<Reference>,
    #[serde(default)]
    pub appointments: Vec<Appointment>,
    #[serde(default)]
    pub resources: Vec<Reference>,
    #[serde(default)]
    pub template: Option<Reference>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl Entity {
    pub fn new(id: EntityId, body: EntityBody) -> Result<Self, ModelError> {
        let entity = Self {
            id,
            last_changed: None,
            last_changed_by: None,
            read_only: false,
            body,
        };
        entity.check_kind()?;
        Ok(entity)
    }

    /// Convenience constructor that generates a fresh id for `body`.
    pub fn create(body: EntityBody) -> Self {
        Self {
            id: EntityId::generate(body.kind()),
            last_changed: None,
            last_changed_by: None,
            read_only: false,
            body,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.body.kind()
    }

    /// The id prefix must agree with the body variant.
    pub fn check_kind(&self) -> Result<(), ModelError> {
        let expected = self.id.kind()?;
        let body = self.body.kind();
        if expected != body {
            return Err(ModelError::KindMismatch {
                id: self.id.clone(),
                expected,
                body,
            });
        }
        Ok(())
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self) {
        self.read_only = true;
    }

    /// Mutable working copy of a (possibly read-only) entity.
    pub fn edit(&self) -> Self {
        let mut copy = self.clone();
        copy.read_only = false;
        copy
    }

    /// Whether the entity records who changed it last and when.
    pub fn is_timestamped(&self) -> bool {
        !matches!(self.body, EntityBody::Category(_))
    }

    pub fn references(&self) -> Vec<&Reference> {
        match &self.body {
            EntityBody::Category(c) => c.parent.iter().collect(),
            EntityBody::DynamicType(t) => t
                .attributes
                .iter()
                .filter_map(|a| a.constraint.as_ref())
                .collect(),
            EntityBody::Resource(r) => std::iter::once(&r.type_ref)
                .chain(r.owner.iter())
                .chain(r.categories.iter())
                .collect(),
            EntityBody::User(u) => u.groups.iter().collect(),
            EntityBody::Reservation(r) => std::iter::once(&r.type_ref)
                .chain(r.owner.iter())
                .chain(r.resources.iter())
                .chain(r.template.iter())
                .collect(),
            EntityBody::Preferences(p) => p.owner.iter().collect(),
        }
    }

    pub fn as_user(&self) -> Option<&User> {
        match &self.body {
            EntityBody::User(user) => Some(user),
            _ => None,
        }
    }

    pub fn as_category(&self) -> Option<&Category> {
        match &self.body {
            EntityBody::Category(category) => Some(category),
            _ => None,
        }
    }

    pub fn as_preferences(&self) -> Option<&Preferences> {
        match &self.body {
            EntityBody::Preferences(prefs) => Some(prefs),
            _ => None,
        }
    }
}
