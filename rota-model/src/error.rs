use thiserror::Error as ThisError;

use crate::id::{EntityId, EntityKind};

#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum ModelError {
    #[error("Malformed entity id: {0}")]
    MalformedId(String),

    #[error("Entity {id} has a {body:?} body but its id encodes {expected:?}")]
    KindMismatch {
        id: EntityId,
        expected: EntityKind,
        body: EntityKind,
    },

    #[error("Entity {0} is both stored and removed in the same batch")]
    StoreAndRemove(EntityId),

    #[error("Entity {0} is stored twice in the same batch")]
    DuplicateStore(EntityId),

    #[error("Internal entity {0} can not be changed")]
    InternalEntity(EntityId),
}
