use rota_model::EntityId;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum HistoryError {
    #[error("Entity {0} was deleted at this point in time")]
    Deleted(EntityId),

    #[error("History entry for {id} holds {found}")]
    IdMismatch { id: EntityId, found: EntityId },

    #[error("History entry for {id} could not be decoded: {source}")]
    Decode {
        id: EntityId,
        #[source]
        source: serde_json::Error,
    },

    #[error("Entity could not be encoded for history: {0}")]
    Encode(#[from] serde_json::Error),
}
