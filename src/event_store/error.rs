//! Event Store Errors

use crate::domain::error::CoreError;
use crate::id::AggregateId;

#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Stored event for aggregate {0} carries an unparseable id")]
    MalformedId(AggregateId),
}

impl From<EventStoreError> for CoreError {
    fn from(err: EventStoreError) -> Self {
        CoreError::Persistence(err.to_string())
    }
}
