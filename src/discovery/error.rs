use thiserror::Error;

use crate::mqtt::ConnectionError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Device '{unique_id}' has no entity_id, discovery requires one")]
    MissingEntityId { unique_id: String },

    #[error("Unable to serialize discovery payload for '{unique_id}': {reason}")]
    Serialize { unique_id: String, reason: String },

    #[error("Unable to publish discovery for '{unique_id}': {source}")]
    Publish {
        unique_id: String,
        #[source]
        source: ConnectionError,
    },
}
