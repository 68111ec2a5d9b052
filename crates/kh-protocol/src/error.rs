//! Protocol-level error taxonomy (§7: `InvalidInput` maps here).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("payload did not match schema for {message_type}: {source}")]
    SchemaMismatch {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
