use thiserror::Error;

use crate::protocol::MessageType;

/// Failure to turn a raw text frame into an `Envelope`.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("missing or non-string `type` discriminant")]
    MissingType,
    #[error("frame size {size} exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },
    #[error("invalid `{field}` field: {source}")]
    InvalidField {
        field: &'static str,
        source: serde_json::Error,
    },
    #[error("invalid `{kind}` payload: {source}")]
    InvalidPayload {
        kind: MessageType,
        source: serde_json::Error,
    },
    #[error("message type `{0}` is not registered")]
    Unregistered(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("message type `{0}` already registered")]
    AlreadyRegistered(MessageType),
}

/// Failure to serialize an `Envelope`.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message size {size} exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },
}
