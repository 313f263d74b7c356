//! Error taxonomy for the chat server.
//!
//! Only `Protocol`, `Authentication` and `Transport` end a connection; every
//! other variant is answered with one `error` envelope and service continues.
use chat_protocol::{DecodeError, EncodeError};
use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::connection::ConnId;
use crate::store::StoreError;

pub const MALFORMED_MESSAGE: &str = "Malformed message.";
pub const INVALID_MESSAGE_TYPE: &str = "Invalid message type";
pub const GUEST_JOIN_DENIED: &str = "Guests cannot join channels.";
pub const PROCESSING_FAILED: &str = "Failed to process message.";

/// Rejections owned by the dispatch pipeline and domain handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("channel not found")]
    ChannelNotFound,
    #[error("not a member of the channel")]
    NotAMember,
    #[error("muted in the channel")]
    Muted,
    #[error("permission denied")]
    PermissionDenied,
    #[error("target is not a member of the channel")]
    TargetNotFound,
}

impl DomainError {
    /// Text placed in the `detail` of the error envelope sent to the client.
    pub fn detail(self) -> &'static str {
        match self {
            DomainError::ChannelNotFound => "Channel does not exist.",
            DomainError::NotAMember => "You must join this channel first.",
            DomainError::Muted => "You are muted in this channel.",
            DomainError::PermissionDenied => "You don't have permission to run this command.",
            DomainError::TargetNotFound => "User is not a member of this channel.",
        }
    }
}

/// Failures of collaborators and delivery. Logged, never shown raw to clients.
#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("encode failed: {0}")]
    Encode(#[from] EncodeError),
    #[error("send to connection {conn_id} timed out")]
    SendTimeout { conn_id: ConnId },
    #[error("connection {conn_id} outbound queue is closed")]
    SendClosed { conn_id: ConnId },
}

#[derive(Debug, Error)]
pub enum ChatError {
    /// Bad or missing handshake frame.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Malformed frame after the handshake.
    #[error("validation error: {0}")]
    Validation(#[from] DecodeError),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infrastructure(#[from] InfrastructureError),
    #[error("websocket error: {0}")]
    Transport(Box<tungstenite::Error>),
}

impl ChatError {
    /// Whether this error terminates the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChatError::Protocol(_) | ChatError::Authentication(_) | ChatError::Transport(_)
        )
    }

    /// Client-facing text for the error envelope. Infrastructure details are
    /// never exposed.
    pub fn client_detail(&self) -> &'static str {
        match self {
            ChatError::Domain(d) => d.detail(),
            ChatError::Protocol(_) | ChatError::Validation(_) => MALFORMED_MESSAGE,
            ChatError::Authentication(_) => "Authentication failed",
            ChatError::Infrastructure(_) | ChatError::Transport(_) => PROCESSING_FAILED,
        }
    }
}

impl From<tungstenite::Error> for ChatError {
    fn from(e: tungstenite::Error) -> Self {
        ChatError::Transport(Box::new(e))
    }
}

impl From<StoreError> for ChatError {
    fn from(e: StoreError) -> Self {
        ChatError::Infrastructure(InfrastructureError::Store(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_handshake_layer_errors_are_fatal() {
        assert!(ChatError::Protocol("no hello".into()).is_fatal());
        assert!(ChatError::Authentication("bad token".into()).is_fatal());
        assert!(!ChatError::Domain(DomainError::Muted).is_fatal());
        let store = ChatError::from(StoreError::Backend("disk full".into()));
        assert!(!store.is_fatal());
        assert!(store.to_string().contains("disk full"));
        assert_eq!(store.client_detail(), PROCESSING_FAILED);
    }

    #[test]
    fn domain_errors_carry_fixed_details() {
        let e = ChatError::from(DomainError::NotAMember);
        assert_eq!(e.client_detail(), "You must join this channel first.");
        assert_eq!(
            DomainError::PermissionDenied.detail(),
            "You don't have permission to run this command."
        );
    }
}
