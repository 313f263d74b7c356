//! Message types, payload schemas and the `Envelope` wrapper.
//!
//! Every payload struct rejects unknown fields. Fields such as `user` and
//! `sender` are filled in by the server; clients may omit them.
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Largest text frame accepted by `parse`.
pub const MAX_FRAME_SIZE: usize = 256 * 1024; // 256KB

/// Numeric channel identifier as carried on the wire.
pub type ChannelId = u64;

/// Discriminant carried in the `type` field of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Hello,
    ChannelJoin,
    ChannelLeave,
    ChatSend,
    ChatReactAdd,
    ChatReactRemove,
    ChatKick,
    ChatMute,
    ChatUnmute,
    Error,
}

impl MessageType {
    pub const ALL: [MessageType; 10] = [
        MessageType::Hello,
        MessageType::ChannelJoin,
        MessageType::ChannelLeave,
        MessageType::ChatSend,
        MessageType::ChatReactAdd,
        MessageType::ChatReactRemove,
        MessageType::ChatKick,
        MessageType::ChatMute,
        MessageType::ChatUnmute,
        MessageType::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Hello => "hello",
            MessageType::ChannelJoin => "channel_join",
            MessageType::ChannelLeave => "channel_leave",
            MessageType::ChatSend => "chat_send",
            MessageType::ChatReactAdd => "chat_react_add",
            MessageType::ChatReactRemove => "chat_react_remove",
            MessageType::ChatKick => "chat_kick",
            MessageType::ChatMute => "chat_mute",
            MessageType::ChatUnmute => "chat_unmute",
            MessageType::Error => "error",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        MessageType::ALL.into_iter().find(|t| t.as_str() == tag)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public view of a user as transported inside payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserInfo {
    pub username: String,
}

impl UserInfo {
    pub fn new(username: impl Into<String>) -> Self {
        Self { username: username.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HelloPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelJoinPayload {
    pub channel_id: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelLeavePayload {
    pub channel_id: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatSendPayload {
    pub channel_id: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<UserInfo>,
    pub content: String,
}

/// Shared by `chat_react_add` and `chat_react_remove`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReactionPayload {
    pub channel_id: ChannelId,
    pub message_id: Uuid,
    pub emote: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KickPayload {
    pub channel_id: ChannelId,
    pub target: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MutePayload {
    pub channel_id: ChannelId,
    pub target: String,
    /// Seconds; `None` mutes until explicitly lifted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnmutePayload {
    pub channel_id: ChannelId,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorPayload {
    pub detail: String,
}

/// All protocol messages as a single closed enum, one variant per `type` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    Hello(HelloPayload),
    ChannelJoin(ChannelJoinPayload),
    ChannelLeave(ChannelLeavePayload),
    ChatSend(ChatSendPayload),
    ChatReactAdd(ReactionPayload),
    ChatReactRemove(ReactionPayload),
    ChatKick(KickPayload),
    ChatMute(MutePayload),
    ChatUnmute(UnmutePayload),
    Error(ErrorPayload),
}

impl ProtocolMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ProtocolMessage::Hello(_) => MessageType::Hello,
            ProtocolMessage::ChannelJoin(_) => MessageType::ChannelJoin,
            ProtocolMessage::ChannelLeave(_) => MessageType::ChannelLeave,
            ProtocolMessage::ChatSend(_) => MessageType::ChatSend,
            ProtocolMessage::ChatReactAdd(_) => MessageType::ChatReactAdd,
            ProtocolMessage::ChatReactRemove(_) => MessageType::ChatReactRemove,
            ProtocolMessage::ChatKick(_) => MessageType::ChatKick,
            ProtocolMessage::ChatMute(_) => MessageType::ChatMute,
            ProtocolMessage::ChatUnmute(_) => MessageType::ChatUnmute,
            ProtocolMessage::Error(_) => MessageType::Error,
        }
    }

    /// Channel addressed by this message, if the payload carries one.
    pub fn channel_id(&self) -> Option<ChannelId> {
        match self {
            ProtocolMessage::ChannelJoin(p) => Some(p.channel_id),
            ProtocolMessage::ChannelLeave(p) => Some(p.channel_id),
            ProtocolMessage::ChatSend(p) => Some(p.channel_id),
            ProtocolMessage::ChatReactAdd(p) | ProtocolMessage::ChatReactRemove(p) => {
                Some(p.channel_id)
            }
            ProtocolMessage::ChatKick(p) => Some(p.channel_id),
            ProtocolMessage::ChatMute(p) => Some(p.channel_id),
            ProtocolMessage::ChatUnmute(p) => Some(p.channel_id),
            ProtocolMessage::Hello(_) | ProtocolMessage::Error(_) => None,
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        ProtocolMessage::Error(ErrorPayload { detail: detail.into() })
    }
}

/// Outer wire message: discriminant, optional timestamp and correlation id,
/// and the payload selected by the discriminant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub timestamp: Option<DateTime<Utc>>,
    pub id: Option<Uuid>,
    pub message: ProtocolMessage,
}

impl Envelope {
    pub fn new(message: ProtocolMessage) -> Self {
        Self { timestamp: None, id: None, message }
    }

    /// Envelope carrying the current time and a fresh id, as sent by the server.
    pub fn stamped(message: ProtocolMessage) -> Self {
        Self {
            timestamp: Some(Utc::now()),
            id: Some(Uuid::new_v4()),
            message,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }
}

impl From<ProtocolMessage> for Envelope {
    fn from(message: ProtocolMessage) -> Self {
        Envelope::new(message)
    }
}
