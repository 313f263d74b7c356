//! Discriminant → payload schema table.
//!
//! The table is closed and flat: each registered `type` tag maps to exactly
//! one decoder that turns the raw `payload` object into a `ProtocolMessage`
//! variant. `MessageRegistry::global()` is populated once with every
//! `MessageType` and is read-only afterwards.
use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{DecodeError, RegistryError};
use crate::protocol::*;

/// Turns a raw payload value into its typed message variant.
pub type PayloadDecoder = fn(Value) -> Result<ProtocolMessage, serde_json::Error>;

/// A frame whose discriminant resolved to a registered type but whose payload
/// has not been validated yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub message_type: MessageType,
    pub timestamp: Option<DateTime<Utc>>,
    pub id: Option<Uuid>,
    pub payload: Value,
}

#[derive(Default)]
pub struct MessageRegistry {
    decoders: HashMap<&'static str, (MessageType, PayloadDecoder)>,
}

impl MessageRegistry {
    /// An empty registry. Frames of any type are reported as no-match.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every message type of the protocol.
    pub fn standard() -> Self {
        let mut reg = Self::new();
        for ty in MessageType::ALL {
            // ALL has no duplicates, so registration cannot collide here
            let _ = reg.register(ty, standard_decoder(ty));
        }
        reg
    }

    /// Process-wide registry built on first use.
    pub fn global() -> &'static MessageRegistry {
        static GLOBAL: OnceLock<MessageRegistry> = OnceLock::new();
        GLOBAL.get_or_init(MessageRegistry::standard)
    }

    pub fn register(
        &mut self,
        message_type: MessageType,
        decoder: PayloadDecoder,
    ) -> Result<(), RegistryError> {
        let tag = message_type.as_str();
        if self.decoders.contains_key(tag) {
            return Err(RegistryError::AlreadyRegistered(message_type));
        }
        self.decoders.insert(tag, (message_type, decoder));
        Ok(())
    }

    pub fn lookup(&self, tag: &str) -> Option<MessageType> {
        self.decoders.get(tag).map(|(ty, _)| *ty)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Read the discriminant of `raw` without validating the payload.
    ///
    /// Returns `Ok(None)` when the frame is a JSON object whose `type` is not
    /// registered; the caller answers with a protocol-level error instead of
    /// tearing down the session.
    pub fn parse_frame(&self, raw: &str) -> Result<Option<Frame>, DecodeError> {
        if raw.len() > MAX_FRAME_SIZE {
            return Err(DecodeError::TooLarge { size: raw.len(), max: MAX_FRAME_SIZE });
        }
        let value: Value = serde_json::from_str(raw)?;
        let Value::Object(mut obj) = value else {
            return Err(DecodeError::NotAnObject);
        };
        let Some(tag) = obj.get("type").and_then(Value::as_str) else {
            return Err(DecodeError::MissingType);
        };
        let Some(message_type) = self.lookup(tag) else {
            return Ok(None);
        };

        let timestamp = take_field::<DateTime<Utc>>(&mut obj, "timestamp")?;
        let id = match take_field::<Uuid>(&mut obj, "id")? {
            Some(id) => Some(id),
            None => take_field::<Uuid>(&mut obj, "correlation_id")?,
        };
        let payload = obj.remove("payload").unwrap_or_else(|| Value::Object(Map::new()));

        Ok(Some(Frame { message_type, timestamp, id, payload }))
    }

    /// Validate a frame's payload against the schema registered for its type.
    pub fn decode_frame(&self, frame: Frame) -> Result<Envelope, DecodeError> {
        let Frame { message_type, timestamp, id, payload } = frame;
        let Some((_, decoder)) = self.decoders.get(message_type.as_str()) else {
            return Err(DecodeError::Unregistered(message_type.as_str().to_string()));
        };
        let message = decoder(payload)
            .map_err(|source| DecodeError::InvalidPayload { kind: message_type, source })?;
        Ok(Envelope { timestamp, id, message })
    }

    /// `parse_frame` followed by `decode_frame`.
    pub fn parse(&self, raw: &str) -> Result<Option<Envelope>, DecodeError> {
        match self.parse_frame(raw)? {
            Some(frame) => self.decode_frame(frame).map(Some),
            None => Ok(None),
        }
    }
}

fn take_field<T: serde::de::DeserializeOwned>(
    obj: &mut Map<String, Value>,
    key: &'static str,
) -> Result<Option<T>, DecodeError> {
    match obj.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v)
            .map(Some)
            .map_err(|source| DecodeError::InvalidField { field: key, source }),
    }
}

fn standard_decoder(ty: MessageType) -> PayloadDecoder {
    match ty {
        MessageType::Hello => |v| serde_json::from_value(v).map(ProtocolMessage::Hello),
        MessageType::ChannelJoin => |v| serde_json::from_value(v).map(ProtocolMessage::ChannelJoin),
        MessageType::ChannelLeave => {
            |v| serde_json::from_value(v).map(ProtocolMessage::ChannelLeave)
        }
        MessageType::ChatSend => |v| serde_json::from_value(v).map(ProtocolMessage::ChatSend),
        MessageType::ChatReactAdd => {
            |v| serde_json::from_value(v).map(ProtocolMessage::ChatReactAdd)
        }
        MessageType::ChatReactRemove => {
            |v| serde_json::from_value(v).map(ProtocolMessage::ChatReactRemove)
        }
        MessageType::ChatKick => |v| serde_json::from_value(v).map(ProtocolMessage::ChatKick),
        MessageType::ChatMute => |v| serde_json::from_value(v).map(ProtocolMessage::ChatMute),
        MessageType::ChatUnmute => |v| serde_json::from_value(v).map(ProtocolMessage::ChatUnmute),
        MessageType::Error => |v| serde_json::from_value(v).map(ProtocolMessage::Error),
    }
}
