//! JSON encoder/decoder for envelopes.
//!
//! Encoding writes `type`, then the optional `timestamp` and `id`, then the
//! payload object. Decoding goes through `MessageRegistry::global()`.
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{DecodeError, EncodeError};
use crate::protocol::*;
use crate::registry::MessageRegistry;

#[derive(Serialize)]
struct WireFrame<'a> {
    #[serde(rename = "type")]
    ty: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<&'a DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a Uuid>,
    payload: Value,
}

fn payload_value(message: &ProtocolMessage) -> Result<Value, serde_json::Error> {
    match message {
        ProtocolMessage::Hello(p) => serde_json::to_value(p),
        ProtocolMessage::ChannelJoin(p) => serde_json::to_value(p),
        ProtocolMessage::ChannelLeave(p) => serde_json::to_value(p),
        ProtocolMessage::ChatSend(p) => serde_json::to_value(p),
        ProtocolMessage::ChatReactAdd(p) | ProtocolMessage::ChatReactRemove(p) => {
            serde_json::to_value(p)
        }
        ProtocolMessage::ChatKick(p) => serde_json::to_value(p),
        ProtocolMessage::ChatMute(p) => serde_json::to_value(p),
        ProtocolMessage::ChatUnmute(p) => serde_json::to_value(p),
        ProtocolMessage::Error(p) => serde_json::to_value(p),
    }
}

/// Encode an `Envelope` into its JSON text form.
///
/// Rejects output larger than `MAX_FRAME_SIZE` so every encoded frame is
/// also parseable by the peer.
pub fn encode(envelope: &Envelope) -> Result<String, EncodeError> {
    let frame = WireFrame {
        ty: envelope.message.message_type().as_str(),
        timestamp: envelope.timestamp.as_ref(),
        id: envelope.id.as_ref(),
        payload: payload_value(&envelope.message)?,
    };
    let out = serde_json::to_string(&frame)?;
    if out.len() > MAX_FRAME_SIZE {
        return Err(EncodeError::TooLarge { size: out.len(), max: MAX_FRAME_SIZE });
    }
    Ok(out)
}

/// Parse a frame with the global registry.
///
/// `Ok(None)` means the frame named a type nobody registered.
pub fn parse(raw: &str) -> Result<Option<Envelope>, DecodeError> {
    MessageRegistry::global().parse(raw)
}

/// Strict decode: an unregistered type is an error.
pub fn decode(raw: &str) -> Result<Envelope, DecodeError> {
    let registry = MessageRegistry::global();
    match registry.parse_frame(raw)? {
        Some(frame) => registry.decode_frame(frame),
        None => Err(DecodeError::Unregistered(
            serde_json::from_str::<Value>(raw)
                .ok()
                .and_then(|v| v.get("type").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_default(),
        )),
    }
}

/// Attempt to decode a frame, returning `None` when parsing fails for any reason.
pub fn try_decode(raw: &str) -> Option<Envelope> {
    decode(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_omits_absent_optionals() {
        let env = Envelope::new(ProtocolMessage::ChannelLeave(ChannelLeavePayload {
            channel_id: 3,
            user: None,
        }));
        let text = encode(&env).unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "channel_leave");
        assert_eq!(v["payload"]["channel_id"], 3);
        assert!(v.get("timestamp").is_none());
        assert!(v["payload"].get("user").is_none());
    }

    #[test]
    fn stamped_envelope_carries_timestamp_and_id() {
        let env = Envelope::stamped(ProtocolMessage::error("boom"));
        let text = encode(&env).unwrap();
        let back = decode(&text).unwrap();
        assert_eq!(back.id, env.id);
        assert_eq!(back.message, ProtocolMessage::error("boom"));
        assert!(back.timestamp.is_some());
    }

    #[test]
    fn decode_rejects_unregistered_type_but_parse_does_not() {
        let raw = r#"{"type":"typing_start","payload":{}}"#;
        assert!(matches!(decode(raw), Err(DecodeError::Unregistered(t)) if t == "typing_start"));
        assert!(parse(raw).unwrap().is_none());
        assert!(try_decode(raw).is_none());
    }

    #[test]
    fn encode_rejects_oversized_content() {
        let env = Envelope::new(ProtocolMessage::ChatSend(ChatSendPayload {
            channel_id: 1,
            sender: None,
            content: "x".repeat(MAX_FRAME_SIZE),
        }));
        assert!(matches!(encode(&env), Err(EncodeError::TooLarge { .. })));
    }
}
