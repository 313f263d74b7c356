//! # Chat Protocol (Rust)
//!
//! Typed envelopes for the chat WebSocket protocol, shared by the server and
//! client crates.
//!
//! ## Wire format
//! Every frame is a JSON text message:
//!
//! ```text
//! {"type": "chat_send", "timestamp": "...", "id": "...", "payload": {...}}
//! ```
//!
//! `type` selects exactly one payload schema; `timestamp` and `id` are
//! optional. Payload schemas reject unknown fields.
//!
//! ## Crate layout
//! - `protocol`: `MessageType`, payload structs, `ProtocolMessage`, `Envelope`
//! - `registry`: the closed `type` → decoder table and two-step parsing
//! - `encoding`: `encode`, `parse`, `decode`, and `try_decode` helpers
//!
//! ## Quick start
//!
//! ```
//! use chat_protocol::{encode, parse, ChatSendPayload, Envelope, ProtocolMessage};
//!
//! let msg = Envelope::new(ProtocolMessage::ChatSend(ChatSendPayload {
//!     channel_id: 1,
//!     sender: None,
//!     content: "hello".into(),
//! }));
//!
//! let text = encode(&msg).unwrap();
//! let back = parse(&text).unwrap();
//! assert_eq!(back, Some(msg));
//! ```
//!
//! A frame naming an unknown `type` is not an error:
//!
//! ```
//! let out = chat_protocol::parse(r#"{"type":"user_afk","payload":{}}"#).unwrap();
//! assert!(out.is_none());
//! ```

pub mod encoding;
pub mod error;
pub mod protocol;
pub mod registry;

pub use encoding::{decode, encode, parse, try_decode};
pub use error::{DecodeError, EncodeError, RegistryError};
pub use protocol::*;
pub use registry::{Frame, MessageRegistry, PayloadDecoder};
