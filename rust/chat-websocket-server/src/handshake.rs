//! Session establishment.
//!
//! `Connecting -> AwaitingHandshake -> Established -> Closed`, with
//! `Rejected` as the terminal failure branch off `AwaitingHandshake`.
use std::sync::Arc;
use std::time::Duration;

use chat_protocol::{encode, Envelope, HelloPayload, ProtocolMessage};
use futures_util::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message, Utf8Bytes};
use tracing::{debug, info, warn};

use crate::connection::{ConnId, Outbound, Session};
use crate::error::ChatError;
use crate::identity::Identity;
use crate::server::ChatServer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingHandshake,
    Established,
    Closed,
    Rejected,
}

impl SessionState {
    pub fn can_advance(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, AwaitingHandshake)
                | (AwaitingHandshake, Established)
                | (AwaitingHandshake, Rejected)
                | (Established, Closed)
        )
    }

    pub fn advance(&mut self, next: SessionState) -> Result<(), ChatError> {
        if !self.can_advance(next) {
            return Err(ChatError::Protocol(format!("illegal transition {self:?} -> {next:?}")));
        }
        *self = next;
        Ok(())
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Rejected)
    }
}

/// Wait for the `hello` frame, resolve the identity, acknowledge and register.
///
/// On failure the transport has already been told to close and `state` is
/// `Rejected`.
pub(crate) async fn establish<S>(
    server: &ChatServer,
    conn_id: ConnId,
    stream: &mut S,
    outbound: &Outbound,
    state: &mut SessionState,
) -> Result<Arc<Session>, ChatError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let first = match server.config.handshake_timeout_ms {
        Some(ms) => tokio::time::timeout(Duration::from_millis(ms), first_text_frame(stream))
            .await
            .unwrap_or_else(|_| {
                debug!(conn_id, ms, "handshake timed out");
                Ok(None)
            }),
        None => first_text_frame(stream).await,
    };
    let first = match first {
        Ok(f) => f,
        Err(e) => {
            state.advance(SessionState::Rejected)?;
            return Err(e);
        }
    };

    let hello = first.and_then(|text| match server.registry.parse(text.as_str()) {
        Ok(Some(Envelope { message: ProtocolMessage::Hello(h), .. })) => Some(h),
        _ => None,
    });
    let Some(hello) = hello else {
        state.advance(SessionState::Rejected)?;
        warn!(conn_id, "first frame was not a valid hello");
        send_error(outbound, "Expected hello message.");
        close(outbound, CloseCode::Protocol, "Invalid HELLO");
        return Err(ChatError::Protocol("invalid hello".into()));
    };

    let identity = match hello.token {
        None => Identity::guest(),
        Some(token) => match authenticate(server, token).await {
            Ok(identity) => identity,
            Err(reason) => {
                state.advance(SessionState::Rejected)?;
                warn!(conn_id, %reason, "authentication failed");
                close(outbound, CloseCode::Policy, "Authentication failed");
                return Err(ChatError::Authentication(reason));
            }
        },
    };

    let session = Arc::new(Session::new(conn_id, identity, outbound.clone()));
    let ack = Envelope::stamped(ProtocolMessage::Hello(HelloPayload {
        token: None,
        user: Some(session.identity().user_info()),
    }));
    server.broker.deliver(&session, &ack).await;
    server.register(session.clone()).await;
    state.advance(SessionState::Established)?;
    info!(conn_id, identity=%session.identity(), "session established");
    Ok(session)
}

async fn authenticate(server: &ChatServer, token: String) -> Result<Identity, String> {
    let Some(auth) = server.config.authenticate.clone() else {
        return Err("no authenticator configured".to_string());
    };
    (auth)(token).await
}

/// Next text frame, skipping control frames. `None` when the peer closed or
/// sent something other than text.
async fn first_text_frame<S>(stream: &mut S) -> Result<Option<Utf8Bytes>, ChatError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        match msg? {
            Message::Text(text) => return Ok(Some(text)),
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => return Ok(None),
        }
    }
    Ok(None)
}

fn send_error(outbound: &Outbound, detail: &str) {
    match encode(&Envelope::stamped(ProtocolMessage::error(detail))) {
        Ok(text) => {
            let _ = outbound.try_send(Message::Text(text.into()));
        }
        Err(e) => warn!(%e, "failed to encode handshake error"),
    }
}

fn close(outbound: &Outbound, code: CloseCode, reason: &str) {
    let _ = outbound.try_send(Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    })));
}
