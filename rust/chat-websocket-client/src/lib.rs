//! Chat WebSocket Client
//!
//! Two layers are exposed:
//! - Low-level `Client` to run the `hello` handshake and send/receive raw
//!   `chat_protocol::Envelope`s.
//! - High-level `ChatClient` with a background reader that forwards every
//!   server envelope to an event queue, plus join/leave/say/moderation helpers.
//!
//! Low-level example (not run here):
//! ```no_run
//! use chat_websocket_client::Client;
//! use chat_protocol::{ChannelJoinPayload, ProtocolMessage};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! #   let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
//! #   rt.block_on(async move {
//! let mut client = Client::connect("ws://127.0.0.1:9000").await?;
//! let me = client.hello(Some("secret-token")).await?;
//! println!("logged in as {}", me.username);
//! client
//!     .send_message(ProtocolMessage::ChannelJoin(ChannelJoinPayload { channel_id: 1, user: None }))
//!     .await?;
//! if let Some(env) = client.next().await? {
//!     println!("got: {:?}", env.message);
//! }
//! #   Ok(())
//! # })
//! # }
//! ```
//!
//! High-level example (not run here):
//! ```no_run
//! use chat_websocket_client::ChatClient;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! #   let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
//! #   rt.block_on(async move {
//! let mut client = ChatClient::connect("ws://127.0.0.1:9000", None).await?;
//! client.join(1)?;
//! client.say(1, "hello")?;
//! while let Some(env) = client.next_event().await {
//!     println!("{:?}", env.message);
//! }
//! #   Ok(())
//! # })
//! # }
//! ```

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

pub use chat_protocol as protocol;
use protocol::{
    encode, try_decode, ChannelId, ChannelJoinPayload, ChannelLeavePayload, ChatSendPayload,
    Envelope, HelloPayload, KickPayload, MutePayload, ProtocolMessage, ReactionPayload,
    UnmutePayload, UserInfo,
};

/// Errors that may occur in the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server closed the connection during the handshake.
    #[error("rejected by server: {0}")]
    Rejected(String),
    #[error("websocket error: {0}")]
    Ws(Box<tungstenite::Error>),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("connection closed")]
    Closed,
}

impl From<tungstenite::Error> for ClientError {
    fn from(e: tungstenite::Error) -> Self {
        ClientError::Ws(Box::new(e))
    }
}

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A minimal client wrapping a WebSocket stream.
pub struct Client {
    ws: Ws,
    close_reason: Option<String>,
}

impl Client {
    /// Connect to a ws/wss URL. The `hello` handshake is not sent yet.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (ws, _resp) = connect_async(url).await?;
        Ok(Self { ws, close_reason: None })
    }

    /// Send `hello` and wait for the acknowledgement. `None` connects as a guest.
    pub async fn hello(&mut self, token: Option<&str>) -> Result<UserInfo, ClientError> {
        self.send_message(ProtocolMessage::Hello(HelloPayload {
            token: token.map(str::to_string),
            user: None,
        }))
        .await?;
        loop {
            match self.next().await? {
                Some(Envelope { message: ProtocolMessage::Hello(ack), .. }) => {
                    return ack
                        .user
                        .ok_or_else(|| ClientError::Protocol("hello ack without user".into()));
                }
                Some(Envelope { message: ProtocolMessage::Error(e), .. }) => {
                    debug!(detail=%e.detail, "handshake error envelope");
                }
                Some(other) => {
                    return Err(ClientError::Protocol(format!(
                        "unexpected {} before hello ack",
                        other.message_type()
                    )));
                }
                None => {
                    let reason = self.close_reason.clone().unwrap_or_default();
                    return Err(ClientError::Rejected(reason));
                }
            }
        }
    }

    /// Send an envelope as a text frame.
    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), ClientError> {
        let text = encode(envelope).map_err(|e| ClientError::Protocol(e.to_string()))?;
        self.ws.send(Message::Text(text.into())).await?;
        Ok(())
    }

    pub async fn send_message(&mut self, message: ProtocolMessage) -> Result<(), ClientError> {
        self.send(&Envelope::new(message)).await
    }

    /// Send a raw text frame, bypassing encoding.
    pub async fn send_raw(&mut self, text: &str) -> Result<(), ClientError> {
        self.ws.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Send a keepalive ping (text frame "ping").
    pub async fn ping(&mut self) -> Result<(), ClientError> {
        self.ws.send(Message::Text("ping".into())).await?;
        Ok(())
    }

    /// Receive the next envelope.
    /// - Skips text frames that do not decode.
    /// - Replies to text "ping" with text "pong"; ignores "pong".
    /// - Returns Ok(None) on close; the close reason is kept in `close_reason`.
    pub async fn next(&mut self) -> Result<Option<Envelope>, ClientError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(txt))) => {
                    if txt == "ping" {
                        self.ws.send(Message::Text("pong".into())).await?;
                        continue;
                    }
                    if txt == "pong" {
                        continue;
                    }
                    if let Some(env) = try_decode(txt.as_str()) {
                        return Ok(Some(env));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    self.close_reason = frame.map(|f| f.reason.as_str().to_string());
                    return Ok(None);
                }
                Some(Ok(_)) => {}
                Some(Err(tungstenite::Error::ConnectionClosed)) | None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Reason string of the server's close frame, once one was received.
    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    /// Close the connection gracefully.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.ws.close(None).await?;
        Ok(())
    }
}

/// A higher-level client that keeps the socket serviced in the background.
pub struct ChatClient {
    tx: mpsc::UnboundedSender<Message>,
    events: mpsc::UnboundedReceiver<Envelope>,
    user: UserInfo,
}

impl ChatClient {
    /// Connect, complete the handshake and spawn reader/writer tasks.
    pub async fn connect(url: &str, token: Option<&str>) -> Result<Self, ClientError> {
        let mut client = Client::connect(url).await?;
        let user = client.hello(token).await?;

        let (mut sink, mut stream) = client.ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, events) = mpsc::unbounded_channel::<Envelope>();

        // Writer
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        // Reader
        let tx_reader = tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(txt)) => {
                        if txt == "ping" {
                            let _ = tx_reader.send(Message::Text("pong".into()));
                            continue;
                        }
                        if txt == "pong" {
                            continue;
                        }
                        match try_decode(txt.as_str()) {
                            Some(env) => {
                                if events_tx.send(env).is_err() {
                                    break;
                                }
                            }
                            None => debug!("skipping undecodable frame"),
                        }
                    }
                    Ok(Message::Ping(p)) => {
                        let _ = tx_reader.send(Message::Pong(p));
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "server closed connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(%e, "ws read error");
                        break;
                    }
                }
            }
        });

        Ok(Self { tx, events, user })
    }

    /// Identity the server acknowledged in the handshake.
    pub fn user(&self) -> &UserInfo {
        &self.user
    }

    /// Next envelope from the server; `None` once the connection is gone.
    pub async fn next_event(&mut self) -> Option<Envelope> {
        self.events.recv().await
    }

    pub fn send(&self, message: ProtocolMessage) -> Result<(), ClientError> {
        let text = encode(&Envelope::new(message)).map_err(|e| ClientError::Protocol(e.to_string()))?;
        self.tx.send(Message::Text(text.into())).map_err(|_| ClientError::Closed)
    }

    pub fn join(&self, channel_id: ChannelId) -> Result<(), ClientError> {
        self.send(ProtocolMessage::ChannelJoin(ChannelJoinPayload { channel_id, user: None }))
    }

    pub fn leave(&self, channel_id: ChannelId) -> Result<(), ClientError> {
        self.send(ProtocolMessage::ChannelLeave(ChannelLeavePayload { channel_id, user: None }))
    }

    pub fn say(&self, channel_id: ChannelId, content: &str) -> Result<(), ClientError> {
        self.send(ProtocolMessage::ChatSend(ChatSendPayload {
            channel_id,
            sender: None,
            content: content.to_string(),
        }))
    }

    pub fn react(
        &self,
        channel_id: ChannelId,
        message_id: uuid::Uuid,
        emote: &str,
        add: bool,
    ) -> Result<(), ClientError> {
        let payload = ReactionPayload {
            channel_id,
            message_id,
            emote: emote.to_string(),
            user: None,
        };
        self.send(if add {
            ProtocolMessage::ChatReactAdd(payload)
        } else {
            ProtocolMessage::ChatReactRemove(payload)
        })
    }

    pub fn kick(&self, channel_id: ChannelId, target: &str, reason: &str) -> Result<(), ClientError> {
        self.send(ProtocolMessage::ChatKick(KickPayload {
            channel_id,
            target: target.to_string(),
            reason: reason.to_string(),
        }))
    }

    pub fn mute(
        &self,
        channel_id: ChannelId,
        target: &str,
        duration_secs: Option<u64>,
        reason: &str,
    ) -> Result<(), ClientError> {
        self.send(ProtocolMessage::ChatMute(MutePayload {
            channel_id,
            target: target.to_string(),
            duration: duration_secs,
            reason: reason.to_string(),
        }))
    }

    pub fn unmute(&self, channel_id: ChannelId, target: &str) -> Result<(), ClientError> {
        self.send(ProtocolMessage::ChatUnmute(UnmutePayload {
            channel_id,
            target: target.to_string(),
        }))
    }

    /// Send a keepalive ping.
    pub fn ping(&self) -> Result<(), ClientError> {
        self.tx.send(Message::Text("ping".into())).map_err(|_| ClientError::Closed)
    }

    /// Ask the writer to close the socket.
    pub fn close(&self) -> Result<(), ClientError> {
        self.tx.send(Message::Close(None)).map_err(|_| ClientError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_error_display() {
        let e = ClientError::Rejected("Authentication failed".into());
        assert_eq!(e.to_string(), "rejected by server: Authentication failed");
        assert!(ClientError::Protocol("bad".into()).to_string().contains("protocol error"));
    }
}
