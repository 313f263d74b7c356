//! Chat WebSocket Server
//!
//! Async WebSocket server for channel-based chat. A connection starts with a
//! `hello` handshake (guest, or token-authenticated through
//! `ServerConfig::authenticate`), then every frame is routed through a fixed
//! validation pipeline per message type before its handler runs. Fan-out is
//! best-effort per recipient; disconnecting announces one leave per channel
//! the user was in.
//!
//! Text frame `ping` is answered with `pong` for keepalive.
//!
//! Example (not run here because it binds a socket):
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! #   let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
//! #   rt.block_on(async move {
//! chat_websocket_server::serve("127.0.0.1:9000").await?;
//! #   Ok(())
//! # })
//! # }
//! ```

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

pub use chat_protocol as protocol;

pub mod broker;
pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
mod handlers;
pub mod handshake;
pub mod hub;
pub mod identity;
pub mod membership;
pub mod moderation;
pub mod server;
pub mod store;

pub use broker::Broker;
pub use channel::{Channel, ChannelDirectory};
pub use config::{AuthFn, AuthFuture, AuthorizeFn, ServerConfig};
pub use connection::{ConnId, ConnectionRegistry, Session};
pub use dispatch::{Capability, Outcome, Stage};
pub use error::{ChatError, DomainError, InfrastructureError};
pub use handshake::SessionState;
pub use hub::Hub;
pub use identity::{Identity, IdentityKey, UserId};
pub use membership::MembershipIndex;
pub use moderation::Moderation;
pub use server::ChatServer;
pub use store::{ChatStore, MemoryStore, MuteRecord, StoreError, StoredMessage};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Start a chat server with the default configuration on the given address.
pub async fn serve(addr: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!(%addr, "binding TCP listener");
    let listener = TcpListener::bind(addr).await?;
    serve_incoming_with_config(listener, ServerConfig::default()).await
}

/// Serve a pre-bound listener. Useful for tests to bind on port 0.
pub async fn serve_incoming(
    listener: TcpListener,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    serve_incoming_with_config(listener, ServerConfig::default()).await
}

pub async fn serve_incoming_with_config(
    listener: TcpListener,
    config: ServerConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    serve_incoming_with_server(listener, Arc::new(ChatServer::new(config))).await
}

/// Serve with caller-owned state, so the caller can inspect connections and
/// channels while the server runs.
pub async fn serve_incoming_with_server(
    listener: TcpListener,
    server: Arc<ChatServer>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(remote=%peer, "accepted TCP connection");
                let server = server.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_conn(stream, server).await {
                        warn!(%e, "connection task ended with error");
                    }
                });
            }
            Err(e) => {
                error!(%e, "accept failed; continuing");
                continue;
            }
        }
    }
}

/// Runs the disconnect cascade on a detached task when dropped, so it runs to
/// completion even if the connection task is cancelled.
struct DisconnectGuard {
    server: Arc<ChatServer>,
    conn_id: ConnId,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let server = self.server.clone();
        let conn_id = self.conn_id;
        rt.spawn(async move { server.disconnect(conn_id).await });
    }
}

async fn handle_conn(
    stream: TcpStream,
    server: Arc<ChatServer>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let expected_path = server.config().path.clone();
    let ws = accept_hdr_async(
        stream,
        move |req: &tungstenite::handshake::server::Request,
              resp: tungstenite::handshake::server::Response| {
            if let Some(expected) = &expected_path {
                let path = req.uri().path();
                if path != expected {
                    warn!(%path, "upgrade requested on unknown path");
                    let response = tungstenite::http::Response::builder()
                        .status(tungstenite::http::StatusCode::NOT_FOUND)
                        .body(Some("Not Found".to_string()))
                        .unwrap_or_else(|_| tungstenite::http::Response::new(None));
                    return Err(response);
                }
            }
            Ok(resp)
        },
    )
    .await?;

    let conn_id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let mut state = SessionState::Connecting;
    state.advance(SessionState::AwaitingHandshake)?;

    // writer task channel
    let (tx, mut rx) = mpsc::channel::<Message>(server.config().outbound_queue.max(1));
    let (mut sink, mut stream) = ws.split();
    let sink_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                debug!("sink send error; writer task exiting");
                break;
            }
        }
    });

    let established =
        handshake::establish(&server, conn_id, &mut stream, &tx, &mut state).await;
    // the session holds its own sender from here on
    drop(tx);
    let session = match established {
        Ok(session) => session,
        Err(e) => {
            let _ = sink_task.await;
            debug!(conn_id, ?state, "handshake rejected");
            return Err(e.into());
        }
    };
    let guard = DisconnectGuard { server: server.clone(), conn_id };

    loop {
        let next = tokio::select! {
            next = stream.next() => next,
            _ = session.displaced() => {
                debug!(conn_id, "session replaced; ending read loop");
                break;
            }
        };
        let msg = match next {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                debug!(conn_id, %e, "read failed");
                break;
            }
            None => break,
        };
        match msg {
            Message::Text(txt) => {
                if txt == "ping" {
                    session.try_send(Message::Text("pong".into()));
                    continue;
                }
                if server.handle_text(&session, txt.as_str()).await == Outcome::Displaced {
                    break;
                }
            }
            Message::Binary(_) => {
                server.reject(&session, error::MALFORMED_MESSAGE).await;
            }
            Message::Ping(p) => {
                session.try_send(Message::Pong(p));
            }
            Message::Close(frame) => {
                session.try_send(Message::Close(frame));
                break;
            }
            _ => {}
        }
    }

    // cleanup
    state.advance(SessionState::Closed)?;
    drop(guard);
    drop(session);
    let _ = sink_task.await;
    debug!(conn_id, "connection closed and cleaned up");
    Ok(())
}
