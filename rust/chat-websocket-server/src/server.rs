//! Shared server state handed to every connection task.
use std::sync::Arc;
use std::time::Duration;

use chat_protocol::{Envelope, MessageRegistry, ProtocolMessage};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::channel::Channel;
use crate::config::ServerConfig;
use crate::connection::{ConnId, Session};
use crate::dispatch::{self, DispatchTable, Outcome};
use crate::error::{INVALID_MESSAGE_TYPE, MALFORMED_MESSAGE};
use crate::handlers;
use crate::hub::Hub;
use crate::moderation::Moderation;

pub struct ChatServer {
    pub(crate) config: ServerConfig,
    pub(crate) hub: Arc<Mutex<Hub>>,
    pub(crate) broker: Broker,
    pub(crate) moderation: Moderation,
    pub(crate) registry: &'static MessageRegistry,
    pub(crate) table: DispatchTable,
}

impl ChatServer {
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(Mutex::new(Hub::new()));
        let broker = Broker::new(hub.clone(), Duration::from_millis(config.send_timeout_ms));
        let moderation = Moderation::new(config.store.clone());
        Self {
            config,
            hub,
            broker,
            moderation,
            registry: MessageRegistry::global(),
            table: DispatchTable::standard(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<Mutex<Hub>> {
        &self.hub
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub async fn active_channels(&self) -> Vec<Channel> {
        self.hub.lock().await.active_channels()
    }

    pub async fn connection_count(&self) -> usize {
        self.hub.lock().await.connection_count()
    }

    /// Register an established session, closing any session it displaces.
    pub async fn register(&self, session: Arc<Session>) {
        let displaced = self.hub.lock().await.connections.add(session.clone());
        if let Some(old) = displaced {
            info!(
                old_conn = old.conn_id(),
                new_conn = session.conn_id(),
                identity=%session.identity(),
                "closing replaced session"
            );
            old.displace();
            if !old.close(CloseCode::Normal, "Session replaced") {
                warn!(conn_id = old.conn_id(), "could not queue close for replaced session");
            }
        }
    }

    /// Whether `session` is still the registered owner of its handle.
    pub async fn is_registered(&self, session: &Session) -> bool {
        let hub = self.hub.lock().await;
        hub.connections
            .get_by_handle(session.conn_id())
            .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), session))
    }

    /// Handle one post-handshake text frame from `session`.
    ///
    /// A session that was displaced or already cleaned up is refused without a
    /// reply.
    pub async fn handle_text(&self, session: &Arc<Session>, raw: &str) -> Outcome {
        if !self.is_registered(session).await {
            debug!(conn_id = session.conn_id(), "frame from unregistered session dropped");
            return Outcome::Displaced;
        }
        match self.registry.parse_frame(raw) {
            Ok(Some(frame)) => dispatch::dispatch(self, session, frame).await,
            Ok(None) => self.reject(session, INVALID_MESSAGE_TYPE).await,
            Err(e) => {
                debug!(conn_id = session.conn_id(), %e, "unparseable frame");
                self.reject(session, MALFORMED_MESSAGE).await
            }
        }
    }

    /// Disconnect cascade: unregister the handle and announce one leave per
    /// vacated channel to the members left behind.
    pub async fn disconnect(&self, conn_id: ConnId) {
        let departure = self.hub.lock().await.disconnect(conn_id);
        let Some(departure) = departure else {
            debug!(conn_id, "nothing to clean up");
            return;
        };
        let identity = departure.session.identity();
        let vacated = departure.vacated.len();
        for (channel, remaining) in &departure.vacated {
            handlers::notify_leave(self, identity, *channel, remaining).await;
        }
        info!(
            conn_id,
            %identity,
            vacated,
            online_secs = departure.session.connected_for().as_secs(),
            "session closed"
        );
    }

    /// Send one error envelope to `session`.
    pub(crate) async fn reject(&self, session: &Session, detail: &str) -> Outcome {
        let env = Envelope::stamped(ProtocolMessage::error(detail));
        self.broker.deliver(session, &env).await;
        Outcome::Rejected(detail.to_string())
    }
}
