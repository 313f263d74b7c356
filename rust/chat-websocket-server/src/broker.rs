//! Outbound delivery: one session, one identity, or a set of channel members.
//!
//! Recipients are resolved under the hub lock; the sends happen after it is
//! released. A slow or dead recipient costs at most `send_timeout` and never
//! fails the whole fan-out.
use std::sync::Arc;
use std::time::Duration;

use chat_protocol::{encode, Envelope};
use futures_util::future::join_all;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tracing::{debug, error, warn};

use crate::connection::{ConnId, Session};
use crate::hub::Hub;
use crate::identity::Identity;

#[derive(Clone)]
pub struct Broker {
    hub: Arc<Mutex<Hub>>,
    send_timeout: Duration,
}

impl Broker {
    pub fn new(hub: Arc<Mutex<Hub>>, send_timeout: Duration) -> Self {
        Self { hub, send_timeout }
    }

    /// Send straight to a session the caller already holds.
    pub async fn deliver(&self, session: &Session, envelope: &Envelope) -> bool {
        match self.encode(envelope) {
            Some(text) => self.deliver_text(session, text).await,
            None => false,
        }
    }

    pub async fn send_to_session(&self, conn_id: ConnId, envelope: &Envelope) -> bool {
        let session = self.hub.lock().await.connections.get_by_handle(conn_id).cloned();
        match session {
            Some(s) => self.deliver(&s, envelope).await,
            None => {
                debug!(conn_id, ty=%envelope.message_type(), "no session for handle; dropped");
                false
            }
        }
    }

    pub async fn send_to_user(&self, identity: &Identity, envelope: &Envelope) -> bool {
        let session = self
            .hub
            .lock()
            .await
            .connections
            .get_by_identity(&identity.key())
            .cloned();
        match session {
            Some(s) => self.deliver(&s, envelope).await,
            None => {
                debug!(%identity, ty=%envelope.message_type(), "user offline; dropped");
                false
            }
        }
    }

    /// Fan `envelope` out to every member in `members` that has a live
    /// session. Returns how many deliveries succeeded.
    pub async fn send_to_channel(&self, members: &[Identity], envelope: &Envelope) -> usize {
        let Some(text) = self.encode(envelope) else {
            return 0;
        };
        let sessions: Vec<Arc<Session>> = {
            let hub = self.hub.lock().await;
            members
                .iter()
                .filter_map(|m| hub.connections.get_by_identity(&m.key()).cloned())
                .collect()
        };
        let results =
            join_all(sessions.iter().map(|s| self.deliver_text(s, text.clone()))).await;
        results.into_iter().filter(|ok| *ok).count()
    }

    fn encode(&self, envelope: &Envelope) -> Option<Utf8Bytes> {
        match encode(envelope) {
            Ok(text) => Some(text.into()),
            Err(e) => {
                error!(%e, ty=%envelope.message_type(), "failed to encode outbound message");
                None
            }
        }
    }

    async fn deliver_text(&self, session: &Session, text: Utf8Bytes) -> bool {
        match session.send(Message::Text(text), self.send_timeout).await {
            Ok(()) => true,
            Err(e) => {
                warn!(conn_id = session.conn_id(), %e, "outbound send failed");
                false
            }
        }
    }
}
