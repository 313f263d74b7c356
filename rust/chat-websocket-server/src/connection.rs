//! Live sessions and the connection registry.
//!
//! A `Session` owns the bounded outbound queue drained by the connection's
//! writer task. The registry indexes sessions by transport handle and by
//! identity; a newer session for the same identity displaces the older one.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::error::InfrastructureError;
use crate::identity::{Identity, IdentityKey};

/// Opaque per-transport handle.
pub type ConnId = u64;

pub type Outbound = mpsc::Sender<Message>;

#[derive(Debug)]
pub struct Session {
    conn_id: ConnId,
    identity: Identity,
    outbound: Outbound,
    connected_at: Instant,
    displaced: Notify,
}

impl Session {
    pub fn new(conn_id: ConnId, identity: Identity, outbound: Outbound) -> Self {
        Self { conn_id, identity, outbound, connected_at: Instant::now(), displaced: Notify::new() }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Queue a frame, waiting at most `timeout` for room in the queue.
    pub async fn send(&self, msg: Message, timeout: Duration) -> Result<(), InfrastructureError> {
        self.outbound.send_timeout(msg, timeout).await.map_err(|e| match e {
            SendTimeoutError::Timeout(_) => InfrastructureError::SendTimeout { conn_id: self.conn_id },
            SendTimeoutError::Closed(_) => InfrastructureError::SendClosed { conn_id: self.conn_id },
        })
    }

    /// Queue a frame without waiting. Dropped if the queue is full.
    pub fn try_send(&self, msg: Message) -> bool {
        self.outbound.try_send(msg).is_ok()
    }

    /// Ask the writer task to close the socket with `reason`.
    pub fn close(&self, code: CloseCode, reason: &str) -> bool {
        self.try_send(Message::Close(Some(CloseFrame { code, reason: reason.to_string().into() })))
    }

    /// Mark the session as replaced by a newer one for the same identity.
    pub fn displace(&self) {
        self.displaced.notify_one();
    }

    /// Resolves once `displace` has been called, even if it was called first.
    pub async fn displaced(&self) {
        self.displaced.notified().await
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    by_conn: HashMap<ConnId, Arc<Session>>,
    by_identity: HashMap<IdentityKey, ConnId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session`. Returns the session it displaced, if the identity
    /// was already bound to another handle.
    pub fn add(&mut self, session: Arc<Session>) -> Option<Arc<Session>> {
        let conn_id = session.conn_id();
        let key = session.identity().key();
        let displaced = match self.by_identity.insert(key, conn_id) {
            Some(prev) if prev != conn_id => self.by_conn.remove(&prev),
            _ => None,
        };
        self.by_conn.insert(conn_id, session);
        displaced
    }

    /// Drop the session bound to `conn_id`. The identity mapping is only
    /// cleared when it still points at this handle.
    pub fn remove(&mut self, conn_id: ConnId) -> Option<Arc<Session>> {
        let session = self.by_conn.remove(&conn_id)?;
        let key = session.identity().key();
        if self.by_identity.get(&key) == Some(&conn_id) {
            self.by_identity.remove(&key);
        }
        Some(session)
    }

    pub fn get_by_handle(&self, conn_id: ConnId) -> Option<&Arc<Session>> {
        self.by_conn.get(&conn_id)
    }

    pub fn get_by_identity(&self, key: &IdentityKey) -> Option<&Arc<Session>> {
        self.by_identity.get(key).and_then(|id| self.by_conn.get(id))
    }

    pub fn is_connected(&self, key: &IdentityKey) -> bool {
        self.by_identity.contains_key(key)
    }

    pub fn count(&self) -> usize {
        self.by_conn.len()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Arc<Session>> {
        self.by_conn.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(conn_id: ConnId, identity: Identity) -> (Arc<Session>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(8);
        (Arc::new(Session::new(conn_id, identity, tx)), rx)
    }

    #[test]
    fn add_and_lookup_both_ways() {
        let mut reg = ConnectionRegistry::new();
        let alice = Identity::registered(1, "alice");
        let (s, _rx) = session(10, alice.clone());
        assert!(reg.add(s).is_none());
        assert_eq!(reg.count(), 1);
        assert_eq!(reg.get_by_handle(10).map(|s| s.conn_id()), Some(10));
        assert_eq!(reg.get_by_identity(&alice.key()).map(|s| s.conn_id()), Some(10));
    }

    #[test]
    fn newer_session_displaces_older() {
        let mut reg = ConnectionRegistry::new();
        let alice = Identity::registered(1, "alice");
        let (old, _rx1) = session(10, alice.clone());
        let (new, _rx2) = session(11, alice.clone());
        reg.add(old);
        let displaced = reg.add(new).expect("old session displaced");
        assert_eq!(displaced.conn_id(), 10);
        assert_eq!(reg.count(), 1);
        assert!(reg.get_by_handle(10).is_none());

        // late cleanup of the old handle must not unbind the new one
        assert!(reg.remove(10).is_none());
        assert_eq!(reg.get_by_identity(&alice.key()).map(|s| s.conn_id()), Some(11));
    }

    #[test]
    fn remove_clears_identity_binding() {
        let mut reg = ConnectionRegistry::new();
        let bob = Identity::registered(2, "bob");
        let (s, _rx) = session(20, bob.clone());
        reg.add(s);
        assert!(reg.remove(20).is_some());
        assert!(!reg.is_connected(&bob.key()));
        assert_eq!(reg.count(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn send_times_out_on_full_queue() {
        let (tx, _rx) = mpsc::channel(1);
        let s = Session::new(30, Identity::guest(), tx);
        s.send(Message::Text("a".into()), Duration::from_millis(10)).await.unwrap();
        let err = s.send(Message::Text("b".into()), Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, InfrastructureError::SendTimeout { conn_id: 30 }));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn displacement_is_observed_after_the_fact() {
        let (s, _rx) = session(40, Identity::registered(4, "dora"));
        s.displace();
        tokio::time::timeout(Duration::from_millis(100), s.displaced())
            .await
            .expect("displacement signal lost");
    }
}
