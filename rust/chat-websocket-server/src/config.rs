use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chat_protocol::ChannelId;

use crate::dispatch::Capability;
use crate::identity::Identity;
use crate::store::{ChatStore, MemoryStore};

pub type AuthFuture = Pin<Box<dyn Future<Output = Result<Identity, String>> + Send + 'static>>;
/// Resolves a `hello` token into an identity. `Err` rejects the connection.
pub type AuthFn = Arc<dyn Fn(String) -> AuthFuture + Send + Sync>;
/// Whether an identity holds a moderation capability in a channel.
pub type AuthorizeFn = Arc<dyn Fn(&Identity, ChannelId, Capability) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct ServerConfig {
    /// Token authentication. Without it every token is rejected; guests
    /// (no token) are still admitted.
    pub authenticate: Option<AuthFn>,
    /// Capability policy. Defaults to: registered users hold every
    /// capability, guests none.
    pub authorize: Option<AuthorizeFn>,
    pub store: Arc<dyn ChatStore>,
    /// Only accept the WebSocket upgrade on this request path (404 otherwise).
    pub path: Option<String>,
    /// Reject connections that send no `hello` within this window.
    /// `None` waits indefinitely.
    pub handshake_timeout_ms: Option<u64>,
    /// Per-recipient bound on how long a send may wait for queue space.
    pub send_timeout_ms: u64,
    /// Capacity of each session's outbound queue.
    pub outbound_queue: usize,
    /// Cap on messages replayed to a joining member. `None` replays all.
    pub history_limit: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            authenticate: None,
            authorize: None,
            store: Arc::new(MemoryStore::new()),
            path: None,
            handshake_timeout_ms: None,
            send_timeout_ms: 1000,
            outbound_queue: 256,
            history_limit: None,
        }
    }
}

impl ServerConfig {
    pub fn can(&self, identity: &Identity, channel: ChannelId, capability: Capability) -> bool {
        match &self.authorize {
            Some(check) => (check)(identity, channel, capability),
            None => !identity.is_guest(),
        }
    }
}
