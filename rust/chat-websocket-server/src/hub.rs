//! Shared mutable state: connections, channels and membership behind one lock
//! so that compound updates are observed atomically.
use std::sync::Arc;

use chat_protocol::ChannelId;
use tracing::debug;

use crate::channel::{Channel, ChannelDirectory};
use crate::connection::{ConnId, ConnectionRegistry, Session};
use crate::identity::Identity;
use crate::membership::MembershipIndex;

#[derive(Debug, Default)]
pub struct Hub {
    pub connections: ConnectionRegistry,
    pub channels: ChannelDirectory,
    pub membership: MembershipIndex,
}

/// What a disconnect removed: the session and, per vacated channel, the
/// members left behind.
#[derive(Debug)]
pub struct Departure {
    pub session: Arc<Session>,
    pub vacated: Vec<(ChannelId, Vec<Identity>)>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unregister `conn_id` and drop its memberships.
    ///
    /// Returns `None` when the handle was already gone (e.g. displaced by a
    /// newer session). Memberships survive while the identity still has a
    /// live session.
    pub fn disconnect(&mut self, conn_id: ConnId) -> Option<Departure> {
        let session = self.connections.remove(conn_id)?;
        let identity = session.identity();
        if self.connections.is_connected(&identity.key()) {
            debug!(conn_id, %identity, "identity still connected elsewhere; keeping memberships");
            return Some(Departure { session, vacated: Vec::new() });
        }
        let vacated = self
            .membership
            .leave_all(identity)
            .into_iter()
            .map(|channel| (channel, self.membership.get_members(channel)))
            .collect();
        Some(Departure { session, vacated })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.count()
    }

    /// Channels that currently have at least one member.
    pub fn active_channels(&self) -> Vec<Channel> {
        self.membership
            .active_channels()
            .into_iter()
            .filter_map(|id| self.channels.get(id).cloned())
            .collect()
    }
}
