//! Channel directory. Channels are created lazily on first join and are
//! never deleted while the process runs.
use std::collections::HashMap;

use chat_protocol::ChannelId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
}

impl Channel {
    pub fn new(id: ChannelId) -> Self {
        Self { id, name: format!("Channel {id}") }
    }
}

#[derive(Debug, Default)]
pub struct ChannelDirectory {
    channels: HashMap<ChannelId, Channel>,
}

impl ChannelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the channel for `id`, creating it if absent.
    pub fn create_channel(&mut self, id: ChannelId) -> &Channel {
        self.channels.entry(id).or_insert_with(|| Channel::new(id))
    }

    pub fn get(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn exists(&self, id: ChannelId) -> bool {
        self.channels.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
