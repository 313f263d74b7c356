//! Persistence collaborator: message history and mute records.
//!
//! The server only talks to `dyn ChatStore`. `MemoryStore` keeps everything
//! in process and is the default; durable stores implement the same trait.
use std::collections::HashMap;

use async_trait::async_trait;
use chat_protocol::ChannelId;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::identity::UserId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: Uuid,
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    pub sender_username: String,
    pub timestamp: DateTime<Utc>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuteRecord {
    pub target_id: UserId,
    pub issuer_id: UserId,
    pub channel_id: ChannelId,
    pub created_at: DateTime<Utc>,
    /// `None` mutes until lifted.
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: String,
}

impl MuteRecord {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|t| t > now)
    }
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_message(&self, message: &StoredMessage) -> Result<(), StoreError>;

    /// Most recent messages of `channel_id`, oldest first, at most `limit`.
    async fn get_channel_messages(
        &self,
        channel_id: ChannelId,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    /// The mute currently in force, ignoring expired records.
    async fn get_mute(
        &self,
        target_id: UserId,
        channel_id: ChannelId,
    ) -> Result<Option<MuteRecord>, StoreError>;

    /// Store `record`, replacing any previous mute of the same target.
    async fn mute(&self, record: &MuteRecord) -> Result<(), StoreError>;

    /// Lift the mute. Returns whether one existed.
    async fn unmute(&self, target_id: UserId, channel_id: ChannelId) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: Mutex<HashMap<ChannelId, Vec<StoredMessage>>>,
    mutes: Mutex<HashMap<(UserId, ChannelId), MuteRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn create_message(&self, message: &StoredMessage) -> Result<(), StoreError> {
        self.messages
            .lock()
            .await
            .entry(message.channel_id)
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn get_channel_messages(
        &self,
        channel_id: ChannelId,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let map = self.messages.lock().await;
        let Some(all) = map.get(&channel_id) else {
            return Ok(Vec::new());
        };
        let skip = limit.map_or(0, |n| all.len().saturating_sub(n));
        Ok(all[skip..].to_vec())
    }

    async fn get_mute(
        &self,
        target_id: UserId,
        channel_id: ChannelId,
    ) -> Result<Option<MuteRecord>, StoreError> {
        let now = Utc::now();
        Ok(self
            .mutes
            .lock()
            .await
            .get(&(target_id, channel_id))
            .filter(|m| m.is_active_at(now))
            .cloned())
    }

    async fn mute(&self, record: &MuteRecord) -> Result<(), StoreError> {
        self.mutes
            .lock()
            .await
            .insert((record.target_id, record.channel_id), record.clone());
        Ok(())
    }

    async fn unmute(&self, target_id: UserId, channel_id: ChannelId) -> Result<bool, StoreError> {
        Ok(self.mutes.lock().await.remove(&(target_id, channel_id)).is_some())
    }
}
