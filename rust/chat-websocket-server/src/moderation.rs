//! Mute bookkeeping on top of the store. Kicks are pure membership
//! operations and live with the handlers.
use std::sync::Arc;

use chat_protocol::ChannelId;
use chrono::{TimeDelta, Utc};

use crate::error::{ChatError, DomainError};
use crate::identity::Identity;
use crate::store::{ChatStore, MuteRecord, StoreError};

#[derive(Clone)]
pub struct Moderation {
    store: Arc<dyn ChatStore>,
}

impl Moderation {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    /// Guests are never muted; they cannot join a channel to begin with.
    pub async fn is_muted(&self, identity: &Identity, channel: ChannelId) -> Result<bool, StoreError> {
        let Some(id) = identity.user_id() else {
            return Ok(false);
        };
        Ok(self.store.get_mute(id, channel).await?.is_some())
    }

    /// Mute `target` in `channel` for `duration_secs`, or indefinitely.
    pub async fn mute(
        &self,
        target: &Identity,
        issuer: &Identity,
        channel: ChannelId,
        duration_secs: Option<u64>,
        reason: &str,
    ) -> Result<MuteRecord, ChatError> {
        let (Some(target_id), Some(issuer_id)) = (target.user_id(), issuer.user_id()) else {
            return Err(DomainError::PermissionDenied.into());
        };
        let now = Utc::now();
        // out-of-range durations degrade to an open-ended mute
        let expires_at = duration_secs
            .and_then(|s| i64::try_from(s).ok())
            .and_then(TimeDelta::try_seconds)
            .and_then(|d| now.checked_add_signed(d));
        let record = MuteRecord {
            target_id,
            issuer_id,
            channel_id: channel,
            created_at: now,
            expires_at,
            reason: reason.to_string(),
        };
        self.store.mute(&record).await?;
        Ok(record)
    }

    pub async fn unmute(&self, target: &Identity, channel: ChannelId) -> Result<bool, ChatError> {
        let Some(target_id) = target.user_id() else {
            return Ok(false);
        };
        Ok(self.store.unmute(target_id, channel).await?)
    }
}
