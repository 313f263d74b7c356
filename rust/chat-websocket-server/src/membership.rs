//! Bidirectional channel membership index.
//!
//! `members` (channel -> identities) and `channels` (identity -> channels)
//! always describe the same set of edges. Empty entries are dropped from both
//! sides. Guests never hold an edge.
use std::collections::{BTreeSet, HashMap};

use chat_protocol::ChannelId;

use crate::error::DomainError;
use crate::identity::{Identity, IdentityKey};

#[derive(Debug, Default)]
pub struct MembershipIndex {
    members: HashMap<ChannelId, HashMap<IdentityKey, Identity>>,
    channels: HashMap<IdentityKey, BTreeSet<ChannelId>>,
}

impl MembershipIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the edge `(identity, channel)`. Returns `Ok(false)` when it
    /// already existed.
    pub fn join(&mut self, identity: &Identity, channel: ChannelId) -> Result<bool, DomainError> {
        if identity.is_guest() {
            return Err(DomainError::PermissionDenied);
        }
        let key = identity.key();
        let added = self.channels.entry(key).or_default().insert(channel);
        if added {
            self.members.entry(channel).or_default().insert(key, identity.clone());
        }
        Ok(added)
    }

    /// Remove the edge. Returns whether it existed.
    pub fn leave(&mut self, identity: &Identity, channel: ChannelId) -> bool {
        let key = identity.key();
        let Some(chans) = self.channels.get_mut(&key) else {
            return false;
        };
        if !chans.remove(&channel) {
            return false;
        }
        if chans.is_empty() {
            self.channels.remove(&key);
        }
        if let Some(set) = self.members.get_mut(&channel) {
            set.remove(&key);
            if set.is_empty() {
                self.members.remove(&channel);
            }
        }
        true
    }

    /// Remove every edge of `identity` and return the channels it was in.
    pub fn leave_all(&mut self, identity: &Identity) -> BTreeSet<ChannelId> {
        let key = identity.key();
        let chans = self.channels.remove(&key).unwrap_or_default();
        for channel in &chans {
            if let Some(set) = self.members.get_mut(channel) {
                set.remove(&key);
                if set.is_empty() {
                    self.members.remove(channel);
                }
            }
        }
        chans
    }

    pub fn is_member(&self, identity: &Identity, channel: ChannelId) -> bool {
        self.channels
            .get(&identity.key())
            .is_some_and(|chans| chans.contains(&channel))
    }

    /// Snapshot of the channel's members.
    pub fn get_members(&self, channel: ChannelId) -> Vec<Identity> {
        self.members
            .get(&channel)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn channels_of(&self, identity: &Identity) -> BTreeSet<ChannelId> {
        self.channels.get(&identity.key()).cloned().unwrap_or_default()
    }

    pub fn find_member_by_name(&self, channel: ChannelId, username: &str) -> Option<Identity> {
        self.members
            .get(&channel)?
            .values()
            .find(|m| m.username() == username)
            .cloned()
    }

    /// Channels with at least one member, ascending.
    pub fn active_channels(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self.members.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    #[cfg(test)]
    fn assert_symmetric(&self) {
        for (channel, set) in &self.members {
            assert!(!set.is_empty(), "empty member set kept for {channel}");
            for key in set.keys() {
                assert!(self.channels.get(key).is_some_and(|c| c.contains(channel)));
            }
        }
        for (key, chans) in &self.channels {
            assert!(!chans.is_empty(), "empty channel set kept for {key:?}");
            for channel in chans {
                assert!(self.members.get(channel).is_some_and(|s| s.contains_key(key)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guests_cannot_join() {
        let mut idx = MembershipIndex::new();
        let guest = Identity::guest();
        assert_eq!(idx.join(&guest, 1), Err(DomainError::PermissionDenied));
        assert!(!idx.is_member(&guest, 1));
        assert!(idx.active_channels().is_empty());
    }

    #[test]
    fn join_is_idempotent() {
        let mut idx = MembershipIndex::new();
        let alice = Identity::registered(1, "alice");
        assert_eq!(idx.join(&alice, 3), Ok(true));
        assert_eq!(idx.join(&alice, 3), Ok(false));
        assert_eq!(idx.get_members(3).len(), 1);
    }

    #[test]
    fn leave_all_returns_every_channel() {
        let mut idx = MembershipIndex::new();
        let alice = Identity::registered(1, "alice");
        let bob = Identity::registered(2, "bob");
        for c in [1, 2, 3] {
            idx.join(&alice, c).unwrap();
        }
        idx.join(&bob, 2).unwrap();

        let left = idx.leave_all(&alice);
        assert_eq!(left.into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(idx.channels_of(&alice).is_empty());
        assert_eq!(idx.get_members(2), vec![bob.clone()]);
        assert_eq!(idx.active_channels(), vec![2]);
        idx.assert_symmetric();
    }

    #[test]
    fn find_member_by_name_scopes_to_channel() {
        let mut idx = MembershipIndex::new();
        let bob = Identity::registered(2, "bob");
        idx.join(&bob, 9).unwrap();
        assert_eq!(idx.find_member_by_name(9, "bob"), Some(bob));
        assert!(idx.find_member_by_name(8, "bob").is_none());
        assert!(idx.find_member_by_name(9, "carol").is_none());
    }

    #[test]
    fn indexes_stay_symmetric_under_mixed_operations() {
        let mut idx = MembershipIndex::new();
        let users: Vec<Identity> =
            (1..=5).map(|i| Identity::registered(i, format!("user{i}"))).collect();
        // deterministic pseudo-random walk over join/leave/leave_all
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let user = &users[(seed % 5) as usize];
            let channel = (seed >> 8) % 4;
            match (seed >> 16) % 5 {
                0 | 1 => {
                    idx.join(user, channel).unwrap();
                }
                2 | 3 => {
                    idx.leave(user, channel);
                }
                _ => {
                    idx.leave_all(user);
                }
            }
            idx.assert_symmetric();
        }
    }
}
