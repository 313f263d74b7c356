//! Resolved session identities.
//!
//! Identity equality goes through `IdentityKey`: registered users compare by
//! numeric id, guests by a per-session key minted at handshake. Two guests
//! that happen to draw the same display name stay distinct.
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use chat_protocol::UserInfo;
use rand::Rng;

/// Stable user id assigned by the persistence layer.
pub type UserId = i64;

static NEXT_GUEST: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdentityKey {
    Guest(u64),
    Registered(UserId),
}

#[derive(Debug, Clone)]
pub enum Identity {
    /// Ephemeral, unprivileged, never holds channel membership.
    Guest { key: u64, username: String },
    Registered { id: UserId, username: String },
}

impl Identity {
    /// Mint a guest named `Guest` plus four zero-padded digits.
    ///
    /// The name is cosmetic; uniqueness is carried by the key.
    pub fn guest() -> Self {
        let n: u32 = rand::rng().random_range(0..10_000);
        Identity::Guest {
            key: NEXT_GUEST.fetch_add(1, Ordering::Relaxed),
            username: format!("Guest{n:04}"),
        }
    }

    pub fn registered(id: UserId, username: impl Into<String>) -> Self {
        Identity::Registered { id, username: username.into() }
    }

    pub fn key(&self) -> IdentityKey {
        match self {
            Identity::Guest { key, .. } => IdentityKey::Guest(*key),
            Identity::Registered { id, .. } => IdentityKey::Registered(*id),
        }
    }

    pub fn username(&self) -> &str {
        match self {
            Identity::Guest { username, .. } | Identity::Registered { username, .. } => username,
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Identity::Registered { id, .. } => Some(*id),
            Identity::Guest { .. } => None,
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Identity::Guest { .. })
    }

    pub fn user_info(&self) -> UserInfo {
        UserInfo::new(self.username())
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Guest { username, .. } => write!(f, "Guest({username})"),
            Identity::Registered { id, username } => write!(f, "User(id={id}, username={username})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_name_is_zero_padded() {
        let g = Identity::guest();
        let name = g.username();
        assert!(name.starts_with("Guest"));
        assert_eq!(name.len(), "Guest".len() + 4);
        assert!(name["Guest".len()..].chars().all(|c| c.is_ascii_digit()));
        assert!(g.is_guest());
        assert_eq!(g.user_id(), None);
    }

    #[test]
    fn same_named_guests_are_distinct() {
        let a = Identity::Guest { key: 1_000_001, username: "Guest0001".into() };
        let b = Identity::Guest { key: 1_000_002, username: "Guest0001".into() };
        assert_ne!(a, b);
    }

    #[test]
    fn registered_identity_compares_by_id() {
        let a = Identity::registered(7, "alice");
        let renamed = Identity::registered(7, "alice2");
        assert_eq!(a, renamed);
        assert_ne!(a, Identity::registered(8, "alice"));
        assert_eq!(a.to_string(), "User(id=7, username=alice)");
    }
}
