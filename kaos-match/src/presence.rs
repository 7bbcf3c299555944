//! Match presences and the presence directory.
//!
//! The directory records *admitted* membership only. A successful join
//! attempt does not add anything here; the registry adds the presence once
//! the admission is committed, and removes it on leave or kick.

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One connected participant's session within a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub username: String,
    pub node: String,
}

impl Presence {
    pub fn new(user_id: Uuid, session_id: Uuid, username: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            user_id,
            session_id,
            username: username.into(),
            node: node.into(),
        }
    }

    pub fn id(&self) -> PresenceId {
        PresenceId {
            session_id: self.session_id,
            node: self.node.clone(),
        }
    }
}

/// Recipient key of a presence: `(session_id, node)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PresenceId {
    pub session_id: Uuid,
    pub node: String,
}

impl PresenceId {
    pub fn new(session_id: Uuid, node: impl Into<String>) -> Self {
        Self {
            session_id,
            node: node.into(),
        }
    }
}

impl From<&Presence> for PresenceId {
    fn from(presence: &Presence) -> Self {
        presence.id()
    }
}

/// Stream kinds tracked by the cluster presence service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    MatchRelayed,
    MatchAuthoritative,
}

/// Stream identifying a match for kick and tracking calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PresenceStream {
    pub mode: StreamMode,
    pub subject: Uuid,
    pub label: String,
}

impl PresenceStream {
    pub fn authoritative(match_id: Uuid, node: impl Into<String>) -> Self {
        Self {
            mode: StreamMode::MatchAuthoritative,
            subject: match_id,
            label: node.into(),
        }
    }
}

/// Ordered set of admitted presences keyed by [`PresenceId`].
///
/// Reads from the tick thread and writes from the registry may happen
/// concurrently.
#[derive(Debug, Default)]
pub struct PresenceDirectory {
    presences: RwLock<IndexMap<PresenceId, Presence>>,
}

impl PresenceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an admitted presence. Returns false if `(session_id, node)` is already present.
    pub fn add(&self, presence: Presence) -> bool {
        let mut presences = self.presences.write();
        let id = presence.id();
        if presences.contains_key(&id) {
            return false;
        }
        presences.insert(id, presence);
        true
    }

    /// Remove a presence, keeping the order of the remaining entries.
    pub fn remove(&self, id: &PresenceId) -> Option<Presence> {
        self.presences.write().shift_remove(id)
    }

    pub fn contains(&self, id: &PresenceId) -> bool {
        self.presences.read().contains_key(id)
    }

    pub fn get(&self, id: &PresenceId) -> Option<Presence> {
        self.presences.read().get(id).cloned()
    }

    /// Snapshot of member ids in admission order.
    pub fn list_presence_ids(&self) -> Vec<PresenceId> {
        self.presences.read().keys().cloned().collect()
    }

    /// Snapshot of full presences in admission order.
    pub fn list(&self) -> Vec<Presence> {
        self.presences.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.presences.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.presences.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence(name: &str, node: &str) -> Presence {
        Presence::new(Uuid::new_v4(), Uuid::new_v4(), name, node)
    }

    #[test]
    fn test_add_rejects_duplicate_key() {
        let dir = PresenceDirectory::new();
        let p = presence("alice", "node-1");

        assert!(dir.add(p.clone()));
        let mut renamed = p.clone();
        renamed.username = "alice2".to_string();
        assert!(!dir.add(renamed));
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.get(&p.id()).unwrap().username, "alice");
    }

    #[test]
    fn test_same_session_on_other_node_is_distinct() {
        let dir = PresenceDirectory::new();
        let p = presence("alice", "node-1");
        let mut other = p.clone();
        other.node = "node-2".to_string();

        assert!(dir.add(p));
        assert!(dir.add(other));
        assert_eq!(dir.len(), 2);
    }

    #[test]
    fn test_listing_is_ordered_snapshot() {
        let dir = PresenceDirectory::new();
        let a = presence("a", "n");
        let b = presence("b", "n");
        let c = presence("c", "n");
        dir.add(a.clone());
        dir.add(b.clone());
        dir.add(c.clone());

        dir.remove(&b.id());
        let mut ids = dir.list_presence_ids();
        assert_eq!(ids, vec![a.id(), c.id()]);

        ids.clear();
        assert_eq!(dir.len(), 2);
        assert!(dir.contains(&a.id()));
        assert!(!dir.contains(&b.id()));
    }
}
