//! Router and registry collaborators.
//!
//! The core never delivers envelopes or touches cluster bookkeeping itself; it
//! calls out through these traits. [`LocalRouter`] is the in-process router
//! used when embedding a single node and in tests.

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::envelope::{DeferredMessage, Envelope};
use crate::error::Result;
use crate::presence::{Presence, PresenceId, PresenceStream};

/// Deferred-delivery function bound to a match at Init.
pub type DeferFn = Arc<dyn Fn(DeferredMessage) -> Result<()> + Send + Sync>;

/// Delivers envelopes to sessions. Fire-and-forget: failures are the
/// router's to log.
pub trait MessageRouter: Send + Sync {
    fn send_to_presence_ids(&self, presence_ids: &[PresenceId], envelope: &Envelope, reliable: bool);
}

/// Cluster-wide match bookkeeping the core calls into from handler calls.
pub trait MatchRegistry: Send + Sync {
    /// Remove presences from the match stream.
    fn kick(&self, stream: &PresenceStream, presences: Vec<Presence>);

    /// Record a new label for discovery.
    fn update_match_label(&self, match_id: Uuid, label: &str) -> Result<()>;
}

/// One envelope waiting in a session outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub envelope: Envelope,
    pub reliable: bool,
}

/// In-memory router keeping one outbox per presence.
#[derive(Debug, Default)]
pub struct LocalRouter {
    outboxes: DashMap<PresenceId, Vec<Outbound>>,
}

impl LocalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take everything delivered to `id` so far.
    pub fn take(&self, id: &PresenceId) -> Vec<Outbound> {
        self.outboxes.remove(id).map(|(_, out)| out).unwrap_or_default()
    }

    pub fn pending(&self, id: &PresenceId) -> usize {
        self.outboxes.get(id).map(|out| out.len()).unwrap_or(0)
    }

    pub fn total_pending(&self) -> usize {
        self.outboxes.iter().map(|r| r.value().len()).sum()
    }

    /// Deliver a deferred message.
    pub fn deliver(&self, message: DeferredMessage) {
        self.send_to_presence_ids(&message.presence_ids, &message.envelope, message.reliable);
    }
}

impl MessageRouter for LocalRouter {
    fn send_to_presence_ids(&self, presence_ids: &[PresenceId], envelope: &Envelope, reliable: bool) {
        for id in presence_ids {
            self.outboxes.entry(id.clone()).or_default().push(Outbound {
                envelope: envelope.clone(),
                reliable,
            });
        }
        tracing::trace!(recipients = presence_ids.len(), "routed envelope");
    }
}
