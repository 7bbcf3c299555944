//! In-memory match registry.
//!
//! Creates matches, owns each match's [`PresenceDirectory`] (the only place
//! presences are added or removed), admits joins through the match's
//! JoinAttempt, routes inbound data from members, and keeps the label index
//! used for listing.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::KaosMatchConfig;
use crate::context::{match_id_string, JoinCandidate};
use crate::core::{JoinAttemptOutcome, MatchCore};
use crate::error::{MatchError, Result};
use crate::handler::MatchHandler;
use crate::presence::{Presence, PresenceDirectory, PresenceId, PresenceStream};
use crate::queue::InboundMessage;
use crate::router::{MatchRegistry, MessageRouter};
use crate::runner::{MatchHandle, MatchRunner};

#[cfg(feature = "metrics")]
use crate::metrics::MatchMetrics;

struct MatchEntry {
    handle: Arc<MatchHandle>,
    directory: Arc<PresenceDirectory>,
}

/// Single-node registry of running matches.
pub struct LocalMatchRegistry {
    node: String,
    env: HashMap<String, String>,
    queue_capacity: usize,
    join_timeout: Duration,
    default_grace_seconds: i64,
    router: Arc<dyn MessageRouter>,
    matches: DashMap<Uuid, MatchEntry>,
    labels: DashMap<Uuid, String>,
    this: Weak<LocalMatchRegistry>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MatchMetrics>>,
}

/// What a match core holds: a non-owning link back to the registry.
struct RegistryLink(Weak<LocalMatchRegistry>);

impl MatchRegistry for RegistryLink {
    fn kick(&self, stream: &PresenceStream, presences: Vec<Presence>) {
        if let Some(registry) = self.0.upgrade() {
            registry.kick(stream, presences);
        }
    }

    fn update_match_label(&self, match_id: Uuid, label: &str) -> Result<()> {
        match self.0.upgrade() {
            Some(registry) => registry.update_match_label(match_id, label),
            None => Err(MatchError::Registry("registry has shut down".into())),
        }
    }
}

impl LocalMatchRegistry {
    pub fn new(node: impl Into<String>, router: Arc<dyn MessageRouter>) -> Arc<Self> {
        let mut config = KaosMatchConfig::default();
        config.node.name = node.into();
        Self::from_config(&config, router)
    }

    pub fn from_config(config: &KaosMatchConfig, router: Arc<dyn MessageRouter>) -> Arc<Self> {
        Self::build(
            config,
            router,
            #[cfg(feature = "metrics")]
            None,
        )
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(config: &KaosMatchConfig, router: Arc<dyn MessageRouter>, metrics: Arc<MatchMetrics>) -> Arc<Self> {
        Self::build(config, router, Some(metrics))
    }

    fn build(
        config: &KaosMatchConfig,
        router: Arc<dyn MessageRouter>,
        #[cfg(feature = "metrics")] metrics: Option<Arc<MatchMetrics>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            node: config.node.name.clone(),
            env: config.environment.clone(),
            queue_capacity: config.matches.input_queue_size.max(1),
            join_timeout: Duration::from_millis(config.matches.join_attempt_timeout_ms),
            default_grace_seconds: config.matches.default_grace_seconds,
            router,
            matches: DashMap::new(),
            labels: DashMap::new(),
            this: this.clone(),
            #[cfg(feature = "metrics")]
            metrics,
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Create a match and run its Init. Returns the `<uuid>.<node>` id.
    pub fn create_match(&self, handler: Box<dyn MatchHandler>, params: Value) -> Result<String> {
        let id = Uuid::new_v4();
        let directory = Arc::new(PresenceDirectory::new());
        let link: Arc<dyn MatchRegistry> = Arc::new(RegistryLink(self.this.clone()));

        let core = MatchCore::new(id, self.node.clone(), handler, self.router.clone(), link)
            .with_env(self.env.clone())
            .with_queue_capacity(self.queue_capacity);
        #[cfg(feature = "metrics")]
        let core = match &self.metrics {
            Some(metrics) => core.with_metrics(metrics.clone()),
            None => core,
        };
        let runner = MatchRunner::new(core, self.router.clone(), directory.clone());
        #[cfg(feature = "metrics")]
        let runner = match &self.metrics {
            Some(metrics) => runner.with_metrics(metrics.clone()),
            None => runner,
        };

        // Reserved before Init so ticks that relabel early find their entry.
        self.labels.insert(id, String::new());
        let handle = match runner.spawn(params) {
            Ok(handle) => handle,
            Err(e) => {
                self.labels.remove(&id);
                return Err(e);
            }
        };
        if let Some(mut label) = self.labels.get_mut(&id) {
            if label.is_empty() {
                *label = handle.label();
            }
        }
        self.matches.insert(
            id,
            MatchEntry {
                handle: Arc::new(handle),
                directory,
            },
        );

        let match_id = match_id_string(id, &self.node);
        info!(match_id = %match_id, "match created");
        Ok(match_id)
    }

    /// Split `<uuid>.<node>` and check it names a match on this node.
    fn parse_match_id(&self, match_id: &str) -> Result<Uuid> {
        let (id, node) = match_id
            .split_once('.')
            .ok_or_else(|| MatchError::not_found(match_id))?;
        if node != self.node {
            return Err(MatchError::not_found(match_id));
        }
        Uuid::parse_str(id).map_err(|_| MatchError::not_found(match_id))
    }

    fn entry(&self, match_id: &str) -> Result<(Arc<MatchHandle>, Arc<PresenceDirectory>)> {
        let id = self.parse_match_id(match_id)?;
        self.matches
            .get(&id)
            .map(|e| (e.handle.clone(), e.directory.clone()))
            .ok_or_else(|| MatchError::not_found(match_id))
    }

    /// Run JoinAttempt; on acceptance add the presence and deliver Join.
    pub fn join_attempt(&self, match_id: &str, candidate: JoinCandidate, metadata: Value) -> Result<JoinAttemptOutcome> {
        let (handle, directory) = self.entry(match_id)?;
        let presence = candidate.presence.clone();

        let outcome = handle.join_attempt(candidate, metadata, self.join_timeout)?;
        if outcome.accepted {
            if directory.add(presence.clone()) {
                handle.join(vec![presence])?;
            } else {
                debug!(match_id, session_id = %presence.session_id, "presence already joined");
            }
        }
        Ok(outcome)
    }

    /// Remove a presence and deliver Leave. Unknown presences are ignored.
    pub fn leave(&self, match_id: &str, presence_id: &PresenceId) -> Result<()> {
        let (handle, directory) = self.entry(match_id)?;
        if let Some(presence) = directory.remove(presence_id) {
            handle.leave(vec![presence])?;
        }
        Ok(())
    }

    /// Route a participant's message into the match queue. Messages from
    /// non-members are dropped and `false` is returned.
    pub fn send_data(&self, match_id: &str, message: InboundMessage) -> Result<bool> {
        let (handle, directory) = self.entry(match_id)?;
        if !directory.contains(&message.sender.id()) {
            debug!(match_id, session_id = %message.sender.session_id, "dropping data from non-member");
            return Ok(false);
        }
        handle.sender().send(message)?;
        Ok(true)
    }

    /// Terminate and forget a match.
    pub fn stop(&self, match_id: &str, grace_seconds: Option<i64>) -> Result<()> {
        let id = self.parse_match_id(match_id)?;
        let (_, entry) = self
            .matches
            .remove(&id)
            .ok_or_else(|| MatchError::not_found(match_id))?;
        // Terminate may still relabel, so the entry goes once the thread is done.
        let result = entry.handle.stop(grace_seconds.unwrap_or(self.default_grace_seconds));
        self.labels.remove(&id);
        result
    }

    /// Forget matches whose thread has already stopped.
    pub fn remove_stopped(&self) -> usize {
        let stopped: Vec<Uuid> = self
            .matches
            .iter()
            .filter(|e| e.value().handle.is_stopped())
            .map(|e| *e.key())
            .collect();
        for id in &stopped {
            if let Some((_, entry)) = self.matches.remove(id) {
                if let Err(e) = entry.handle.stop(0) {
                    warn!(match_id = %entry.handle.match_id(), error = %e, "error reaping match");
                }
                self.labels.remove(id);
            }
        }
        stopped.len()
    }

    pub fn label(&self, match_id: &str) -> Option<String> {
        let id = self.parse_match_id(match_id).ok()?;
        self.labels.get(&id).map(|l| l.value().clone())
    }

    /// Running matches carrying exactly `label`.
    pub fn list_by_label(&self, label: &str) -> Vec<String> {
        self.labels
            .iter()
            .filter(|l| l.value() == label)
            .filter(|l| self.matches.get(l.key()).map(|e| !e.handle.is_stopped()).unwrap_or(false))
            .map(|l| match_id_string(*l.key(), &self.node))
            .collect()
    }

    pub fn presences(&self, match_id: &str) -> Result<Vec<Presence>> {
        self.entry(match_id).map(|(_, directory)| directory.list())
    }

    pub fn count(&self) -> usize {
        self.matches.len()
    }
}

impl MatchRegistry for LocalMatchRegistry {
    fn kick(&self, stream: &PresenceStream, presences: Vec<Presence>) {
        let Some((handle, directory)) = self
            .matches
            .get(&stream.subject)
            .map(|e| (e.handle.clone(), e.directory.clone()))
        else {
            return;
        };

        let removed: Vec<Presence> = presences
            .iter()
            .filter_map(|p| directory.remove(&p.id()))
            .collect();
        if removed.is_empty() {
            return;
        }
        debug!(match_id = %handle.match_id(), count = removed.len(), "kicked");
        if let Err(e) = handle.leave(removed) {
            warn!(match_id = %handle.match_id(), error = %e, "kick leave not delivered");
        }
    }

    /// Only matches still tracked here can be relabeled.
    fn update_match_label(&self, match_id: Uuid, label: &str) -> Result<()> {
        match self.labels.get_mut(&match_id) {
            Some(mut current) => {
                *current = label.to_string();
                Ok(())
            }
            None => Err(MatchError::not_found(match_id_string(match_id, &self.node))),
        }
    }
}

impl Drop for LocalMatchRegistry {
    fn drop(&mut self) {
        let ids: Vec<Uuid> = self.matches.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.matches.remove(&id) {
                let _ = entry.handle.stop(self.default_grace_seconds);
            }
        }
    }
}
