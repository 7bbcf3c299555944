//! Broadcast authorization.
//!
//! Resolves a handler's requested recipient set against the live
//! [`PresenceDirectory`] so traffic never reaches a departed or foreign
//! session, and builds the outbound envelope. Delivery is left to the caller.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::envelope::{Envelope, MatchData, UserPresence};
use crate::error::{MatchError, Result};
use crate::presence::{Presence, PresenceDirectory, PresenceId};

/// A handler's broadcast request, in marshaled form.
///
/// `filter` and `sender` carry whatever the handler passed; they are only
/// validated by [`BroadcastAuthorizer::resolve`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastRequest {
    pub op_code: i64,
    pub data: Option<Vec<u8>>,
    pub filter: Option<Value>,
    pub sender: Option<Value>,
    pub reliable: Option<bool>,
}

impl BroadcastRequest {
    pub fn new(op_code: i64, data: Option<Vec<u8>>) -> Self {
        Self {
            op_code,
            data,
            ..Default::default()
        }
    }

    /// Restrict delivery to the given presences.
    pub fn to(mut self, ids: &[PresenceId]) -> Self {
        let entries = ids
            .iter()
            .map(|id| {
                serde_json::json!({
                    "session_id": id.session_id.to_string(),
                    "node_id": id.node,
                })
            })
            .collect();
        self.filter = Some(Value::Array(entries));
        self
    }

    pub fn from_sender(mut self, sender: &Presence) -> Self {
        self.sender = Some(serde_json::json!({
            "user_id": sender.user_id.to_string(),
            "session_id": sender.session_id.to_string(),
            "username": sender.username,
        }));
        self
    }

    pub fn reliable(mut self, reliable: bool) -> Self {
        self.reliable = Some(reliable);
        self
    }
}

/// Outcome of a successful resolution with at least one recipient.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBroadcast {
    pub recipients: Vec<PresenceId>,
    pub envelope: Envelope,
    pub reliable: bool,
}

/// Broadcast and kick validation bound to one match.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastAuthorizer<'a> {
    match_id: &'a str,
    directory: &'a PresenceDirectory,
    stopped: &'a AtomicBool,
}

impl<'a> BroadcastAuthorizer<'a> {
    pub fn new(match_id: &'a str, directory: &'a PresenceDirectory, stopped: &'a AtomicBool) -> Self {
        Self {
            match_id,
            directory,
            stopped,
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(MatchError::Stopped);
        }
        Ok(())
    }

    /// Resolve recipients and build the envelope. `Ok(None)` means there is
    /// nothing to send: an empty filter, or no requested recipient is a member.
    pub fn resolve(&self, request: &BroadcastRequest) -> Result<Option<ResolvedBroadcast>> {
        self.ensure_running()?;

        let filter = parse_filter(request.filter.as_ref())?;
        if matches!(&filter, Some(ids) if ids.is_empty()) {
            return Ok(None);
        }

        let sender = parse_sender(request.sender.as_ref())?;

        let recipients = match filter {
            Some(requested) => {
                let resolved = self.reconcile(requested);
                if resolved.is_empty() {
                    return Ok(None);
                }
                resolved
            }
            None => self.directory.list_presence_ids(),
        };

        let reliable = request.reliable.unwrap_or(true);
        let envelope = Envelope::MatchData(MatchData {
            match_id: self.match_id.to_string(),
            presence: sender,
            op_code: request.op_code,
            data: request.data.clone(),
            reliable,
        });

        Ok(Some(ResolvedBroadcast {
            recipients,
            envelope,
            reliable,
        }))
    }

    /// Keep requested ids that are current members, in request order, once each.
    fn reconcile(&self, requested: Vec<PresenceId>) -> Vec<PresenceId> {
        if requested.len() == 1 {
            return requested.into_iter().filter(|id| self.directory.contains(id)).collect();
        }

        let members: HashSet<PresenceId> = self.directory.list_presence_ids().into_iter().collect();
        let mut seen = HashSet::with_capacity(requested.len());
        requested
            .into_iter()
            .filter(|id| members.contains(id) && seen.insert(id.clone()))
            .collect()
    }

    /// Validate kick targets. `Ok(None)` for an absent input.
    pub fn kick_targets(&self, presences: &Value) -> Result<Option<Vec<Presence>>> {
        self.ensure_running()?;

        let entries: &[Value] = match presences {
            Value::Null => return Ok(None),
            Value::Array(entries) => entries.as_slice(),
            Value::Object(map) if map.is_empty() => &[],
            _ => return Err(MatchError::protocol("expects an array of presence objects")),
        };

        entries
            .iter()
            .map(|entry| {
                let map = entry
                    .as_object()
                    .ok_or_else(|| MatchError::protocol("expects a valid set of presences"))?;
                let user_id = parse_user_id(map)?;
                let id = parse_presence_id(map)?;
                Ok(Presence::new(user_id, id.session_id, String::new(), id.node))
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    /// Gate for label updates and other stopped-sensitive calls.
    pub fn check_running(&self) -> Result<()> {
        self.ensure_running()
    }
}

fn parse_filter(filter: Option<&Value>) -> Result<Option<Vec<PresenceId>>> {
    let entries: &[Value] = match filter {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Array(entries)) => entries.as_slice(),
        // Scripting hosts cannot tell an empty list from an empty map.
        Some(Value::Object(map)) if map.is_empty() => &[],
        Some(_) => return Err(MatchError::protocol("expects an array of presences or nil")),
    };

    entries
        .iter()
        .map(|entry| {
            let map = entry
                .as_object()
                .ok_or_else(|| MatchError::protocol("expects a valid set of presences"))?;
            parse_presence_id(map)
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

fn parse_presence_id(map: &Map<String, Value>) -> Result<PresenceId> {
    let session_id = parse_uuid_field(map, "session_id")?;
    let node = match map.get("node_id") {
        None | Some(Value::Null) => return Err(MatchError::protocol("expects presence to contain a 'node_id'")),
        Some(Value::String(node)) => node.clone(),
        Some(_) => return Err(MatchError::protocol("expects a 'node_id' string")),
    };
    Ok(PresenceId::new(session_id, node))
}

fn parse_user_id(map: &Map<String, Value>) -> Result<Uuid> {
    parse_uuid_field(map, "user_id")
}

fn parse_uuid_field(map: &Map<String, Value>, field: &str) -> Result<Uuid> {
    let raw = match map.get(field) {
        None | Some(Value::Null) => {
            return Err(MatchError::protocol(format!("presence is expected to contain a '{}'", field)))
        }
        Some(Value::String(s)) => s,
        Some(_) => return Err(MatchError::protocol(format!("expects a '{}' string", field))),
    };
    Uuid::parse_str(raw).map_err(|_| MatchError::protocol(format!("expects a valid '{}'", field)))
}

fn parse_sender(sender: Option<&Value>) -> Result<Option<UserPresence>> {
    let map = match sender {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Object(map)) => map,
        Some(_) => return Err(MatchError::protocol("expects sender to be an object")),
    };

    let user_id = parse_user_id(map)?;
    let session_id = parse_uuid_field(map, "session_id")?;
    let username = match map.get("username") {
        None | Some(Value::Null) => {
            return Err(MatchError::protocol("presence is expected to contain a 'username'"))
        }
        Some(Value::String(s)) => s.clone(),
        Some(_) => return Err(MatchError::protocol("expects a 'username' string")),
    };

    Ok(Some(UserPresence {
        user_id: user_id.to_string(),
        session_id: session_id.to_string(),
        username,
    }))
}
