//! Outbound envelopes.

use serde::{Deserialize, Serialize};

use crate::presence::{Presence, PresenceId};

/// Error code sent to clients when a match is torn down by a handler failure.
pub const RUNTIME_EXCEPTION: i32 = 3;

/// Declared sender identity attached to match data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPresence {
    pub user_id: String,
    pub session_id: String,
    pub username: String,
}

impl From<&Presence> for UserPresence {
    fn from(p: &Presence) -> Self {
        Self {
            user_id: p.user_id.to_string(),
            session_id: p.session_id.to_string(),
            username: p.username.clone(),
        }
    }
}

/// Authoritative match data. `presence` is `None` for server-originated messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchData {
    pub match_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<UserPresence>,
    pub op_code: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    pub reliable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: i32,
    pub message: String,
}

/// Wire container for one outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Envelope {
    MatchData(MatchData),
    Error(ErrorMessage),
}

impl Envelope {
    pub fn match_data(&self) -> Option<&MatchData> {
        match self {
            Envelope::MatchData(data) => Some(data),
            _ => None,
        }
    }

    pub fn match_error(message: impl Into<String>) -> Self {
        Envelope::Error(ErrorMessage {
            code: RUNTIME_EXCEPTION,
            message: message.into(),
        })
    }
}

/// Broadcast whose delivery happens after the current tick's handler call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredMessage {
    pub presence_ids: Vec<PresenceId>,
    pub envelope: Envelope,
    pub reliable: bool,
}
