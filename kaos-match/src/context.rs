//! Per-call handler context.
//!
//! A [`MatchContext`] is built fresh for every lifecycle call from the core's
//! fixed fields plus per-call additions. Handlers only ever see it by shared
//! reference.

use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

use crate::presence::Presence;

pub const EXECUTION_MODE_MATCH: &str = "match";

/// Caller identity attached to a join attempt.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CallerIdentity {
    pub user_id: String,
    pub username: String,
    pub session_id: String,
    pub user_session_exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vars: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_port: Option<String>,
}

/// Immutable view of the match handed to a handler call.
#[derive(Debug, Clone, Serialize)]
pub struct MatchContext {
    pub env: HashMap<String, String>,
    pub execution_mode: &'static str,
    pub match_id: String,
    pub match_node: String,
    pub match_label: String,
    /// Zero until Init has fixed the tick rate.
    pub match_tick_rate: u32,
    #[serde(flatten)]
    pub caller: Option<CallerIdentity>,
}

impl MatchContext {
    pub fn new(match_id: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            env: HashMap::new(),
            execution_mode: EXECUTION_MODE_MATCH,
            match_id: match_id.into(),
            match_node: node.into(),
            match_label: String::new(),
            match_tick_rate: 0,
            caller: None,
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.match_label = label.into();
        self
    }

    pub fn with_tick_rate(mut self, tick_rate: u32) -> Self {
        self.match_tick_rate = tick_rate;
        self
    }

    pub fn with_caller(mut self, caller: CallerIdentity) -> Self {
        self.caller = Some(caller);
        self
    }
}

/// A prospective participant presented to JoinAttempt.
#[derive(Debug, Clone)]
pub struct JoinCandidate {
    pub presence: Presence,
    pub session_expiry: i64,
    pub vars: Option<HashMap<String, String>>,
    pub client_ip: String,
    pub client_port: String,
}

impl JoinCandidate {
    pub fn new(presence: Presence) -> Self {
        Self {
            presence,
            session_expiry: 0,
            vars: None,
            client_ip: String::new(),
            client_port: String::new(),
        }
    }

    pub fn with_vars(mut self, vars: HashMap<String, String>) -> Self {
        self.vars = Some(vars);
        self
    }

    pub fn with_client(mut self, ip: impl Into<String>, port: impl Into<String>) -> Self {
        self.client_ip = ip.into();
        self.client_port = port.into();
        self
    }

    pub fn with_session_expiry(mut self, expiry: i64) -> Self {
        self.session_expiry = expiry;
        self
    }

    pub fn caller_identity(&self) -> CallerIdentity {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        CallerIdentity {
            user_id: self.presence.user_id.to_string(),
            username: self.presence.username.clone(),
            session_id: self.presence.session_id.to_string(),
            user_session_exp: self.session_expiry,
            vars: self.vars.clone(),
            client_ip: non_empty(&self.client_ip),
            client_port: non_empty(&self.client_port),
        }
    }
}

/// Match handle string: `<uuid>.<node>`.
pub fn match_id_string(id: Uuid, node: &str) -> String {
    format!("{}.{}", id, node)
}
