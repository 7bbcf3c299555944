//! Handler Host capability.
//!
//! Game logic plugs into the match core through [`MatchHandler`]. A handler
//! returns its lifecycle results as raw JSON objects; the core validates them
//! (see [`crate::result`]) so every host, native or scripted, shares one
//! error surface.
//!
//! ## Example
//!
//! ```rust,ignore
//! use kaos_match::{BroadcastRequest, InboundMessage, MatchContext, MatchDispatcher, MatchHandler, Result};
//! use serde_json::{json, Value};
//!
//! struct Echo;
//!
//! impl MatchHandler for Echo {
//!     fn init(&mut self, _ctx: &MatchContext, _params: &Value) -> Result<Value> {
//!         Ok(json!({"state": {}, "tick_rate": 10, "label": "echo"}))
//!     }
//!
//!     fn tick(
//!         &mut self,
//!         _ctx: &MatchContext,
//!         dispatcher: &dyn MatchDispatcher,
//!         _tick: i64,
//!         state: &Value,
//!         messages: &[InboundMessage],
//!     ) -> Result<Value> {
//!         for msg in messages {
//!             dispatcher.broadcast_message(BroadcastRequest::new(msg.op_code, msg.data.clone()))?;
//!         }
//!         Ok(json!({"state": state}))
//!     }
//!
//!     // join_attempt, join, leave, terminate ...
//! }
//! ```

use serde_json::Value;

use crate::context::{JoinCandidate, MatchContext};
use crate::error::Result;
use crate::presence::Presence;
use crate::queue::InboundMessage;

pub use crate::broadcast::BroadcastRequest;

/// Side-effect surface handed to a handler for the duration of one call.
pub trait MatchDispatcher: Send + Sync {
    /// Send immediately through the router.
    fn broadcast_message(&self, request: BroadcastRequest) -> Result<()>;

    /// Hand the resolved message to the deferred-delivery function.
    fn broadcast_message_deferred(&self, request: BroadcastRequest) -> Result<()>;

    /// Kick presences (`[{user_id, session_id, node_id}]`); null is a no-op.
    fn match_kick(&self, presences: &Value) -> Result<()>;

    /// Update the discoverable label, registry first.
    fn match_label_update(&self, label: &str) -> Result<()>;
}

/// Game logic for one match instance.
///
/// Every call receives the current state and returns an object carrying the
/// replacement state. Calls are strictly sequential per match.
pub trait MatchHandler: Send {
    /// Returns `{state, tick_rate, label?}`.
    fn init(&mut self, ctx: &MatchContext, params: &Value) -> Result<Value>;

    /// Returns `{accept, reject_msg?, state}`.
    #[allow(clippy::too_many_arguments)]
    fn join_attempt(
        &mut self,
        ctx: &MatchContext,
        dispatcher: &dyn MatchDispatcher,
        tick: i64,
        state: &Value,
        candidate: &JoinCandidate,
        metadata: &Value,
    ) -> Result<Value>;

    /// Returns `{state}`.
    fn join(
        &mut self,
        ctx: &MatchContext,
        dispatcher: &dyn MatchDispatcher,
        tick: i64,
        state: &Value,
        presences: &[Presence],
    ) -> Result<Value>;

    /// Returns `{state}`.
    fn leave(
        &mut self,
        ctx: &MatchContext,
        dispatcher: &dyn MatchDispatcher,
        tick: i64,
        state: &Value,
        presences: &[Presence],
    ) -> Result<Value>;

    /// The per-tick loop. Returns `{state}`, or null to keep the state as is.
    fn tick(
        &mut self,
        ctx: &MatchContext,
        dispatcher: &dyn MatchDispatcher,
        tick: i64,
        state: &Value,
        messages: &[InboundMessage],
    ) -> Result<Value>;

    /// Returns `{state}`.
    fn terminate(
        &mut self,
        ctx: &MatchContext,
        dispatcher: &dyn MatchDispatcher,
        tick: i64,
        state: &Value,
        grace_seconds: i64,
    ) -> Result<Value>;
}

/// Dispatcher that accepts and discards everything.
pub struct NullDispatcher;

impl MatchDispatcher for NullDispatcher {
    fn broadcast_message(&self, _request: BroadcastRequest) -> Result<()> {
        Ok(())
    }

    fn broadcast_message_deferred(&self, _request: BroadcastRequest) -> Result<()> {
        Ok(())
    }

    fn match_kick(&self, _presences: &Value) -> Result<()> {
        Ok(())
    }

    fn match_label_update(&self, _label: &str) -> Result<()> {
        Ok(())
    }
}
