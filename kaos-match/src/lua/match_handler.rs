//! Lua-based match handler implementation.
//!
//! `LuaMatchHandler` delegates each lifecycle call to a function of a module
//! registered with `kaos.register_match`:
//! - `match_init(ctx, params)` -> `{state, tick_rate, label}`
//! - `match_join_attempt(ctx, dispatcher, tick, state, presence, metadata)` -> `{state, accept, reject_msg}`
//! - `match_join(ctx, dispatcher, tick, state, presences)` -> `{state}`
//! - `match_leave(ctx, dispatcher, tick, state, presences)` -> `{state}`
//! - `match_loop(ctx, dispatcher, tick, state, messages)` -> `{state}` or nil
//! - `match_terminate(ctx, dispatcher, tick, state, grace_seconds)` -> `{state}`
//!
//! The dispatcher table only lives for the duration of the call it is passed to.
//!
//! Game state stays inside the VM between calls, so sparse tables and binary
//! strings reach the next call unchanged. The JSON the core receives is a copy.

use mlua::{Function, Lua, MultiValue, RegistryKey, Scope, Table, Value};
use serde_json::json;

use crate::broadcast::BroadcastRequest;
use crate::context::{JoinCandidate, MatchContext};
use crate::error::{MatchError, Result};
use crate::handler::{MatchDispatcher, MatchHandler};
use crate::presence::Presence;
use crate::queue::InboundMessage;

use super::api::{json_to_lua, lua_to_json, lua_to_json_lossy};
use super::LuaRuntime;

/// Functions every registered match module must define.
pub const MATCH_FUNCTIONS: [&str; 6] = [
    "match_init",
    "match_join_attempt",
    "match_join",
    "match_leave",
    "match_loop",
    "match_terminate",
];

type BroadcastArgs = (i64, Option<mlua::String>, Value, Value, Option<bool>);

/// A match handler that delegates to Lua scripts.
pub struct LuaMatchHandler {
    runtime: LuaRuntime,
    module_name: String,
    module: Table,
    /// Last `state` returned by the script.
    state: Option<RegistryKey>,
}

impl LuaMatchHandler {
    /// Bind to a module already registered in `runtime`.
    pub fn new(runtime: LuaRuntime, module: impl Into<String>) -> Result<Self> {
        let module_name = module.into();
        let module = runtime
            .match_module(&module_name)?
            .ok_or_else(|| MatchError::handler(format!("match handler '{}' not registered", module_name)))?;

        for name in MATCH_FUNCTIONS {
            let f: Value = module.get(name)?;
            if !f.is_function() {
                return Err(MatchError::handler(format!(
                    "{} function not found in match handler '{}'",
                    name, module_name
                )));
            }
        }

        Ok(Self {
            runtime,
            module_name,
            module,
            state: None,
        })
    }

    pub fn module(&self) -> &str {
        &self.module_name
    }

    pub fn runtime(&self) -> &LuaRuntime {
        &self.runtime
    }

    /// The state handed to the script: the VM's own copy once one exists.
    fn state_arg(&self, lua: &Lua, state: &serde_json::Value) -> mlua::Result<Value> {
        match &self.state {
            Some(key) => lua.registry_value(key),
            None => json_to_lua(lua, state),
        }
    }

    /// `args` receives the resolved state (nil for init).
    fn call(
        &mut self,
        name: &'static str,
        ctx: &MatchContext,
        dispatcher: Option<&dyn MatchDispatcher>,
        state: Option<&serde_json::Value>,
        args: impl FnOnce(&Lua, Value) -> mlua::Result<Vec<Value>>,
    ) -> Result<serde_json::Value> {
        let lua = self.runtime.lua();
        let func: Function = self.module.get(name)?;
        let ctx_value = json_to_lua(lua, &serde_json::to_value(ctx)?)?;
        let state_value = match state {
            Some(state) => self.state_arg(lua, state)?,
            None => Value::Nil,
        };
        let rest = args(lua, state_value)?;

        self.runtime.reset_budget();
        let result: Value = match dispatcher {
            None => {
                let mut all = Vec::with_capacity(rest.len() + 1);
                all.push(ctx_value);
                all.extend(rest);
                func.call::<Value>(MultiValue::from_vec(all))
            }
            Some(dispatcher) => lua.scope(|scope| {
                let table = dispatcher_table(lua, scope, dispatcher)?;
                let mut all = Vec::with_capacity(rest.len() + 2);
                all.push(ctx_value);
                all.push(Value::Table(table));
                all.extend(rest);
                func.call::<Value>(MultiValue::from_vec(all))
            }),
        }
        .map_err(MatchError::from_lua)?;

        let json = result_to_json(&result).map_err(|e| match MatchError::from_lua(e) {
            MatchError::Protocol(reason) => MatchError::protocol(format!("{} in '{}': {}", name, self.module_name, reason)),
            other => MatchError::protocol(format!(
                "{} in '{}' returned an unconvertible value: {}",
                name, self.module_name, other
            )),
        })?;

        if let Value::Table(t) = &result {
            let next: Value = t.raw_get("state")?;
            if !next.is_nil() {
                self.state = Some(lua.create_registry_value(next)?);
            }
        }
        Ok(json)
    }
}

/// Lifecycle results convert strictly, except `state`, whose authoritative
/// copy stays in the VM.
fn result_to_json(result: &Value) -> mlua::Result<serde_json::Value> {
    let Value::Table(t) = result else {
        return lua_to_json(result);
    };
    let mut map = serde_json::Map::new();
    for pair in t.clone().pairs::<Value, Value>() {
        let (k, v) = pair?;
        let Value::String(key) = k else {
            return lua_to_json(result);
        };
        let key = String::from(key.to_string_lossy());
        let value = if key == "state" { lua_to_json_lossy(&v)? } else { lua_to_json(&v)? };
        map.insert(key, value);
    }
    Ok(serde_json::Value::Object(map))
}

fn dispatcher_table<'scope, 'env: 'scope>(
    lua: &Lua,
    scope: &'scope Scope<'scope, 'env>,
    dispatcher: &'env dyn MatchDispatcher,
) -> mlua::Result<Table> {
    let table = lua.create_table()?;

    table.set(
        "broadcast_message",
        scope.create_function(move |_, args: BroadcastArgs| {
            dispatcher
                .broadcast_message(broadcast_request(args)?)
                .map_err(MatchError::into_lua)
        })?,
    )?;
    table.set(
        "broadcast_message_deferred",
        scope.create_function(move |_, args: BroadcastArgs| {
            dispatcher
                .broadcast_message_deferred(broadcast_request(args)?)
                .map_err(MatchError::into_lua)
        })?,
    )?;
    table.set(
        "match_kick",
        scope.create_function(move |_, presences: Value| {
            dispatcher
                .match_kick(&lua_to_json(&presences)?)
                .map_err(MatchError::into_lua)
        })?,
    )?;
    table.set(
        "match_label_update",
        scope.create_function(move |_, label: String| {
            dispatcher
                .match_label_update(&label)
                .map_err(MatchError::into_lua)
        })?,
    )?;

    Ok(table)
}

fn broadcast_request((op_code, data, presences, sender, reliable): BroadcastArgs) -> mlua::Result<BroadcastRequest> {
    Ok(BroadcastRequest {
        op_code,
        data: data.map(|d| d.as_bytes().to_vec()),
        filter: optional_json(&presences)?,
        sender: optional_json(&sender)?,
        reliable,
    })
}

fn optional_json(value: &Value) -> mlua::Result<Option<serde_json::Value>> {
    if value.is_nil() {
        Ok(None)
    } else {
        lua_to_json(value).map(Some)
    }
}

/// `node_id` mirrors `node` so a presence can be handed straight back as a
/// broadcast or kick target.
fn presence_json(presence: &Presence) -> serde_json::Value {
    json!({
        "user_id": presence.user_id.to_string(),
        "session_id": presence.session_id.to_string(),
        "username": presence.username,
        "node": presence.node,
        "node_id": presence.node,
    })
}

fn presences_to_lua(lua: &Lua, presences: &[Presence]) -> mlua::Result<Value> {
    let list = serde_json::Value::Array(presences.iter().map(presence_json).collect());
    json_to_lua(lua, &list)
}

fn messages_to_lua(lua: &Lua, messages: &[InboundMessage]) -> mlua::Result<Value> {
    let list = lua.create_table_with_capacity(messages.len(), 0)?;
    for (i, msg) in messages.iter().enumerate() {
        let entry = lua.create_table()?;
        entry.set("sender", json_to_lua(lua, &presence_json(&msg.sender))?)?;
        entry.set("op_code", msg.op_code)?;
        if let Some(ref data) = msg.data {
            entry.set("data", lua.create_string(data)?)?;
        }
        entry.set("reliable", msg.reliable)?;
        entry.set("receive_time_ms", msg.receive_time_ms)?;
        list.set(i + 1, entry)?;
    }
    Ok(Value::Table(list))
}

impl MatchHandler for LuaMatchHandler {
    fn init(&mut self, ctx: &MatchContext, params: &serde_json::Value) -> Result<serde_json::Value> {
        self.state = None;
        self.call("match_init", ctx, None, None, |lua, _| Ok(vec![json_to_lua(lua, params)?]))
    }

    fn join_attempt(
        &mut self,
        ctx: &MatchContext,
        dispatcher: &dyn MatchDispatcher,
        tick: i64,
        state: &serde_json::Value,
        candidate: &JoinCandidate,
        metadata: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.call("match_join_attempt", ctx, Some(dispatcher), Some(state), |lua, state| {
            Ok(vec![
                Value::Integer(tick),
                state,
                json_to_lua(lua, &presence_json(&candidate.presence))?,
                json_to_lua(lua, metadata)?,
            ])
        })
    }

    fn join(
        &mut self,
        ctx: &MatchContext,
        dispatcher: &dyn MatchDispatcher,
        tick: i64,
        state: &serde_json::Value,
        presences: &[Presence],
    ) -> Result<serde_json::Value> {
        self.call("match_join", ctx, Some(dispatcher), Some(state), |lua, state| {
            Ok(vec![
                Value::Integer(tick),
                state,
                presences_to_lua(lua, presences)?,
            ])
        })
    }

    fn leave(
        &mut self,
        ctx: &MatchContext,
        dispatcher: &dyn MatchDispatcher,
        tick: i64,
        state: &serde_json::Value,
        presences: &[Presence],
    ) -> Result<serde_json::Value> {
        self.call("match_leave", ctx, Some(dispatcher), Some(state), |lua, state| {
            Ok(vec![
                Value::Integer(tick),
                state,
                presences_to_lua(lua, presences)?,
            ])
        })
    }

    fn tick(
        &mut self,
        ctx: &MatchContext,
        dispatcher: &dyn MatchDispatcher,
        tick: i64,
        state: &serde_json::Value,
        messages: &[InboundMessage],
    ) -> Result<serde_json::Value> {
        self.call("match_loop", ctx, Some(dispatcher), Some(state), |lua, state| {
            Ok(vec![
                Value::Integer(tick),
                state,
                messages_to_lua(lua, messages)?,
            ])
        })
    }

    fn terminate(
        &mut self,
        ctx: &MatchContext,
        dispatcher: &dyn MatchDispatcher,
        tick: i64,
        state: &serde_json::Value,
        grace_seconds: i64,
    ) -> Result<serde_json::Value> {
        self.call("match_terminate", ctx, Some(dispatcher), Some(state), |_, state| {
            Ok(vec![
                Value::Integer(tick),
                state,
                Value::Integer(grace_seconds),
            ])
        })
    }
}
