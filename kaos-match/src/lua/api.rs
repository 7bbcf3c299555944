//! Lua API - kaos.* functions exposed to scripts.

use std::collections::HashMap;

use mlua::{Lua, Result as LuaResult, Table, Value};
use tracing::{debug, error, info, warn};

use crate::error::MatchError;
use crate::runtime::{self, codec, Event, RuntimeServices};

/// Global table holding modules registered through `kaos.register_match`.
pub(crate) const MATCH_HANDLERS: &str = "_match_handlers";

/// Lua API provider
pub struct LuaApi {
    services: RuntimeServices,
}

impl LuaApi {
    pub fn new(services: RuntimeServices) -> Self {
        Self { services }
    }

    /// Register all kaos.* functions and the global `json` table.
    pub fn register(&self, lua: &Lua) -> LuaResult<()> {
        let globals = lua.globals();
        let kaos = lua.create_table()?;

        globals.set(MATCH_HANDLERS, lua.create_table()?)?;

        // kaos.register_match(name, handler_table)
        let register_match = lua.create_function(|lua, (name, handler): (String, Table)| {
            let handlers: Table = lua.globals().get(MATCH_HANDLERS)?;
            handlers.set(name, handler)
        })?;
        kaos.set("register_match", register_match)?;

        kaos.set("uuid_v4", lua.create_function(|_, ()| Ok(runtime::uuid_v4()))?)?;
        kaos.set(
            "time_now",
            lua.create_function(|_, ()| Ok(crate::queue::now_millis()))?,
        )?;

        self.register_logger(lua, &kaos)?;
        self.register_codec(lua, &kaos)?;
        self.register_event(lua, &kaos)?;
        #[cfg(feature = "http")]
        self.register_http(lua, &kaos)?;
        #[cfg(feature = "postgres")]
        self.register_sql(lua, &kaos)?;

        globals.set("kaos", kaos)?;
        self.register_json(lua)
    }

    fn register_logger(&self, lua: &Lua, kaos: &Table) -> LuaResult<()> {
        kaos.set(
            "logger_debug",
            lua.create_function(|_, msg: String| {
                debug!(target: "kaos_match::lua", "{}", msg);
                Ok(())
            })?,
        )?;
        kaos.set(
            "logger_info",
            lua.create_function(|_, msg: String| {
                info!(target: "kaos_match::lua", "{}", msg);
                Ok(())
            })?,
        )?;
        kaos.set(
            "logger_warn",
            lua.create_function(|_, msg: String| {
                warn!(target: "kaos_match::lua", "{}", msg);
                Ok(())
            })?,
        )?;
        kaos.set(
            "logger_error",
            lua.create_function(|_, msg: String| {
                error!(target: "kaos_match::lua", "{}", msg);
                Ok(())
            })?,
        )?;
        Ok(())
    }

    fn register_codec(&self, lua: &Lua, kaos: &Table) -> LuaResult<()> {
        kaos.set(
            "base64_encode",
            lua.create_function(|_, (input, padding): (mlua::String, Option<bool>)| {
                Ok(codec::base64_encode(&input.as_bytes(), padding.unwrap_or(true)))
            })?,
        )?;
        kaos.set(
            "base64_decode",
            lua.create_function(|lua, (input, padding): (String, Option<bool>)| {
                let bytes = codec::base64_decode(&input, padding.unwrap_or(true)).map_err(MatchError::into_lua)?;
                lua.create_string(bytes)
            })?,
        )?;
        kaos.set(
            "base64_url_encode",
            lua.create_function(|_, (input, padding): (mlua::String, Option<bool>)| {
                Ok(codec::base64_url_encode(&input.as_bytes(), padding.unwrap_or(true)))
            })?,
        )?;
        kaos.set(
            "base64_url_decode",
            lua.create_function(|lua, (input, padding): (String, Option<bool>)| {
                let bytes =
                    codec::base64_url_decode(&input, padding.unwrap_or(true)).map_err(MatchError::into_lua)?;
                lua.create_string(bytes)
            })?,
        )?;
        kaos.set(
            "base16_encode",
            lua.create_function(|_, input: mlua::String| Ok(codec::base16_encode(&input.as_bytes())))?,
        )?;
        kaos.set(
            "base16_decode",
            lua.create_function(|lua, input: String| {
                let bytes = codec::base16_decode(&input).map_err(MatchError::into_lua)?;
                lua.create_string(bytes)
            })?,
        )?;
        Ok(())
    }

    fn register_event(&self, lua: &Lua, kaos: &Table) -> LuaResult<()> {
        let sink = self.services.events.clone();
        let event = lua.create_function(
            move |_, (name, properties, timestamp, external): (String, Option<Table>, Option<i64>, Option<bool>)| {
                let mut event = Event::new(name).external(external.unwrap_or(false));
                if let Some(ts) = timestamp {
                    event = event.at(ts);
                }
                if let Some(props) = properties {
                    let mut map = HashMap::new();
                    for pair in props.pairs::<String, String>() {
                        let (k, v) = pair?;
                        map.insert(k, v);
                    }
                    event = event.with_properties(map);
                }
                sink.record(event);
                Ok(())
            },
        )?;
        kaos.set("event", event)
    }

    #[cfg(feature = "http")]
    fn register_http(&self, lua: &Lua, kaos: &Table) -> LuaResult<()> {
        use crate::runtime::http::HttpRequest;
        use std::time::Duration;

        let client = self.services.http.clone();
        let http_request = lua.create_function(
            move |lua,
                  (url, method, headers, body, timeout_ms): (
                String,
                String,
                Option<Table>,
                Option<String>,
                Option<u64>,
            )| {
                let client = client
                    .as_ref()
                    .ok_or_else(|| MatchError::Http("http client is not configured".into()).into_lua())?;

                let mut request = HttpRequest::new(method, url);
                if let Some(headers) = headers {
                    for pair in headers.pairs::<String, String>() {
                        let (k, v) = pair?;
                        request.headers.insert(k, v);
                    }
                }
                request.body = body;
                request.timeout = timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis);

                let response = client.request(request).map_err(MatchError::into_lua)?;
                let value = serde_json::to_value(&response).map_err(mlua::Error::external)?;
                json_to_lua(lua, &value)
            },
        )?;
        kaos.set("http_request", http_request)
    }

    #[cfg(feature = "postgres")]
    fn register_sql(&self, lua: &Lua, kaos: &Table) -> LuaResult<()> {
        let sql = self.services.sql.clone();
        let sql_exec = lua.create_function(move |lua, (query, params): (String, Value)| {
            let executor = sql
                .as_ref()
                .ok_or_else(|| MatchError::Database("database is not configured".into()).into_lua())?;
            let result = executor.exec(&query, &lua_to_json(&params)?).map_err(MatchError::into_lua)?;
            json_to_lua(lua, &result)
        })?;
        kaos.set("sql_exec", sql_exec)?;

        let sql = self.services.sql.clone();
        let sql_query = lua.create_function(move |lua, (query, params): (String, Value)| {
            let executor = sql
                .as_ref()
                .ok_or_else(|| MatchError::Database("database is not configured".into()).into_lua())?;
            let rows = executor.query(&query, &lua_to_json(&params)?).map_err(MatchError::into_lua)?;
            json_to_lua(lua, &serde_json::Value::Array(rows))
        })?;
        kaos.set("sql_query", sql_query)
    }

    fn register_json(&self, lua: &Lua) -> LuaResult<()> {
        let json = lua.create_table()?;

        // json.encode(value) -> string
        let encode = lua.create_function(|_, value: Value| {
            let json = lua_to_json(&value)?;
            serde_json::to_string(&json).map_err(mlua::Error::external)
        })?;
        json.set("encode", encode)?;

        // json.decode(string) -> value
        let decode = lua.create_function(|lua, s: String| {
            let value: serde_json::Value = serde_json::from_str(&s).map_err(mlua::Error::external)?;
            json_to_lua(lua, &value)
        })?;
        json.set("decode", decode)?;

        lua.globals().set("json", json)
    }
}

/// Look up a registered match module.
pub(crate) fn match_module(lua: &Lua, name: &str) -> LuaResult<Option<Table>> {
    let handlers: Table = lua.globals().get(MATCH_HANDLERS)?;
    handlers.get(name)
}

/// Convert a Lua value to JSON.
///
/// Tables with only positive integer keys 1..n become arrays; any other table
/// becomes an object. An empty table becomes an empty object. Strings must be
/// valid UTF-8: binary data is a Protocol error rather than being mangled.
pub fn lua_to_json(value: &Value) -> LuaResult<serde_json::Value> {
    to_json(value, false)
}

/// Like [`lua_to_json`], but invalid UTF-8 is replaced instead of rejected.
/// Only for copies whose authoritative value stays inside the VM.
pub(crate) fn lua_to_json_lossy(value: &Value) -> LuaResult<serde_json::Value> {
    to_json(value, true)
}

fn string_to_json(s: &mlua::String, lossy: bool) -> LuaResult<String> {
    if lossy {
        return Ok(String::from(s.to_string_lossy()));
    }
    std::str::from_utf8(&s.as_bytes())
        .map(str::to_owned)
        .map_err(|_| {
            MatchError::protocol("string is not valid UTF-8; encode binary data with kaos.base64_encode").into_lua()
        })
}

fn to_json(value: &Value, lossy: bool) -> LuaResult<serde_json::Value> {
    match value {
        Value::Nil => Ok(serde_json::Value::Null),
        Value::Boolean(b) => Ok(serde_json::Value::Bool(*b)),
        Value::Integer(i) => Ok(serde_json::Value::Number((*i).into())),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .ok_or_else(|| mlua::Error::external("invalid number")),
        Value::String(s) => string_to_json(s, lossy).map(serde_json::Value::String),
        Value::Table(t) => table_to_json(t, lossy),
        other => Err(mlua::Error::external(format!(
            "cannot convert {} to JSON",
            other.type_name()
        ))),
    }
}

fn table_to_json(t: &Table, lossy: bool) -> LuaResult<serde_json::Value> {
    let mut is_array = true;
    let mut max_index = 0i64;
    let mut count = 0i64;
    for pair in t.clone().pairs::<Value, Value>() {
        let (k, _) = pair?;
        count += 1;
        match k {
            Value::Integer(i) if i > 0 => max_index = max_index.max(i),
            _ => is_array = false,
        }
    }

    if is_array && max_index > 0 && max_index == count {
        let mut arr = Vec::with_capacity(max_index as usize);
        for i in 1..=max_index {
            let v: Value = t.get(i)?;
            arr.push(to_json(&v, lossy)?);
        }
        return Ok(serde_json::Value::Array(arr));
    }

    let mut map = serde_json::Map::new();
    for pair in t.clone().pairs::<Value, Value>() {
        let (k, v) = pair?;
        let key = match k {
            Value::String(s) => string_to_json(&s, lossy)?,
            Value::Integer(i) => i.to_string(),
            Value::Number(n) => n.to_string(),
            other => {
                return Err(mlua::Error::external(format!(
                    "cannot use {} as a JSON key",
                    other.type_name()
                )))
            }
        };
        map.insert(key, to_json(&v, lossy)?);
    }
    Ok(serde_json::Value::Object(map))
}

/// Convert JSON to a Lua value.
pub fn json_to_lua(lua: &Lua, value: &serde_json::Value) -> LuaResult<Value> {
    match value {
        serde_json::Value::Null => Ok(Value::Nil),
        serde_json::Value::Bool(b) => Ok(Value::Boolean(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Integer(i))
            } else {
                Ok(n.as_f64().map(Value::Number).unwrap_or(Value::Nil))
            }
        }
        serde_json::Value::String(s) => Ok(Value::String(lua.create_string(s)?)),
        serde_json::Value::Array(arr) => {
            let table = lua.create_table_with_capacity(arr.len(), 0)?;
            for (i, v) in arr.iter().enumerate() {
                table.set(i + 1, json_to_lua(lua, v)?)?;
            }
            Ok(Value::Table(table))
        }
        serde_json::Value::Object(map) => {
            let table = lua.create_table_with_capacity(0, map.len())?;
            for (k, v) in map {
                table.set(k.as_str(), json_to_lua(lua, v)?)?;
            }
            Ok(Value::Table(table))
        }
    }
}

/// Unsandboxed VM with the API registered.
#[cfg(test)]
pub(crate) fn test_lua() -> Lua {
    let lua = Lua::new();
    LuaApi::new(RuntimeServices::default()).register(&lua).unwrap();
    lua
}
