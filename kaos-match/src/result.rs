//! Typed lifecycle return values.
//!
//! Handlers hand back loosely-typed objects (marshaled to JSON by the host).
//! Each is validated here exactly once; any deviation from the expected
//! shape becomes a single `Protocol` (or, for the tick rate, `Configuration`)
//! error and the caller's state is left untouched.

use serde_json::{Map, Value};

use crate::error::{MatchError, Result};

pub const MIN_TICK_RATE: u32 = 1;
pub const MAX_TICK_RATE: u32 = 30;

/// Validated `match_init` return.
#[derive(Debug, Clone, PartialEq)]
pub struct InitResult {
    pub state: Value,
    pub tick_rate: u32,
    pub label: String,
}

/// Validated `match_join_attempt` return.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinAttemptResult {
    pub state: Value,
    pub accept: bool,
    /// Only read when `accept` is false; empty otherwise.
    pub reject_msg: String,
}

fn as_object<'a>(value: &'a Value, expected: &str) -> Result<&'a Map<String, Value>> {
    value.as_object().ok_or_else(|| MatchError::protocol(expected.to_string()))
}

fn parse_tick_rate(value: Option<&Value>) -> Result<u32> {
    let value = value.ok_or_else(|| MatchError::configuration("match_init return value has no 'tick_rate' property"))?;

    let out_of_range = || MatchError::configuration(format!(
        "match_init 'tick_rate' must be a number between {} and {}",
        MIN_TICK_RATE, MAX_TICK_RATE
    ));

    let rate = match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .ok_or_else(out_of_range)?,
        _ => return Err(out_of_range()),
    };

    if rate < MIN_TICK_RATE as i64 || rate > MAX_TICK_RATE as i64 {
        return Err(out_of_range());
    }
    Ok(rate as u32)
}

impl InitResult {
    pub fn from_value(value: Value) -> Result<Self> {
        let map = as_object(
            &value,
            "match_init is expected to return an object with 'state', 'tick_rate' and 'label' properties",
        )?;

        let tick_rate = parse_tick_rate(map.get("tick_rate"))?;

        let label = match map.get("label") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(_) => return Err(MatchError::protocol("match_init 'label' value must be a string")),
        };

        let state = map
            .get("state")
            .cloned()
            .ok_or_else(|| MatchError::protocol("match_init is expected to return an object with a 'state' property"))?;

        Ok(Self { state, tick_rate, label })
    }
}

impl JoinAttemptResult {
    pub fn from_value(value: Value) -> Result<Self> {
        let map = as_object(
            &value,
            "match_join_attempt is expected to return an object with 'state' and 'accept' properties",
        )?;

        let accept = match map.get("accept") {
            None => return Err(MatchError::protocol("match_join_attempt return value has no 'accept' property")),
            Some(Value::Bool(b)) => *b,
            Some(_) => return Err(MatchError::protocol("match_join_attempt 'accept' property must be a boolean")),
        };

        let mut reject_msg = String::new();
        if !accept {
            match map.get("reject_msg") {
                None | Some(Value::Null) => {}
                Some(Value::String(s)) => reject_msg = s.clone(),
                Some(_) => {
                    return Err(MatchError::protocol("match_join_attempt 'reject_msg' property must be a string"))
                }
            }
        }

        let state = map
            .get("state")
            .cloned()
            .ok_or_else(|| MatchError::protocol("match_join_attempt is expected to return an object with 'state' property"))?;

        Ok(Self { state, accept, reject_msg })
    }
}

/// Extract `state` from a join/leave/loop/terminate return.
pub fn state_from_value(value: Value, call: &str) -> Result<Value> {
    let expected = || MatchError::protocol(format!("{} is expected to return an object with 'state' property", call));
    match value {
        Value::Object(mut map) => map.remove("state").ok_or_else(expected),
        _ => Err(expected()),
    }
}

/// Loop may return nothing at all, meaning "state unchanged".
pub fn loop_state_from_value(value: Value) -> Result<Option<Value>> {
    match value {
        Value::Null => Ok(None),
        other => state_from_value(other, "match_loop").map(Some),
    }
}
