//! Lua handler host.
//!
//! Every match gets its own sandboxed VM. Scripts register match modules with
//! `kaos.register_match(name, { match_init = ..., ... })` and
//! [`LuaMatchHandler`] drives them through the core's lifecycle.

mod api;
mod match_handler;

pub use api::{json_to_lua, lua_to_json, LuaApi};
pub use match_handler::{LuaMatchHandler, MATCH_FUNCTIONS};

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mlua::{HookTriggers, Lua, Table, Value, VmState};
use tracing::debug;

use crate::config::{KaosMatchConfig, LuaConfig};
use crate::error::{MatchError, Result};
use crate::runtime::RuntimeServices;

/// Instructions between two budget checks.
const HOOK_INTERVAL: u32 = 1_000;

/// Globals removed before any script runs.
const SANDBOXED_GLOBALS: [&str; 8] = [
    "os", "io", "loadfile", "dofile", "load", "require", "package", "debug",
];

/// A sandboxed VM with the `kaos` API registered.
pub struct LuaRuntime {
    lua: Lua,
    instructions: Arc<AtomicU64>,
}

impl LuaRuntime {
    pub fn new(config: &LuaConfig, services: RuntimeServices) -> Result<Self> {
        let lua = Lua::new();

        let globals = lua.globals();
        for name in SANDBOXED_GLOBALS {
            globals.set(name, Value::Nil)?;
        }

        if let Some(limit) = config.memory_limit {
            lua.set_memory_limit(limit)?;
        }

        let instructions = Arc::new(AtomicU64::new(0));
        if let Some(limit) = config.instruction_limit {
            let count = Arc::clone(&instructions);
            let limit = u64::from(limit);
            lua.set_hook(
                HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
                move |_lua, _debug| {
                    let current = count.fetch_add(u64::from(HOOK_INTERVAL), Ordering::Relaxed)
                        + u64::from(HOOK_INTERVAL);
                    if current > limit {
                        Err(mlua::Error::RuntimeError("instruction limit exceeded".to_string()))
                    } else {
                        Ok(VmState::Continue)
                    }
                },
            );
        }

        LuaApi::new(services).register(&lua)?;
        Ok(Self { lua, instructions })
    }

    /// Execute a chunk, typically a script registering match modules.
    pub fn load_source(&self, name: &str, source: &str) -> Result<()> {
        self.reset_budget();
        self.lua
            .load(source)
            .set_name(name)
            .exec()
            .map_err(MatchError::from_lua)
    }

    pub fn load_file(&self, path: &Path) -> Result<()> {
        let source = std::fs::read_to_string(path)?;
        self.load_source(&path.display().to_string(), &source)
    }

    pub fn has_match_module(&self, name: &str) -> bool {
        matches!(api::match_module(&self.lua, name), Ok(Some(_)))
    }

    pub(crate) fn match_module(&self, name: &str) -> Result<Option<Table>> {
        Ok(api::match_module(&self.lua, name)?)
    }

    /// Restart the instruction budget; called before every handler call.
    pub(crate) fn reset_budget(&self) {
        self.instructions.store(0, Ordering::Relaxed);
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }
}

/// Builds one [`LuaMatchHandler`] per match from a shared script.
#[derive(Clone)]
pub struct LuaHandlerFactory {
    chunk_name: String,
    source: Arc<str>,
    config: LuaConfig,
    services: RuntimeServices,
}

impl LuaHandlerFactory {
    pub fn from_source(
        chunk_name: impl Into<String>,
        source: impl Into<Arc<str>>,
        config: LuaConfig,
        services: RuntimeServices,
    ) -> Self {
        Self {
            chunk_name: chunk_name.into(),
            source: source.into(),
            config,
            services,
        }
    }

    /// Read `lua.script` once; every handler re-runs it in a fresh VM.
    pub fn from_config(config: &KaosMatchConfig, services: RuntimeServices) -> Result<Self> {
        let path = config
            .lua
            .script
            .as_ref()
            .ok_or_else(|| MatchError::configuration("lua.script is not set"))?;
        let source = std::fs::read_to_string(path)?;
        debug!(script = %path.display(), "loaded lua script");
        Ok(Self::from_source(
            path.display().to_string(),
            source,
            config.lua.clone(),
            services,
        ))
    }

    /// Handler for the configured `lua.module`.
    pub fn create_default(&self) -> Result<LuaMatchHandler> {
        self.create(&self.config.module)
    }

    pub fn create(&self, module: &str) -> Result<LuaMatchHandler> {
        let runtime = LuaRuntime::new(&self.config, self.services.clone())?;
        runtime.load_source(&self.chunk_name, &self.source)?;
        LuaMatchHandler::new(runtime, module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(config: &LuaConfig) -> LuaRuntime {
        LuaRuntime::new(config, RuntimeServices::default()).unwrap()
    }

    #[test]
    fn test_sandbox_removes_globals() {
        let rt = runtime(&LuaConfig::default());
        for name in SANDBOXED_GLOBALS {
            let v: Value = rt.lua().globals().get(name).unwrap();
            assert!(v.is_nil(), "{name} should be removed");
        }
        assert!(rt.load_source("escape", "os.exit(1)").is_err());
    }

    #[test]
    fn test_instruction_limit() {
        let config = LuaConfig {
            instruction_limit: Some(10_000),
            ..Default::default()
        };
        let rt = runtime(&config);
        let err = rt.load_source("spin", "while true do end").unwrap_err();
        assert!(err.to_string().contains("instruction limit exceeded"));

        // the budget restarts per call
        rt.load_source("short", "local x = 1").unwrap();
    }

    #[test]
    fn test_memory_limit() {
        let config = LuaConfig {
            memory_limit: Some(2 * 1024 * 1024),
            ..Default::default()
        };
        let rt = runtime(&config);
        let err = rt
            .load_source("hog", "local t = {} for i = 1, 10000000 do t[i] = string.rep('x', 64) .. i end")
            .unwrap_err();
        assert!(matches!(err, MatchError::Handler(_)));
    }

    #[test]
    fn test_register_match_module() {
        let rt = runtime(&LuaConfig::default());
        assert!(!rt.has_match_module("arena"));
        rt.load_source("arena", r#"kaos.register_match("arena", {})"#).unwrap();
        assert!(rt.has_match_module("arena"));
    }

    #[test]
    fn test_factory_requires_script() {
        let err = LuaHandlerFactory::from_config(&KaosMatchConfig::default(), RuntimeServices::default()).err();
        assert!(matches!(err, Some(MatchError::Configuration(_))));
    }
}
