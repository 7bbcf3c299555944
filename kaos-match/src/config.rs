//! Configuration for the match engine.
//!
//! Every section is optional in TOML; missing fields take their defaults.
//!
//! ```toml
//! [node]
//! name = "node-1"
//!
//! [environment]
//! region = "eu"
//!
//! [match]
//! input_queue_size = 256
//!
//! [lua]
//! script = "scripts/arena.lua"
//! module = "arena"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{MatchError, Result};
use crate::queue::DEFAULT_QUEUE_CAPACITY;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "kaos".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Capacity of each match's inbound queue.
    pub input_queue_size: usize,
    /// How long a join attempt may wait on the match thread.
    pub join_attempt_timeout_ms: u64,
    /// Grace period handed to terminate when the registry stops a match.
    pub default_grace_seconds: i64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            input_queue_size: DEFAULT_QUEUE_CAPACITY,
            join_attempt_timeout_ms: 10_000,
            default_grace_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LuaConfig {
    pub script: Option<PathBuf>,
    /// Name passed to `kaos.register_match`.
    pub module: String,
    /// Per-VM memory cap in bytes.
    pub memory_limit: Option<usize>,
    /// Instructions per handler call before it is aborted.
    pub instruction_limit: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub default_timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqlConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_connections: 10,
            retry_attempts: 5,
            retry_backoff_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KaosMatchConfig {
    pub node: NodeConfig,
    /// Exposed to handlers as `ctx.env`.
    pub environment: HashMap<String, String>,
    #[serde(rename = "match")]
    pub matches: MatchConfig,
    pub lua: LuaConfig,
    pub http: HttpConfig,
    pub sql: SqlConfig,
    pub logging: LoggingConfig,
}

impl KaosMatchConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| MatchError::configuration(format!("config parse error: {e}")))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// `KAOS_MATCH_NODE` and `KAOS_MATCH_DATABASE_URL` win over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(node) = std::env::var("KAOS_MATCH_NODE") {
            if !node.is_empty() {
                self.node.name = node;
            }
        }
        if let Ok(url) = std::env::var("KAOS_MATCH_DATABASE_URL") {
            if !url.is_empty() {
                self.sql.database_url = url;
            }
        }
    }
}
