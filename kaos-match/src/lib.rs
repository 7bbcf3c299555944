//! # kaos-match
//!
//! Authoritative real-time match engine with a sandboxed Lua handler host.
//!
//! ## Features
//!
//! - **Match Core**: strict lifecycle (init, join attempt, join, leave, loop,
//!   terminate) over an opaque JSON game state
//! - **Broadcast authorization**: outbound traffic only ever reaches current
//!   members of the match
//! - **Scheduler**: one thread per match ticking at the handler's rate
//! - **Lua Scripting**: `kaos.register_match` modules in a per-match VM
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kaos_match::{KaosMatchConfig, LocalMatchRegistry, LocalRouter, LuaHandlerFactory, RuntimeServices};
//!
//! let config = KaosMatchConfig::load("kaos-match.toml")?;
//! let router = Arc::new(LocalRouter::new());
//! let registry = LocalMatchRegistry::from_config(&config, router.clone());
//!
//! let factory = LuaHandlerFactory::from_config(&config, RuntimeServices::from_config(&config)?)?;
//! let match_id = registry.create_match(Box::new(factory.create_default()?), serde_json::json!({}))?;
//! ```

pub mod broadcast;
pub mod config;
pub mod context;
pub mod core;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod presence;
pub mod queue;
pub mod registry;
pub mod result;
pub mod router;
pub mod runner;
pub mod runtime;

#[cfg(feature = "lua")]
pub mod lua;

#[cfg(feature = "metrics")]
pub mod metrics;

#[cfg(feature = "telemetry")]
pub mod telemetry;

// Re-exports
pub use broadcast::{BroadcastAuthorizer, BroadcastRequest, ResolvedBroadcast};
pub use config::KaosMatchConfig;
pub use context::{CallerIdentity, JoinCandidate, MatchContext};
pub use crate::core::{JoinAttemptOutcome, LoopOutcome, MatchCore, MatchLabel, MatchLifecycle};
pub use envelope::{DeferredMessage, Envelope};
pub use error::{MatchError, Result};
pub use handler::{MatchDispatcher, MatchHandler, NullDispatcher};
pub use presence::{Presence, PresenceDirectory, PresenceId, PresenceStream};
pub use queue::{InboundMessage, InboundQueue, InboundSender};
pub use registry::LocalMatchRegistry;
pub use router::{DeferFn, LocalRouter, MatchRegistry, MessageRouter};
pub use runner::{MatchHandle, MatchRunner};
pub use runtime::RuntimeServices;

#[cfg(feature = "lua")]
pub use lua::{LuaHandlerFactory, LuaMatchHandler, LuaRuntime};

#[cfg(feature = "metrics")]
pub use metrics::MatchMetrics;

#[cfg(feature = "telemetry")]
pub use telemetry::{init_tracing, TracingConfig};
