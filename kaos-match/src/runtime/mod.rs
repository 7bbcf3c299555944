//! Host services handed to scripted handlers.
//!
//! Everything here is node-wide and shared across matches: the event sink,
//! the optional HTTP client and the optional SQL executor.

pub mod codec;
pub mod event;
pub mod retry;

#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "postgres")]
pub mod sql;

use std::sync::Arc;

use tracing::info;

use crate::config::KaosMatchConfig;
use crate::error::Result;

pub use event::{Event, EventSink, LogEventSink, MemoryEventSink};

#[cfg(feature = "http")]
use http::HttpClient;
#[cfg(feature = "postgres")]
use sql::SqlExecutor;

/// Shared host services.
#[derive(Clone)]
pub struct RuntimeServices {
    pub events: Arc<dyn EventSink>,
    #[cfg(feature = "http")]
    pub http: Option<Arc<HttpClient>>,
    #[cfg(feature = "postgres")]
    pub sql: Option<Arc<SqlExecutor>>,
}

impl Default for RuntimeServices {
    fn default() -> Self {
        Self {
            events: Arc::new(LogEventSink),
            #[cfg(feature = "http")]
            http: None,
            #[cfg(feature = "postgres")]
            sql: None,
        }
    }
}

impl RuntimeServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every service the configuration enables. SQL connects only when
    /// a database URL is set.
    pub fn from_config(config: &KaosMatchConfig) -> Result<Self> {
        #[allow(unused_mut)]
        let mut services = Self::default();
        #[cfg(feature = "http")]
        {
            services.http = Some(Arc::new(HttpClient::new(&config.http)?));
        }
        #[cfg(feature = "postgres")]
        {
            if !config.sql.database_url.is_empty() {
                services.sql = Some(Arc::new(SqlExecutor::connect(&config.sql)?));
            }
        }
        info!(node = %config.node.name, "runtime services ready");
        Ok(services)
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    #[cfg(feature = "http")]
    pub fn with_http(mut self, http: Arc<HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    #[cfg(feature = "postgres")]
    pub fn with_sql(mut self, sql: Arc<SqlExecutor>) -> Self {
        self.sql = Some(sql);
        self
    }
}

/// A random version 4 UUID in hyphenated form.
pub fn uuid_v4() -> String {
    uuid::Uuid::new_v4().to_string()
}
