//! Application events recorded by handlers.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

/// A named analytics event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub name: String,
    pub properties: HashMap<String, String>,
    /// Unix seconds.
    pub timestamp: i64,
    pub external: bool,
}

impl Event {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: HashMap::new(),
            timestamp: crate::queue::now_millis() / 1000,
            external: false,
        }
    }

    pub fn with_properties(mut self, properties: HashMap<String, String>) -> Self {
        self.properties = properties;
        self
    }

    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn external(mut self, external: bool) -> Self {
        self.external = external;
        self
    }
}

/// Destination for handler events.
pub trait EventSink: Send + Sync {
    fn record(&self, event: Event);
}

/// Writes events to the log.
#[derive(Debug, Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn record(&self, event: Event) {
        info!(
            target: "kaos_match::event",
            name = %event.name,
            properties = ?event.properties,
            timestamp = event.timestamp,
            external = event.external,
            "event"
        );
    }
}

/// Keeps events in memory until taken.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for MemoryEventSink {
    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }
}
