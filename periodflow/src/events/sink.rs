//! Event sink trait and implementations.

use parking_lot::RwLock;
use tracing::{debug, info, Level};

/// Receives lifecycle and checkpoint events.
///
/// Emission must never fail the caller; sinks log and swallow their own
/// errors.
pub trait EventSink: Send + Sync {
    /// Emits an event.
    ///
    /// # Arguments
    ///
    /// * `event_type` - The type of event (e.g., "step.started")
    /// * `data` - Optional event payload
    fn emit(&self, event_type: &str, data: Option<serde_json::Value>);
}

/// A sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}
}

/// A sink that logs events through `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a sink logging at `level` (DEBUG or INFO).
    #[must_use]
    pub const fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub const fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl EventSink for LoggingEventSink {
    fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        if self.level == Level::DEBUG {
            debug!(event_type = %event_type, event_data = ?data, "Event: {}", event_type);
        } else {
            info!(event_type = %event_type, event_data = ?data, "Event: {}", event_type);
        }
    }
}

/// A sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<(String, Option<serde_json::Value>)>>,
}

impl CollectingEventSink {
    /// Creates an empty collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All collected events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<serde_json::Value>)> {
        self.events.read().clone()
    }

    /// Event types only, oldest first.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.events.read().iter().map(|(t, _)| t.clone()).collect()
    }

    /// Events whose type starts with `type_prefix`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<(String, Option<serde_json::Value>)> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t.starts_with(type_prefix))
            .cloned()
            .collect()
    }

    /// Number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing has been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}
