//! Event sink trait and implementations.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, Level};

/// Trait for sinks that receive step lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    ///
    /// # Arguments
    ///
    /// * `event_type` - The type of event (e.g., "step.started")
    /// * `data` - Optional event data
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>);

    /// Emits an event without awaiting.
    ///
    /// Used from contexts that must not block, such as log tailing. Must
    /// never panic.
    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>);
}

/// A sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}
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
    /// Creates a logging sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    fn log_event(&self, event_type: &str, data: Option<&serde_json::Value>) {
        if self.level == Level::DEBUG || self.level == Level::TRACE {
            debug!(event_type = %event_type, event_data = ?data, "[paddle] {}", event_type);
        } else {
            info!(event_type = %event_type, event_data = ?data, "[paddle] {}", event_type);
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.log_event(event_type, data.as_ref());
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.log_event(event_type, data.as_ref());
    }
}

/// A sink that records events in memory, for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<(String, Option<serde_json::Value>)>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<serde_json::Value>)> {
        self.events.read().clone()
    }

    /// Returns the collected event types, in order.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.events.read().iter().map(|(t, _)| t.clone()).collect()
    }

    /// Returns events matching a type prefix.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<(String, Option<serde_json::Value>)> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t.starts_with(type_prefix))
            .cloned()
            .collect()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.events.write().push((event_type.to_string(), data));
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}
