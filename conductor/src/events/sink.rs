//! Event sink trait and implementations.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, Level};

use super::LifecycleEvent;

/// Receiver of pipeline lifecycle events.
///
/// Sinks must never fail the caller; implementations log and swallow their
/// own errors.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event.
    async fn emit(&self, event: LifecycleEvent);

    /// Emits an event without awaiting.
    fn try_emit(&self, event: LifecycleEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: LifecycleEvent) {}

    fn try_emit(&self, _event: LifecycleEvent) {}
}

/// Writes events to `tracing`.
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
    /// Creates a sink logging at `level`. Anything above INFO logs at INFO.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Debug level sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &LifecycleEvent) {
        let kind = event.event_type();
        let pipeline_id = event.pipeline_id().unwrap_or_default();
        let data = event.to_dict();
        // Level orders by verbosity: DEBUG and TRACE compare greater than INFO.
        if self.level > Level::INFO {
            debug!(event = kind, pipeline_id, data = %data, "Lifecycle event");
        } else {
            info!(event = kind, pipeline_id, data = %data, "Lifecycle event");
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: LifecycleEvent) {
        self.log_event(&event);
    }

    fn try_emit(&self, event: LifecycleEvent) {
        self.log_event(&event);
    }
}

/// Keeps every event in memory; for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<LifecycleEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All collected events in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.read().clone()
    }

    /// Event types in emission order.
    #[must_use]
    pub fn event_types(&self) -> Vec<&'static str> {
        self.events.read().iter().map(LifecycleEvent::event_type).collect()
    }

    /// Number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Events whose type starts with `type_prefix`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<LifecycleEvent> {
        self.events
            .read()
            .iter()
            .filter(|event| event.event_type().starts_with(type_prefix))
            .cloned()
            .collect()
    }

    /// Drops every collected event.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: LifecycleEvent) {
        self.events.write().push(event);
    }

    fn try_emit(&self, event: LifecycleEvent) {
        self.events.write().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(id: &str) -> LifecycleEvent {
        LifecycleEvent::PipelineCreated {
            pipeline_id: id.into(),
            pipeline_type: "app".into(),
        }
    }

    #[tokio::test]
    async fn test_noop_and_logging_sinks_accept_events() {
        NoOpEventSink.emit(created("p1")).await;
        LoggingEventSink::default().emit(created("p1")).await;
        LoggingEventSink::debug().try_emit(created("p2"));
    }

    #[tokio::test]
    async fn test_collecting_sink_keeps_order() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(created("p1")).await;
        sink.try_emit(LifecycleEvent::PipelineCompleted {
            pipeline_id: "p1".into(),
        });

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.event_types(), vec!["pipeline.created", "pipeline.completed"]);
    }

    #[tokio::test]
    async fn test_collecting_sink_filter_and_clear() {
        let sink = CollectingEventSink::new();
        sink.try_emit(created("p1"));
        sink.try_emit(LifecycleEvent::DeadLettered {
            stream: "stream:results".into(),
            entry_id: "1-0".into(),
            reason: "bad json".into(),
        });

        assert_eq!(sink.events_of_type("pipeline.").len(), 1);
        assert_eq!(sink.events_of_type("bus.").len(), 1);

        sink.clear();
        assert!(sink.is_empty());
    }
}
