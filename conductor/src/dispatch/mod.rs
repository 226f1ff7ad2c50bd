//! Task dispatch.
//!
//! Turns "run this stage of this pipeline" into a validated task envelope,
//! records which stage the task answers, and publishes it to
//! `<prefix>.<worker_type>`. Nothing is published if validation fails.

mod record;

pub use record::{load_task_record, TaskRecord};

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::bus::{MessageBus, PublishOptions};
use crate::catalog::StageDefinition;
use crate::config::ConductorConfig;
use crate::contracts::{Envelope, PipelineContext, TaskEnvelope, TaskMetadata, TraceContext};
use crate::core::Pipeline;
use crate::errors::ConductorError;
use crate::events::{EventSink, LifecycleEvent, NoOpEventSink};
use crate::kv::{task_key, KeyValueStore};
use crate::resilience::{with_retry_if, RetryConfig};
use crate::utils::generate_id;

/// Everything needed to dispatch one stage.
#[derive(Debug, Clone, Copy)]
pub struct DispatchRequest<'a> {
    /// Pipeline the stage belongs to; its outputs are copied into the task.
    pub pipeline: &'a Pipeline,
    /// Stage to run.
    pub stage: &'a StageDefinition,
    /// Trace of the event that triggered the dispatch.
    pub parent_trace: Option<&'a TraceContext>,
    /// Explicit retry number.
    pub retry_count: u32,
}

impl<'a> DispatchRequest<'a> {
    /// First attempt of `stage`, without a parent trace.
    #[must_use]
    pub fn new(pipeline: &'a Pipeline, stage: &'a StageDefinition) -> Self {
        Self {
            pipeline,
            stage,
            parent_trace: None,
            retry_count: 0,
        }
    }

    /// Sets the triggering trace.
    #[must_use]
    pub fn with_parent_trace(mut self, trace: Option<&'a TraceContext>) -> Self {
        self.parent_trace = trace;
        self
    }

    /// Sets the retry number.
    #[must_use]
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// Builds, records and publishes task envelopes.
pub struct TaskDispatcher {
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn KeyValueStore>,
    events: Arc<dyn EventSink>,
    topic_prefix: String,
    default_timeout_ms: u64,
    record_ttl: Duration,
    write_retry: RetryConfig,
}

impl std::fmt::Debug for TaskDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDispatcher")
            .field("topic_prefix", &self.topic_prefix)
            .field("default_timeout_ms", &self.default_timeout_ms)
            .finish_non_exhaustive()
    }
}

impl TaskDispatcher {
    /// Creates a dispatcher using the topic, timeout and TTL settings of `config`.
    #[must_use]
    pub fn new(
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn KeyValueStore>,
        config: &ConductorConfig,
    ) -> Self {
        Self {
            bus,
            store,
            events: Arc::new(NoOpEventSink),
            topic_prefix: config.tasks_topic_prefix.clone(),
            default_timeout_ms: config.default_stage_timeout_ms,
            record_ttl: config.task_record_ttl(),
            write_retry: config.write_retry.clone(),
        }
    }

    /// Sets the lifecycle event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Window used for stages that do not set one.
    #[must_use]
    pub fn default_timeout_ms(&self) -> u64 {
        self.default_timeout_ms
    }

    /// Builds the envelope for `request` without publishing it.
    #[must_use]
    pub fn build_envelope(&self, request: &DispatchRequest<'_>) -> TaskEnvelope {
        let pipeline = request.pipeline;
        let stage = request.stage;
        TaskEnvelope {
            message_id: generate_id(),
            task_id: generate_id(),
            pipeline_id: pipeline.id.clone(),
            worker_type: stage.worker_type.clone(),
            priority: stage.priority,
            constraints: stage.constraints(self.default_timeout_ms),
            retry_count: request.retry_count,
            payload: stage_payload(stage, pipeline),
            metadata: TaskMetadata::now(),
            trace: TraceContext::child_or_root(request.parent_trace),
            pipeline_context: PipelineContext {
                pipeline_type: pipeline.pipeline_type.clone(),
                pipeline_name: pipeline.name.clone(),
                current_stage: stage.name.clone(),
                stage_outputs: pipeline.stage_outputs.clone(),
            },
        }
    }

    /// Validates, records and publishes a task for `request`.
    ///
    /// The task record is written before the publish so that a result can
    /// never arrive for a task the consumer cannot resolve.
    pub async fn dispatch(&self, request: DispatchRequest<'_>) -> Result<TaskEnvelope, ConductorError> {
        let envelope = self.build_envelope(&request);
        let body = envelope.to_json().map_err(|violation| {
            warn!(
                pipeline_id = %envelope.pipeline_id,
                stage = %request.stage.name,
                violation = %violation.to_dict(),
                "Refusing to publish invalid task envelope"
            );
            violation
        })?;

        let record = serde_json::to_value(TaskRecord::from_envelope(&envelope))?;
        let key = task_key(&envelope.task_id);
        let topic = envelope.topic(&self.topic_prefix);
        let (bus, store, ttl) = (&self.bus, &self.store, self.record_ttl);
        let (key_ref, record_ref, topic_ref, body_ref) = (&key, &record, &topic, &body);

        with_retry_if(
            &self.write_retry,
            &key,
            || async move {
                store
                    .set(key_ref, record_ref, Some(ttl))
                    .await
                    .map_err(ConductorError::from)
            },
            ConductorError::is_transient,
        )
        .await?;

        let receipt = with_retry_if(
            &self.write_retry,
            &topic,
            || async move {
                bus.publish(topic_ref, body_ref, PublishOptions::ephemeral())
                    .await
                    .map_err(ConductorError::from)
            },
            ConductorError::is_transient,
        )
        .await?;

        if receipt.receivers == 0 {
            debug!(topic = %topic, task_id = %envelope.task_id, "No live worker on topic; watchdog will catch it");
        }
        info!(
            pipeline_id = %envelope.pipeline_id,
            stage = %request.stage.name,
            task_id = %envelope.task_id,
            worker_type = %envelope.worker_type,
            retry_count = envelope.retry_count,
            trace_id = %envelope.trace.trace_id,
            "Task dispatched"
        );
        self.events
            .emit(LifecycleEvent::StageDispatched {
                pipeline_id: envelope.pipeline_id.clone(),
                stage: request.stage.name.clone(),
                task_id: envelope.task_id.clone(),
                worker_type: envelope.worker_type.clone(),
                retry_count: envelope.retry_count,
            })
            .await;
        Ok(envelope)
    }

    /// Looks up the record of a dispatched task.
    pub async fn task_record(&self, task_id: &str) -> Result<Option<TaskRecord>, ConductorError> {
        load_task_record(self.store.as_ref(), task_id).await
    }
}

fn stage_payload(stage: &StageDefinition, pipeline: &Pipeline) -> serde_json::Value {
    let mut payload = match &stage.payload {
        serde_json::Value::Object(map) => map.clone(),
        serde_json::Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("input".to_string(), other.clone());
            map
        }
    };
    if !pipeline.metadata.is_null() {
        payload
            .entry("pipeline_metadata")
            .or_insert_with(|| pipeline.metadata.clone());
    }
    serde_json::Value::Object(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::contracts::Priority;
    use crate::core::NewPipeline;
    use crate::events::CollectingEventSink;
    use crate::kv::InMemoryKeyValueStore;
    use serde_json::json;

    struct Harness {
        bus: Arc<InMemoryBus>,
        store: Arc<InMemoryKeyValueStore>,
        events: Arc<CollectingEventSink>,
        dispatcher: TaskDispatcher,
    }

    fn harness() -> Harness {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryKeyValueStore::new());
        let events = Arc::new(CollectingEventSink::new());
        let config = ConductorConfig::default()
            .with_default_stage_timeout_ms(5_000)
            .with_write_retry(RetryConfig::new().with_max_attempts(1));
        let dispatcher = TaskDispatcher::new(bus.clone(), store.clone(), &config)
            .with_event_sink(events.clone());
        Harness {
            bus,
            store,
            events,
            dispatcher,
        }
    }

    fn pipeline() -> Pipeline {
        let mut pipeline =
            Pipeline::from_request(&NewPipeline::new("app", "demo").with_metadata(json!({"repo": "r"})));
        pipeline.stage_outputs.insert("init", json!({"files": 3}));
        pipeline
    }

    #[tokio::test]
    async fn test_dispatch_publishes_and_records() {
        let h = harness();
        let pipeline = pipeline();
        let stage = StageDefinition::new("build", "compiler").with_priority(Priority::High);

        let envelope = h.dispatcher.dispatch(DispatchRequest::new(&pipeline, &stage)).await.unwrap();

        let published = h.bus.published("tasks.compiler");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0]["task_id"], envelope.task_id);
        assert_eq!(published[0]["priority"], "high");
        assert_eq!(published[0]["constraints"]["timeout_ms"], 5_000);
        assert_eq!(published[0]["pipeline_context"]["stage_outputs"]["init"]["files"], 3);
        assert_eq!(published[0]["payload"]["pipeline_metadata"]["repo"], "r");

        let record = h.dispatcher.task_record(&envelope.task_id).await.unwrap().unwrap();
        assert_eq!(record.stage, "build");
        assert_eq!(record.pipeline_id, pipeline.id);
        assert_eq!(h.events.event_types(), vec!["pipeline.stage_dispatched"]);
    }

    #[tokio::test]
    async fn test_trace_is_child_of_parent() {
        let h = harness();
        let pipeline = pipeline();
        let stage = StageDefinition::new("build", "compiler");
        let parent = TraceContext::root();

        let envelope = h
            .dispatcher
            .dispatch(DispatchRequest::new(&pipeline, &stage).with_parent_trace(Some(&parent)))
            .await
            .unwrap();
        assert_eq!(envelope.trace.trace_id, parent.trace_id);
        assert_eq!(envelope.trace.parent_span_id.as_deref(), Some(parent.span_id.as_str()));

        let root = h.dispatcher.dispatch(DispatchRequest::new(&pipeline, &stage)).await.unwrap();
        assert!(root.trace.is_root());
        assert_ne!(root.trace.trace_id, parent.trace_id);
    }

    #[tokio::test]
    async fn test_invalid_envelope_is_not_published() {
        let h = harness();
        let pipeline = pipeline();
        let stage = StageDefinition::new("build", "compiler").with_max_retries(1);

        let err = h
            .dispatcher
            .dispatch(DispatchRequest::new(&pipeline, &stage).with_retry_count(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::ContractViolation(ref v) if v.field == "retry_count"));
        assert!(h.bus.published("tasks.compiler").is_empty());
        assert!(h.store.is_empty());
        assert!(h.events.is_empty());
    }

    #[tokio::test]
    async fn test_stage_with_existing_output_rejected() {
        let h = harness();
        let pipeline = pipeline();
        let stage = StageDefinition::new("init", "scaffold");

        let err = h.dispatcher.dispatch(DispatchRequest::new(&pipeline, &stage)).await.unwrap_err();
        assert!(matches!(err, ConductorError::ContractViolation(_)));
        assert!(h.bus.published("tasks.scaffold").is_empty());
    }

    #[tokio::test]
    async fn test_store_outage_is_transport_error() {
        let h = harness();
        h.store.set_available(false);
        let pipeline = pipeline();
        let stage = StageDefinition::new("build", "compiler");

        let err = h.dispatcher.dispatch(DispatchRequest::new(&pipeline, &stage)).await.unwrap_err();
        assert!(err.is_transient());
        assert!(h.bus.published("tasks.compiler").is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_record_is_missing() {
        let h = harness();
        h.store.set(&task_key("t9"), &json!("garbage"), None).await.unwrap();
        assert!(h.dispatcher.task_record("t9").await.unwrap().is_none());
        assert!(h.dispatcher.task_record("nope").await.unwrap().is_none());
    }
}
