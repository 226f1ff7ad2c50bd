//! Result consumption.
//!
//! [`ResultConsumer`] is the handler behind the single durable subscription
//! on the results stream. It turns a bus message into at most one
//! [`StageCompleteEvent`] per logical result:
//!
//! 1. validate the result envelope; invalid ones are logged and acknowledged
//! 2. resolve the stage from the task record, else from the pipeline's
//!    in-flight task; unresolvable results are stale and dropped
//! 3. persist the stage output of successful results (write-once)
//! 4. hand the event to the state machine
//!
//! Only transport errors reach the subscription, which leaves the entry
//! pending for redelivery.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, warn, Instrument};

use crate::bus::{BusMessage, MessageHandler};
use crate::contracts::{Envelope, ResultEnvelope, TraceContext};
use crate::core::{Pipeline, StageCompleteEvent};
use crate::dispatch::load_task_record;
use crate::errors::ConductorError;
use crate::kv::KeyValueStore;
use crate::machine::Transition;
use crate::observability::task_span;
use crate::repository::{PipelineRepository, PipelineUpdate, RepositoryError};

/// Receiver of resolved stage-complete events.
#[async_trait]
pub trait StageEventHandler: Send + Sync {
    /// Applies the event and reports the transition taken.
    async fn on_stage_complete(&self, event: StageCompleteEvent) -> Result<Transition, ConductorError>;
}

/// Stage a result answers.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStage {
    /// Stage name.
    pub stage: String,
    /// Trace of the task, when the task record was found.
    pub trace: Option<TraceContext>,
}

/// Handler of the shared results stream.
pub struct ResultConsumer {
    store: Arc<dyn KeyValueStore>,
    repository: Arc<dyn PipelineRepository>,
    handler: Arc<dyn StageEventHandler>,
}

impl std::fmt::Debug for ResultConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultConsumer").finish_non_exhaustive()
    }
}

impl ResultConsumer {
    /// Creates a consumer feeding `handler`.
    #[must_use]
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        repository: Arc<dyn PipelineRepository>,
        handler: Arc<dyn StageEventHandler>,
    ) -> Self {
        Self {
            store,
            repository,
            handler,
        }
    }

    /// Resolves which stage `result` answers.
    ///
    /// Returns `None` for stale results: no task record and not the
    /// pipeline's in-flight task.
    pub async fn resolve(
        &self,
        result: &ResultEnvelope,
    ) -> Result<Option<ResolvedStage>, ConductorError> {
        if let Some(record) = load_task_record(self.store.as_ref(), &result.task_id).await? {
            if record.pipeline_id != result.pipeline_id {
                error!(
                    task_id = %result.task_id,
                    pipeline_id = %result.pipeline_id,
                    recorded_pipeline_id = %record.pipeline_id,
                    "Result pipeline does not match its task record"
                );
                return Ok(None);
            }
            return Ok(Some(ResolvedStage {
                stage: record.stage,
                trace: Some(record.trace),
            }));
        }

        let pipeline = self.repository.get(&result.pipeline_id).await?;
        Ok(pipeline.and_then(|pipeline| {
            let in_flight = pipeline.current_task_id.as_deref() == Some(result.task_id.as_str());
            in_flight
                .then_some(pipeline.current_stage)
                .flatten()
                .map(|stage| ResolvedStage { stage, trace: None })
        }))
    }

    /// Records the stage output before the event reaches the state machine.
    ///
    /// The write happens outside the pipeline lock. A timeout or cancel applied
    /// between this write and the event leaves the terminal pipeline holding the
    /// output of the stage it stopped on; the event is then ignored. Outputs are
    /// write-once and terminal pipelines reject writes, so no recorded output is
    /// ever replaced.
    async fn persist_output(
        &self,
        result: &ResultEnvelope,
        stage: &str,
    ) -> Result<(), ConductorError> {
        let pipeline = self
            .repository
            .get(&result.pipeline_id)
            .await?
            .ok_or_else(|| ConductorError::NotFound(result.pipeline_id.clone()))?;
        if !accepts_output(&pipeline, stage, &result.task_id) {
            debug!(
                pipeline_id = %pipeline.id,
                stage,
                status = %pipeline.status,
                "Not recording output for a stage the pipeline is not waiting on"
            );
            return Ok(());
        }

        let update = PipelineUpdate::new().with_stage_output(stage, result.result.clone());
        match self.repository.update(&pipeline.id, update).await {
            Ok(_) => Ok(()),
            Err(RepositoryError::Terminal { status, .. }) => {
                debug!(pipeline_id = %pipeline.id, stage, %status, "Pipeline turned terminal, output discarded");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn consume(&self, result: ResultEnvelope) -> Result<(), ConductorError> {
        let Some(resolved) = self.resolve(&result).await? else {
            warn!(
                pipeline_id = %result.pipeline_id,
                task_id = %result.task_id,
                "Stale result with no known task, dropping"
            );
            return Ok(());
        };

        let span = resolved_span(&result, &resolved);
        self.apply(result, resolved).instrument(span).await
    }

    async fn apply(&self, result: ResultEnvelope, resolved: ResolvedStage) -> Result<(), ConductorError> {
        if result.success {
            self.persist_output(&result, &resolved.stage).await?;
        }

        let event = match result.error {
            Some(err) if !result.success => StageCompleteEvent::failed(
                result.pipeline_id.clone(),
                resolved.stage.clone(),
                result.task_id.clone(),
                err,
            ),
            _ => StageCompleteEvent::succeeded(
                result.pipeline_id.clone(),
                resolved.stage.clone(),
                result.task_id.clone(),
                result.result,
            ),
        }
        .with_trace(resolved.trace);

        match self.handler.on_stage_complete(event).await {
            Ok(transition) => {
                debug!(transition = transition.name(), "Result applied");
                Ok(())
            }
            Err(err) if err.is_transient() => Err(err),
            Err(err) => {
                error!(
                    pipeline_id = %result.pipeline_id,
                    stage = %resolved.stage,
                    task_id = %result.task_id,
                    error = %err,
                    "Result could not be applied"
                );
                Ok(())
            }
        }
    }
}

fn accepts_output(pipeline: &Pipeline, stage: &str, task_id: &str) -> bool {
    !pipeline.is_terminal()
        && pipeline.current_stage.as_deref() == Some(stage)
        && pipeline
            .current_task_id
            .as_deref()
            .map_or(true, |current| current == task_id)
        && !pipeline.stage_outputs.contains(stage)
}

fn resolved_span(result: &ResultEnvelope, resolved: &ResolvedStage) -> tracing::Span {
    match resolved.trace {
        Some(ref trace) => task_span(&result.pipeline_id, &resolved.stage, &result.task_id, trace),
        None => tracing::info_span!(
            "task",
            pipeline_id = %result.pipeline_id,
            stage = %resolved.stage,
            task_id = %result.task_id,
        ),
    }
}

#[async_trait]
impl MessageHandler for ResultConsumer {
    async fn handle(&self, message: &BusMessage) -> Result<(), ConductorError> {
        let result = match ResultEnvelope::from_json(&message.payload) {
            Ok(result) => result,
            Err(violation) => {
                error!(
                    topic = %message.topic,
                    entry_id = message.entry_id.as_deref().unwrap_or(""),
                    violation = %violation.to_dict(),
                    payload = %message.payload,
                    "Rejecting invalid result envelope"
                );
                return Ok(());
            }
        };

        debug!(
            pipeline_id = %result.pipeline_id,
            task_id = %result.task_id,
            worker_id = %result.worker_id,
            entry_id = message.entry_id.as_deref().unwrap_or(""),
            "Result received"
        );
        self.consume(result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{ResultError, ResultStatus, TaskEnvelope};
    use crate::core::{NewPipeline, PipelineStatus, StageOutcome};
    use crate::dispatch::TaskRecord;
    use crate::kv::{task_key, InMemoryKeyValueStore};
    use crate::machine::IgnoreReason;
    use crate::repository::InMemoryPipelineRepository;
    use crate::testing::fixtures::task_envelope;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<StageCompleteEvent>>,
        fail_with: Mutex<Option<ConductorError>>,
    }

    #[async_trait]
    impl StageEventHandler for Recorder {
        async fn on_stage_complete(&self, event: StageCompleteEvent) -> Result<Transition, ConductorError> {
            if let Some(err) = self.fail_with.lock().take() {
                return Err(err);
            }
            self.events.lock().push(event);
            Ok(Transition::Ignore(IgnoreReason::Duplicate))
        }
    }

    struct Harness {
        store: Arc<InMemoryKeyValueStore>,
        repository: Arc<InMemoryPipelineRepository>,
        recorder: Arc<Recorder>,
        consumer: ResultConsumer,
        pipeline: Pipeline,
        task: TaskEnvelope,
    }

    async fn harness() -> Harness {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let repository = Arc::new(InMemoryPipelineRepository::new());
        let recorder = Arc::new(Recorder::default());
        let consumer = ResultConsumer::new(store.clone(), repository.clone(), recorder.clone());

        let mut pipeline = Pipeline::from_request(&NewPipeline::new("app", "demo"));
        let task = task_envelope(&pipeline.id, "init", "scaffold");
        pipeline.status = PipelineStatus::Running;
        pipeline.current_stage = Some("init".into());
        pipeline.current_task_id = Some(task.task_id.clone());
        repository.insert(pipeline.clone());

        let record = serde_json::to_value(TaskRecord::from_envelope(&task)).unwrap();
        store.set(&task_key(&task.task_id), &record, None).await.unwrap();

        Harness {
            store,
            repository,
            recorder,
            consumer,
            pipeline,
            task,
        }
    }

    fn message(payload: serde_json::Value) -> BusMessage {
        BusMessage::live("results", payload)
    }

    #[tokio::test]
    async fn test_success_persists_output_and_emits_event() {
        let h = harness().await;
        let result = ResultEnvelope::success(&h.task, "w1", json!({"files": 4}));
        h.consumer.handle(&message(result.to_json().unwrap())).await.unwrap();

        let stored = h.repository.snapshot(&h.pipeline.id).unwrap();
        assert_eq!(stored.stage_outputs.get("init"), Some(&json!({"files": 4})));

        let events = h.recorder.events.lock().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stage, "init");
        assert_eq!(events[0].event_id, h.task.task_id);
        assert_eq!(events[0].trace.as_ref(), Some(&h.task.trace));
    }

    #[tokio::test]
    async fn test_failure_emits_failed_event_without_output() {
        let h = harness().await;
        let result = ResultEnvelope::failure(
            &h.task,
            "w1",
            ResultStatus::Failed,
            ResultError::new("SCAFFOLD_ERROR", "template missing"),
        );
        h.consumer.handle(&message(result.to_json().unwrap())).await.unwrap();

        assert!(h.repository.snapshot(&h.pipeline.id).unwrap().stage_outputs.is_empty());
        let events = h.recorder.events.lock().clone();
        assert!(matches!(events[0].outcome, StageOutcome::Failed { ref error } if error.code == "SCAFFOLD_ERROR"));
    }

    #[tokio::test]
    async fn test_invalid_envelope_is_acknowledged() {
        let h = harness().await;
        let mut payload = ResultEnvelope::success(&h.task, "w1", json!({})).to_json().unwrap();
        payload["status"] = json!("failed");

        h.consumer.handle(&message(payload)).await.unwrap();
        assert!(h.recorder.events.lock().is_empty());
        assert_eq!(h.repository.update_count(), 0);
    }

    #[tokio::test]
    async fn test_falls_back_to_in_flight_task() {
        let h = harness().await;
        h.store.delete(&task_key(&h.task.task_id)).await.unwrap();

        let result = ResultEnvelope::success(&h.task, "w1", json!({}));
        let resolved = h.consumer.resolve(&result).await.unwrap().unwrap();
        assert_eq!(resolved.stage, "init");
        assert!(resolved.trace.is_none());
    }

    #[tokio::test]
    async fn test_stale_result_dropped() {
        let h = harness().await;
        let unknown = task_envelope(&h.pipeline.id, "init", "scaffold");
        let result = ResultEnvelope::success(&unknown, "w1", json!({}));

        h.consumer.handle(&message(result.to_json().unwrap())).await.unwrap();
        assert!(h.recorder.events.lock().is_empty());
        assert_eq!(h.repository.update_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_handler_error_propagates() {
        let h = harness().await;
        *h.recorder.fail_with.lock() = Some(ConductorError::transport("kv down"));

        let result = ResultEnvelope::success(&h.task, "w1", json!({}));
        let err = h.consumer.handle(&message(result.to_json().unwrap())).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_permanent_handler_error_is_acknowledged() {
        let h = harness().await;
        *h.recorder.fail_with.lock() = Some(ConductorError::NotFound("p".into()));

        let result = ResultEnvelope::success(&h.task, "w1", json!({}));
        h.consumer.handle(&message(result.to_json().unwrap())).await.unwrap();
    }

    #[tokio::test]
    async fn test_output_not_written_for_terminal_pipeline() {
        let h = harness().await;
        h.repository
            .update(
                &h.pipeline.id,
                PipelineUpdate::new().with_status(PipelineStatus::Cancelled),
            )
            .await
            .unwrap();

        let result = ResultEnvelope::success(&h.task, "w1", json!({"late": true}));
        h.consumer.handle(&message(result.to_json().unwrap())).await.unwrap();
        assert!(h.repository.snapshot(&h.pipeline.id).unwrap().stage_outputs.is_empty());
        assert_eq!(h.recorder.events.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_output_written_before_timeout_stays_once() {
        let h = harness().await;
        let result = ResultEnvelope::success(&h.task, "w1", json!({"files": 4}));
        h.consumer.handle(&message(result.to_json().unwrap())).await.unwrap();

        // The stage timeout is applied before the result event.
        h.repository
            .update(&h.pipeline.id, PipelineUpdate::new().with_status(PipelineStatus::Failed))
            .await
            .unwrap();

        let redelivered = ResultEnvelope::success(&h.task, "w2", json!({"files": 9}));
        h.consumer.handle(&message(redelivered.to_json().unwrap())).await.unwrap();

        let stored = h.repository.snapshot(&h.pipeline.id).unwrap();
        assert_eq!(stored.status, PipelineStatus::Failed);
        assert_eq!(stored.stage_outputs.stages().collect::<Vec<_>>(), vec!["init"]);
        assert_eq!(stored.stage_outputs.get("init"), Some(&json!({"files": 4})));
    }

    #[tokio::test]
    async fn test_repository_outage_is_transient() {
        let h = harness().await;
        h.repository.set_available(false);

        let result = ResultEnvelope::success(&h.task, "w1", json!({}));
        let err = h.consumer.handle(&message(result.to_json().unwrap())).await.unwrap_err();
        assert!(err.is_transient());
    }
}
