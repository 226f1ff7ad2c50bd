//! The pipeline state machine.
//!
//! Applies [`transition`] decisions: persists every step through the
//! repository, dispatches the next stage, arms watchdogs and records applied
//! event ids. Events for one pipeline are serialized by [`PipelineLocks`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dedup::EventDeduplicator;
use super::locks::PipelineLocks;
use super::transition::{transition, IgnoreReason, Transition};
use super::watchdog::TimeoutWatchdog;
use super::PipelineControl;
use crate::bus::{MessageBus, StreamSubscription};
use crate::cancellation::ShutdownToken;
use crate::catalog::{StageCatalog, StageDefinition};
use crate::config::ConductorConfig;
use crate::consumer::StageEventHandler;
use crate::contracts::TraceContext;
use crate::core::{NewPipeline, Pipeline, PipelineEvent, PipelineStatus, StageCompleteEvent, StageOutcome};
use crate::dispatch::{load_task_record, DispatchRequest, TaskDispatcher};
use crate::errors::{ConductorError, PipelineError};
use crate::events::{EventSink, LifecycleEvent, NoOpEventSink};
use crate::kv::KeyValueStore;
use crate::repository::{wait_for_pipeline, PipelineRepository, PipelineUpdate, RepositoryError};
use crate::resilience::with_retry_if;
use crate::utils::{elapsed_ms_since, generate_id};

/// What [`PipelineStateMachine::recover`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Result entries replayed from the durable stream.
    pub replayed: usize,
    /// Running pipelines whose watchdog was re-armed.
    pub rearmed: usize,
    /// Pipelines left in `evaluating` that were re-evaluated.
    pub reevaluated: usize,
    /// Pipelines left in `initiated` whose first stage was dispatched.
    pub redispatched: usize,
}

/// Drives pipelines from creation to a terminal status.
pub struct PipelineStateMachine {
    repository: Arc<dyn PipelineRepository>,
    store: Arc<dyn KeyValueStore>,
    catalog: StageCatalog,
    dispatcher: TaskDispatcher,
    dedup: EventDeduplicator,
    locks: PipelineLocks,
    watchdog: TimeoutWatchdog,
    timeouts: Mutex<Option<mpsc::UnboundedReceiver<PipelineEvent>>>,
    events: Arc<dyn EventSink>,
    config: ConductorConfig,
}

impl std::fmt::Debug for PipelineStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineStateMachine")
            .field("dispatcher", &self.dispatcher)
            .field("armed_watchdogs", &self.watchdog.len())
            .field("locked_pipelines", &self.locks.len())
            .finish_non_exhaustive()
    }
}

impl PipelineStateMachine {
    /// Creates a state machine publishing tasks on `bus`.
    #[must_use]
    pub fn new(
        repository: Arc<dyn PipelineRepository>,
        store: Arc<dyn KeyValueStore>,
        bus: Arc<dyn MessageBus>,
        catalog: StageCatalog,
        config: ConductorConfig,
    ) -> Self {
        let dispatcher = TaskDispatcher::new(bus, Arc::clone(&store), &config);
        let dedup = EventDeduplicator::new(Arc::clone(&store), config.dedup_capacity, config.dedup_ttl());
        let (watchdog, timeouts) = TimeoutWatchdog::channel();
        Self {
            repository,
            store,
            catalog,
            dispatcher,
            dedup,
            locks: PipelineLocks::new(),
            watchdog,
            timeouts: Mutex::new(Some(timeouts)),
            events: Arc::new(NoOpEventSink),
            config,
        }
    }

    /// Sets the lifecycle event sink, shared with the dispatcher.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.dispatcher = self.dispatcher.with_event_sink(Arc::clone(&events));
        self.events = events;
        self
    }

    /// The stage catalog.
    #[must_use]
    pub fn catalog(&self) -> &StageCatalog {
        &self.catalog
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    /// Task the pipeline's watchdog is armed for.
    #[must_use]
    pub fn armed_task(&self, pipeline_id: &str) -> Option<String> {
        self.watchdog.armed_task(pipeline_id)
    }

    /// Applies one event under the pipeline's lock.
    pub async fn handle_event(&self, event: PipelineEvent) -> Result<Transition, ConductorError> {
        let pipeline_id = event.pipeline_id().to_string();
        let _guard = self.locks.acquire(&pipeline_id).await;

        if let PipelineEvent::StageComplete(ref complete) = event {
            if self.dedup.is_seen(&complete.pipeline_id, &complete.event_id).await? {
                debug!(
                    pipeline_id = %complete.pipeline_id,
                    stage = %complete.stage,
                    event_id = %complete.event_id,
                    "Duplicate event ignored"
                );
                return Ok(Transition::Ignore(IgnoreReason::Duplicate));
            }
        }

        let pipeline = self.load(&pipeline_id).await?;
        let decision = transition(&pipeline, &event, &self.catalog);
        let applied = match self.apply(pipeline, &event, &decision).await {
            Ok(updated) => updated,
            Err(ConductorError::Repository(RepositoryError::Terminal { status, .. })) => {
                debug!(pipeline_id = %pipeline_id, %status, "Pipeline turned terminal concurrently");
                return Ok(Transition::Ignore(IgnoreReason::Terminal { status }));
            }
            Err(err) => return Err(err),
        };

        if let (PipelineEvent::StageComplete(complete), Some(_)) = (&event, &applied) {
            if let Err(err) = self.dedup.mark_seen(&complete.pipeline_id, &complete.event_id).await {
                warn!(
                    pipeline_id = %complete.pipeline_id,
                    event_id = %complete.event_id,
                    error = %err,
                    "Transition persisted but event marker not stored"
                );
                self.dedup.remember(&complete.pipeline_id, &complete.event_id);
            }
        }

        if applied.as_ref().is_some_and(Pipeline::is_terminal) {
            self.watchdog.disarm(&pipeline_id);
            self.locks.release(&pipeline_id);
        }
        Ok(decision)
    }

    async fn load(&self, pipeline_id: &str) -> Result<Pipeline, ConductorError> {
        let repository = &self.repository;
        let found = with_retry_if(
            &self.config.write_retry,
            pipeline_id,
            || async move {
                wait_for_pipeline(
                    repository.as_ref(),
                    pipeline_id,
                    Duration::from_millis(self.config.consistency_poll_interval_ms),
                    self.config.consistency_poll_attempts,
                )
                .await
            },
            RepositoryError::is_transient,
        )
        .await?;
        found.ok_or_else(|| ConductorError::NotFound(pipeline_id.to_string()))
    }

    async fn write(&self, pipeline_id: &str, update: PipelineUpdate) -> Result<Pipeline, ConductorError> {
        let repository = &self.repository;
        let update = &update;
        with_retry_if(
            &self.config.write_retry,
            pipeline_id,
            || async move { repository.update(pipeline_id, update.clone()).await },
            RepositoryError::is_transient,
        )
        .await
        .map_err(Into::into)
    }

    /// Performs the effects of `decision`. Returns the updated record, or
    /// `None` when nothing was written.
    async fn apply(
        &self,
        pipeline: Pipeline,
        event: &PipelineEvent,
        decision: &Transition,
    ) -> Result<Option<Pipeline>, ConductorError> {
        match decision {
            Transition::Ignore(reason) => {
                log_ignored(&pipeline, event, reason);
                Ok(None)
            }
            Transition::Advance { next } => {
                let PipelineEvent::StageComplete(complete) = event else {
                    return Ok(None);
                };
                let evaluating = self.record_completion(&pipeline, complete).await?;
                self.dispatch_stage(&evaluating, next, complete.trace.as_ref(), 0)
                    .await
                    .map(Some)
            }
            Transition::Complete => {
                let PipelineEvent::StageComplete(complete) = event else {
                    return Ok(None);
                };
                self.record_completion(&pipeline, complete).await?;
                let update = PipelineUpdate::new()
                    .with_status(PipelineStatus::Completed)
                    .with_current_task(None)
                    .with_progress(100.0);
                let completed = self.write(&pipeline.id, update).await?;
                info!(pipeline_id = %completed.id, "Pipeline completed");
                self.events
                    .emit(LifecycleEvent::PipelineCompleted {
                        pipeline_id: completed.id.clone(),
                    })
                    .await;
                Ok(Some(completed))
            }
            Transition::Fail(error) => {
                let update = PipelineUpdate::new()
                    .with_status(PipelineStatus::Failed)
                    .with_current_task(None)
                    .with_error(error.clone());
                let failed = self.write(&pipeline.id, update).await?;
                warn!(
                    pipeline_id = %failed.id,
                    stage = error.stage.as_deref().unwrap_or(""),
                    code = %error.code,
                    message = %error.message,
                    "Pipeline failed"
                );
                self.events
                    .emit(LifecycleEvent::PipelineFailed {
                        pipeline_id: failed.id.clone(),
                        stage: error.stage.clone(),
                        code: error.code.clone(),
                    })
                    .await;
                Ok(Some(failed))
            }
            Transition::Cancel { reason } => {
                let update = PipelineUpdate::new()
                    .with_status(PipelineStatus::Cancelled)
                    .with_current_task(None)
                    .with_error(PipelineError::cancelled(reason.clone(), pipeline.current_stage.clone()));
                let cancelled = self.write(&pipeline.id, update).await?;
                info!(pipeline_id = %cancelled.id, reason = %reason, "Pipeline cancelled");
                self.events
                    .emit(LifecycleEvent::PipelineCancelled {
                        pipeline_id: cancelled.id.clone(),
                        reason: reason.clone(),
                    })
                    .await;
                Ok(Some(cancelled))
            }
        }
    }

    /// Appends the stage output and persists `evaluating`.
    async fn record_completion(
        &self,
        pipeline: &Pipeline,
        complete: &StageCompleteEvent,
    ) -> Result<Pipeline, ConductorError> {
        let mut update = PipelineUpdate::new().with_status(PipelineStatus::Evaluating);
        if let StageOutcome::Succeeded { ref result } = complete.outcome {
            update = update.with_stage_output(&complete.stage, result.clone());
        }
        let completed = pipeline.stage_outputs.len()
            + usize::from(!pipeline.stage_outputs.contains(&complete.stage));
        let progress = self.catalog.progress(&pipeline.pipeline_type, completed);
        let evaluating = self.write(&pipeline.id, update.with_progress(progress)).await?;

        self.watchdog.disarm(&pipeline.id);
        info!(
            pipeline_id = %pipeline.id,
            stage = %complete.stage,
            event_id = %complete.event_id,
            progress,
            "Stage completed"
        );
        self.events
            .emit(LifecycleEvent::StageCompleted {
                pipeline_id: pipeline.id.clone(),
                stage: complete.stage.clone(),
                event_id: complete.event_id.clone(),
                progress,
            })
            .await;
        Ok(evaluating)
    }

    /// Dispatches `stage`, persists `running` and arms the watchdog.
    async fn dispatch_stage(
        &self,
        pipeline: &Pipeline,
        stage: &StageDefinition,
        parent_trace: Option<&TraceContext>,
        retry_count: u32,
    ) -> Result<Pipeline, ConductorError> {
        let request = DispatchRequest::new(pipeline, stage)
            .with_parent_trace(parent_trace)
            .with_retry_count(retry_count);
        let envelope = self.dispatcher.dispatch(request).await?;

        let mut update = PipelineUpdate::new()
            .with_status(PipelineStatus::Running)
            .with_current_stage(&stage.name)
            .with_current_task(Some(envelope.task_id.clone()))
            .with_retry_count(retry_count)
            .clearing_error();
        if retry_count > 0 {
            update = update.reopening();
        }
        let running = self.write(&pipeline.id, update).await?;

        let timeout_ms = envelope.constraints.timeout_ms;
        self.watchdog.arm(
            &pipeline.id,
            &stage.name,
            &envelope.task_id,
            timeout_ms,
            Duration::from_millis(timeout_ms),
        );
        Ok(running)
    }

    fn first_stage(&self, pipeline_type: &str) -> Result<&StageDefinition, ConductorError> {
        self.catalog
            .first_stage(pipeline_type)
            .ok_or_else(|| ConductorError::Config(format!("unknown pipeline type '{pipeline_type}'")))
    }

    /// Creates a pipeline and dispatches its first stage.
    pub async fn create_pipeline(&self, request: NewPipeline) -> Result<Pipeline, ConductorError> {
        let first = self.first_stage(&request.pipeline_type)?.clone();
        let local = Pipeline::from_request(&request);
        let _guard = self.locks.acquire(&local.id).await;

        let repository = &self.repository;
        let local_ref = &local;
        let id = with_retry_if(
            &self.config.write_retry,
            &local.id,
            || async move { repository.create(local_ref).await },
            RepositoryError::is_transient,
        )
        .await?;
        info!(pipeline_id = %id, pipeline_type = %local.pipeline_type, name = %local.name, "Pipeline created");
        self.events
            .emit(LifecycleEvent::PipelineCreated {
                pipeline_id: id.clone(),
                pipeline_type: local.pipeline_type.clone(),
            })
            .await;

        let readable = wait_for_pipeline(
            self.repository.as_ref(),
            &id,
            Duration::from_millis(self.config.consistency_poll_interval_ms),
            self.config.consistency_poll_attempts,
        )
        .await?;
        let pipeline = readable.unwrap_or(local);

        self.dispatch_stage(&pipeline, &first, None, 0).await
    }

    /// Reads a pipeline.
    pub async fn get_pipeline(&self, pipeline_id: &str) -> Result<Option<Pipeline>, ConductorError> {
        Ok(self.repository.get(pipeline_id).await?)
    }

    /// Cancels a non-terminal pipeline.
    pub async fn cancel_pipeline(&self, pipeline_id: &str, reason: &str) -> Result<Pipeline, ConductorError> {
        let decision = self
            .handle_event(PipelineEvent::Cancel {
                pipeline_id: pipeline_id.to_string(),
                reason: reason.to_string(),
            })
            .await?;
        if let Transition::Ignore(reason) = decision {
            return Err(ConductorError::invalid_state(pipeline_id, reason.to_string()));
        }
        self.load(pipeline_id).await
    }

    /// Re-dispatches the stage a `failed` pipeline stopped at.
    pub async fn retry_stage(&self, pipeline_id: &str) -> Result<Pipeline, ConductorError> {
        let _guard = self.locks.acquire(pipeline_id).await;
        let pipeline = self.load(pipeline_id).await?;
        if pipeline.status != PipelineStatus::Failed {
            return Err(ConductorError::invalid_state(
                pipeline_id,
                format!("only failed pipelines can be retried, status is {}", pipeline.status),
            ));
        }
        let stage_name = pipeline
            .current_stage
            .clone()
            .ok_or_else(|| ConductorError::invalid_state(pipeline_id, "no stage to retry"))?;
        let stage = self
            .catalog
            .stage(&pipeline.pipeline_type, &stage_name)
            .ok_or_else(|| {
                ConductorError::invalid_state(pipeline_id, format!("stage '{stage_name}' is not in the catalog"))
            })?
            .clone();

        let retry_count = pipeline.retry_count + 1;
        if retry_count > stage.max_retries {
            return Err(ConductorError::invalid_state(
                pipeline_id,
                format!("stage '{stage_name}' already retried {} times", pipeline.retry_count),
            ));
        }

        info!(pipeline_id, stage = %stage_name, retry_count, "Retrying stage");
        self.dispatch_stage(&pipeline, &stage, None, retry_count).await
    }

    /// Replays unacknowledged results, then resumes unfinished pipelines.
    ///
    /// Must complete before new work is accepted.
    pub async fn recover(&self, results: &StreamSubscription) -> Result<RecoveryReport, ConductorError> {
        results.start().await?;
        let drained = results.drain().await?;
        let mut report = RecoveryReport {
            replayed: drained.read,
            ..RecoveryReport::default()
        };

        for pipeline in self.repository.list_unfinished().await? {
            match pipeline.status {
                PipelineStatus::Running => {
                    if self.rearm(&pipeline).await? {
                        report.rearmed += 1;
                    }
                }
                PipelineStatus::Evaluating => {
                    if self.reevaluate(&pipeline).await? {
                        report.reevaluated += 1;
                    }
                }
                PipelineStatus::Initiated => {
                    let _guard = self.locks.acquire(&pipeline.id).await;
                    let first = self.first_stage(&pipeline.pipeline_type)?.clone();
                    self.dispatch_stage(&pipeline, &first, None, 0).await?;
                    report.redispatched += 1;
                }
                _ => {}
            }
        }
        info!(
            replayed = report.replayed,
            rearmed = report.rearmed,
            reevaluated = report.reevaluated,
            redispatched = report.redispatched,
            "Recovery finished"
        );
        Ok(report)
    }

    async fn rearm(&self, pipeline: &Pipeline) -> Result<bool, ConductorError> {
        let (Some(stage), Some(task_id)) = (pipeline.current_stage.as_deref(), pipeline.current_task_id.as_deref())
        else {
            warn!(pipeline_id = %pipeline.id, "Running pipeline without an in-flight task");
            return Ok(false);
        };

        let (timeout_ms, started) = match load_task_record(self.store.as_ref(), task_id).await? {
            Some(record) if record.timeout_ms > 0 => (record.timeout_ms, record.dispatched_at),
            _ => {
                let timeout_ms = self
                    .catalog
                    .stage(&pipeline.pipeline_type, stage)
                    .map_or(self.config.default_stage_timeout_ms, |def| {
                        def.effective_timeout_ms(self.config.default_stage_timeout_ms)
                    });
                (timeout_ms, pipeline.updated_at)
            }
        };
        let remaining = timeout_ms.saturating_sub(elapsed_ms_since(started));
        debug!(pipeline_id = %pipeline.id, stage, task_id, remaining_ms = remaining, "Re-arming watchdog");
        self.watchdog
            .arm(&pipeline.id, stage, task_id, timeout_ms, Duration::from_millis(remaining));
        Ok(true)
    }

    async fn reevaluate(&self, pipeline: &Pipeline) -> Result<bool, ConductorError> {
        let Some(stage) = pipeline.current_stage.as_deref() else {
            return Ok(false);
        };
        let Some(output) = pipeline.stage_outputs.get(stage) else {
            warn!(pipeline_id = %pipeline.id, stage, "Evaluating pipeline has no output for its stage");
            return Ok(false);
        };
        let event_id = pipeline.current_task_id.clone().unwrap_or_else(generate_id);
        let event = StageCompleteEvent::succeeded(pipeline.id.clone(), stage, event_id, output.clone());
        let decision = self.handle_event(PipelineEvent::StageComplete(event)).await?;
        Ok(!matches!(decision, Transition::Ignore(_)))
    }

    /// Spawns the task applying watchdog timeouts. Only the first call spawns.
    pub fn spawn_timeout_listener(self: &Arc<Self>, shutdown: ShutdownToken) -> Option<JoinHandle<()>> {
        let mut timeouts = self.timeouts.lock().take()?;
        let machine = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = timeouts.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                machine.handle_timeout(event).await;
            }
            machine.watchdog.shutdown();
            debug!("Timeout listener stopped");
        }))
    }

    async fn handle_timeout(&self, event: PipelineEvent) {
        let PipelineEvent::StageTimedOut {
            ref pipeline_id,
            ref stage,
            ref task_id,
            timeout_ms,
        } = event
        else {
            return;
        };
        let (pipeline_id, stage, task_id) = (pipeline_id.clone(), stage.clone(), task_id.clone());
        match self.handle_event(event).await {
            Ok(decision) => debug!(pipeline_id = %pipeline_id, transition = decision.name(), "Timeout handled"),
            Err(err) if err.is_transient() => {
                warn!(pipeline_id = %pipeline_id, error = %err, "Timeout not applied, retrying later");
                self.watchdog.arm(
                    &pipeline_id,
                    &stage,
                    &task_id,
                    timeout_ms,
                    Duration::from_millis(self.config.handler_retry_delay_ms),
                );
            }
            Err(err) => error!(pipeline_id = %pipeline_id, error = %err, "Timeout could not be applied"),
        }
    }
}

fn log_ignored(pipeline: &Pipeline, event: &PipelineEvent, reason: &IgnoreReason) {
    match reason {
        IgnoreReason::StageMismatch { .. } | IgnoreReason::SupersededTask { .. } => warn!(
            pipeline_id = %pipeline.id,
            event = event.kind(),
            reason = %reason,
            "Out-of-order event ignored"
        ),
        IgnoreReason::UnknownStage { .. } => error!(
            pipeline_id = %pipeline.id,
            event = event.kind(),
            reason = %reason,
            "Event for a stage missing from the catalog"
        ),
        _ => debug!(
            pipeline_id = %pipeline.id,
            event = event.kind(),
            reason = %reason,
            "Event ignored"
        ),
    }
}

#[async_trait]
impl StageEventHandler for PipelineStateMachine {
    async fn on_stage_complete(&self, event: StageCompleteEvent) -> Result<Transition, ConductorError> {
        self.handle_event(PipelineEvent::StageComplete(event)).await
    }
}

#[async_trait]
impl PipelineControl for PipelineStateMachine {
    async fn create_pipeline(&self, request: NewPipeline) -> Result<Pipeline, ConductorError> {
        PipelineStateMachine::create_pipeline(self, request).await
    }

    async fn get_pipeline(&self, pipeline_id: &str) -> Result<Option<Pipeline>, ConductorError> {
        PipelineStateMachine::get_pipeline(self, pipeline_id).await
    }

    async fn cancel_pipeline(&self, pipeline_id: &str, reason: &str) -> Result<Pipeline, ConductorError> {
        PipelineStateMachine::cancel_pipeline(self, pipeline_id, reason).await
    }

    async fn retry_stage(&self, pipeline_id: &str) -> Result<Pipeline, ConductorError> {
        PipelineStateMachine::retry_stage(self, pipeline_id).await
    }
}
