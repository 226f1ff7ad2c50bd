//! Worker harness: task subscription, breaker, timeout and result publishing.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn, Instrument};

use super::{TaskExecutor, WorkerConfig, CIRCUIT_OPEN_CODE, TASK_TIMEOUT_CODE};
use crate::bus::{BusMessage, MessageBus, MessageHandler, PublishOptions, SubscriptionId};
use crate::contracts::{Envelope, ResultEnvelope, ResultError, ResultMetrics, ResultStatus, TaskEnvelope};
use crate::errors::ConductorError;
use crate::observability::task_span;
use crate::resilience::{CircuitBreakerRegistry, CircuitError};

/// Runs a [`TaskExecutor`] against the tasks of one worker type.
pub struct WorkerHarness {
    bus: Arc<dyn MessageBus>,
    executor: Arc<dyn TaskExecutor>,
    breakers: Arc<CircuitBreakerRegistry>,
    config: WorkerConfig,
}

impl std::fmt::Debug for WorkerHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHarness")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WorkerHarness {
    /// Creates a harness with its own breaker registry.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>, executor: Arc<dyn TaskExecutor>, config: WorkerConfig) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        Self {
            bus,
            executor,
            breakers,
            config,
        }
    }

    /// Shares a breaker registry between harnesses of one process.
    #[must_use]
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    /// Worker settings.
    #[must_use]
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// The breaker registry.
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Subscribes the harness to its task topic.
    pub async fn start(self: &Arc<Self>) -> Result<SubscriptionId, ConductorError> {
        let topic = self.config.task_topic();
        let handler: Arc<dyn MessageHandler> = Arc::clone(self) as Arc<dyn MessageHandler>;
        let id = self.bus.subscribe(&topic, handler).await?;
        info!(
            topic = %topic,
            worker_type = %self.config.worker_type,
            worker_id = %self.config.worker_id,
            "Worker subscribed"
        );
        Ok(id)
    }

    /// Runs `task` and builds its result. Never fails: every outcome maps
    /// to a result envelope.
    pub async fn execute(&self, task: &TaskEnvelope) -> ResultEnvelope {
        let breaker = self.breakers.breaker(&task.worker_type);
        let permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(CircuitError::Open { name, retry_after }) => {
                warn!(task_id = %task.task_id, breaker = %name, "Circuit open, task rejected");
                let error = ResultError::new(
                    CIRCUIT_OPEN_CODE,
                    format!("circuit '{name}' is open, retry in {}ms", retry_after.as_millis()),
                )
                .retryable(true);
                return ResultEnvelope::failure(task, &self.config.worker_id, ResultStatus::Failed, error);
            }
            Err(CircuitError::Inner(never)) => match never {},
        };

        let timeout_ms = task.constraints.timeout_ms;
        let started = Instant::now();
        let outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), self.executor.execute(task)).await;
        let metrics = ResultMetrics::with_duration(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));

        let result = match outcome {
            Ok(Ok(value)) => {
                permit.success();
                ResultEnvelope::success(task, &self.config.worker_id, value)
            }
            Ok(Err(err)) => {
                permit.failure();
                debug!(task_id = %task.task_id, code = %err.code, "Executor failed");
                ResultEnvelope::failure(task, &self.config.worker_id, ResultStatus::Failed, err)
            }
            Err(_) => {
                permit.failure();
                warn!(task_id = %task.task_id, timeout_ms, "Executor exceeded task timeout");
                let error = ResultError::new(TASK_TIMEOUT_CODE, format!("task exceeded {timeout_ms}ms"))
                    .retryable(true);
                ResultEnvelope::failure(task, &self.config.worker_id, ResultStatus::Timeout, error)
            }
        };
        result.with_metrics(metrics)
    }

    /// Executes `task` and publishes its result durably.
    pub async fn run_task(&self, task: &TaskEnvelope) -> Result<ResultEnvelope, ConductorError> {
        let result = self.execute(task).await;
        let payload = result.to_json()?;
        let receipt = self
            .bus
            .publish(&self.config.results_topic, &payload, PublishOptions::durable())
            .await?;
        info!(
            task_id = %task.task_id,
            status = %result.status,
            stream_entry_id = receipt.stream_entry_id.as_deref().unwrap_or(""),
            "Result published"
        );
        Ok(result)
    }
}

#[async_trait]
impl MessageHandler for WorkerHarness {
    async fn handle(&self, message: &BusMessage) -> Result<(), ConductorError> {
        let task = match TaskEnvelope::from_json(&message.payload) {
            Ok(task) => task,
            Err(violation) => {
                error!(
                    topic = %message.topic,
                    violation = %violation.to_dict(),
                    "Dropping invalid task envelope"
                );
                return Ok(());
            }
        };
        if task.worker_type != self.config.worker_type {
            warn!(
                task_id = %task.task_id,
                worker_type = %task.worker_type,
                expected = %self.config.worker_type,
                "Dropping task routed to another worker type"
            );
            return Ok(());
        }

        let span = task_span(&task.pipeline_id, task.stage(), &task.task_id, &task.trace);
        self.run_task(&task).instrument(span).await.map(|_| ())
    }
}
