//! Reference worker runtime.
//!
//! A worker subscribes to `tasks.<worker_type>`, runs each task through a
//! [`TaskExecutor`] and answers with exactly one result envelope on the
//! results topic, mirrored into the durable stream.

mod harness;

pub use harness::WorkerHarness;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::contracts::{ResultError, TaskEnvelope};
use crate::resilience::CircuitBreakerConfig;
use crate::utils::generate_id;

/// Code reported when the worker type's breaker rejects a task.
pub const CIRCUIT_OPEN_CODE: &str = "CIRCUIT_OPEN";

/// Code reported when the executor exceeds the task's `timeout_ms`.
pub const TASK_TIMEOUT_CODE: &str = "TASK_TIMEOUT";

/// The business logic of a worker type.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Executes one task. The returned value becomes the stage output.
    async fn execute(&self, task: &TaskEnvelope) -> Result<serde_json::Value, ResultError>;
}

/// Worker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker category; selects the task topic.
    pub worker_type: String,
    /// Instance id reported in results.
    #[serde(default = "generate_id")]
    pub worker_id: String,
    /// Prefix of task topics.
    #[serde(default = "default_tasks_topic_prefix")]
    pub tasks_topic_prefix: String,
    /// Topic results are published on.
    #[serde(default = "default_results_topic")]
    pub results_topic: String,
    /// Breaker settings for the worker type.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

fn default_tasks_topic_prefix() -> String {
    "tasks".to_string()
}

fn default_results_topic() -> String {
    "results".to_string()
}

impl WorkerConfig {
    /// Settings for `worker_type` with a generated instance id.
    #[must_use]
    pub fn new(worker_type: impl Into<String>) -> Self {
        Self {
            worker_type: worker_type.into(),
            worker_id: generate_id(),
            tasks_topic_prefix: default_tasks_topic_prefix(),
            results_topic: default_results_topic(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }

    /// Sets the instance id.
    #[must_use]
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Sets the topics.
    #[must_use]
    pub fn with_topics(mut self, tasks_topic_prefix: impl Into<String>, results_topic: impl Into<String>) -> Self {
        self.tasks_topic_prefix = tasks_topic_prefix.into();
        self.results_topic = results_topic.into();
        self
    }

    /// Sets the breaker settings.
    #[must_use]
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Topic the worker subscribes to.
    #[must_use]
    pub fn task_topic(&self) -> String {
        crate::contracts::task_topic(&self.tasks_topic_prefix, &self.worker_type)
    }
}
