//! Orchestrator configuration.
//!
//! Every retry, timeout and threshold used by the core lives here. Values come
//! from serde defaults, optionally a JSON document, then `CONDUCTOR_*`
//! environment variables.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::bus::{stream_name_for, StreamSubscriptionConfig};
use crate::errors::ConductorError;
use crate::observability::LogFormat;
use crate::resilience::{CircuitBreakerConfig, RetryConfig};

/// Configuration of one orchestrator process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConductorConfig {
    /// Prefix of task topics (`<prefix>.<worker_type>`).
    #[serde(default = "default_tasks_topic_prefix")]
    pub tasks_topic_prefix: String,
    /// Shared results topic, mirrored into `stream:<topic>`.
    #[serde(default = "default_results_topic")]
    pub results_topic: String,
    /// Consumer group of the result stream.
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Consumer name; must be stable across restarts of the same instance.
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,
    /// Stage window when the stage definition sets none.
    #[serde(default = "default_stage_timeout_ms")]
    pub default_stage_timeout_ms: u64,
    /// Event ids remembered in memory per process.
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    /// Lifetime of `event:<pipeline_id>:<event_id>` markers.
    #[serde(default = "default_dedup_ttl_ms")]
    pub dedup_ttl_ms: u64,
    /// Lifetime of `task:<task_id>` records.
    #[serde(default = "default_task_record_ttl_ms")]
    pub task_record_ttl_ms: u64,
    /// Entries per stream read.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Long-poll timeout of stream reads.
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
    /// Failed deliveries before an entry is dead-lettered.
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
    /// Entries of one batch handled concurrently.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Pause before redelivering entries whose handler failed.
    #[serde(default = "default_handler_retry_delay_ms")]
    pub handler_retry_delay_ms: u64,
    /// Interval of the read-after-create poll.
    #[serde(default = "default_consistency_poll_interval_ms")]
    pub consistency_poll_interval_ms: u64,
    /// Reads of the read-after-create poll.
    #[serde(default = "default_consistency_poll_attempts")]
    pub consistency_poll_attempts: u32,
    /// Backoff for reconnecting the result stream.
    #[serde(default = "RetryConfig::unbounded")]
    pub reconnect: RetryConfig,
    /// Backoff for repository and store writes.
    #[serde(default)]
    pub write_retry: RetryConfig,
    /// Defaults for per-worker-type circuit breakers.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_tasks_topic_prefix() -> String {
    "tasks".to_string()
}

fn default_results_topic() -> String {
    "results".to_string()
}

fn default_consumer_group() -> String {
    "orchestrator".to_string()
}

fn default_consumer_name() -> String {
    "orchestrator-1".to_string()
}

fn default_stage_timeout_ms() -> u64 {
    300_000
}

fn default_dedup_capacity() -> usize {
    10_000
}

fn default_dedup_ttl_ms() -> u64 {
    3_600_000
}

fn default_task_record_ttl_ms() -> u64 {
    86_400_000
}

fn default_batch_size() -> usize {
    16
}

fn default_block_ms() -> u64 {
    5_000
}

fn default_max_deliveries() -> u32 {
    5
}

fn default_max_in_flight() -> usize {
    8
}

fn default_handler_retry_delay_ms() -> u64 {
    1_000
}

fn default_consistency_poll_interval_ms() -> u64 {
    100
}

fn default_consistency_poll_attempts() -> u32 {
    10
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            tasks_topic_prefix: default_tasks_topic_prefix(),
            results_topic: default_results_topic(),
            consumer_group: default_consumer_group(),
            consumer_name: default_consumer_name(),
            default_stage_timeout_ms: default_stage_timeout_ms(),
            dedup_capacity: default_dedup_capacity(),
            dedup_ttl_ms: default_dedup_ttl_ms(),
            task_record_ttl_ms: default_task_record_ttl_ms(),
            batch_size: default_batch_size(),
            block_ms: default_block_ms(),
            max_deliveries: default_max_deliveries(),
            max_in_flight: default_max_in_flight(),
            handler_retry_delay_ms: default_handler_retry_delay_ms(),
            consistency_poll_interval_ms: default_consistency_poll_interval_ms(),
            consistency_poll_attempts: default_consistency_poll_attempts(),
            reconnect: RetryConfig::unbounded(),
            write_retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            log_format: LogFormat::default(),
        }
    }
}

fn parse_env_value<T: std::str::FromStr>(value: &str, name: &str) -> Result<T, ConductorError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConductorError::Config(format!("invalid value for {name}: '{value}'")))
}

impl ConductorConfig {
    /// Defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(text: &str) -> Result<Self, ConductorError> {
        let config: Self = serde_json::from_str(text)
            .map_err(|err| ConductorError::Config(format!("invalid configuration: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `CONDUCTOR_*` environment variables.
    pub fn from_env() -> Result<Self, ConductorError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Applies `CONDUCTOR_*` environment variables on top of `self`.
    pub fn apply_env(&mut self) -> Result<(), ConductorError> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Applies overrides read through `lookup`.
    ///
    /// Recognised names: `CONDUCTOR_TASKS_TOPIC_PREFIX`,
    /// `CONDUCTOR_RESULTS_TOPIC`, `CONDUCTOR_CONSUMER_GROUP`,
    /// `CONDUCTOR_CONSUMER_NAME`, `CONDUCTOR_DEFAULT_STAGE_TIMEOUT_MS`,
    /// `CONDUCTOR_DEDUP_CAPACITY`, `CONDUCTOR_DEDUP_TTL_MS`,
    /// `CONDUCTOR_TASK_RECORD_TTL_MS`, `CONDUCTOR_BATCH_SIZE`,
    /// `CONDUCTOR_BLOCK_MS`, `CONDUCTOR_MAX_DELIVERIES`,
    /// `CONDUCTOR_MAX_IN_FLIGHT`, `CONDUCTOR_BREAKER_FAILURE_THRESHOLD`,
    /// `CONDUCTOR_BREAKER_COOLDOWN_MS`, `CONDUCTOR_LOG_FORMAT`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConductorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("CONDUCTOR_TASKS_TOPIC_PREFIX") {
            self.tasks_topic_prefix = val;
        }
        if let Some(val) = lookup("CONDUCTOR_RESULTS_TOPIC") {
            self.results_topic = val;
        }
        if let Some(val) = lookup("CONDUCTOR_CONSUMER_GROUP") {
            self.consumer_group = val;
        }
        if let Some(val) = lookup("CONDUCTOR_CONSUMER_NAME") {
            self.consumer_name = val;
        }
        if let Some(val) = lookup("CONDUCTOR_DEFAULT_STAGE_TIMEOUT_MS") {
            self.default_stage_timeout_ms = parse_env_value(&val, "CONDUCTOR_DEFAULT_STAGE_TIMEOUT_MS")?;
        }
        if let Some(val) = lookup("CONDUCTOR_DEDUP_CAPACITY") {
            self.dedup_capacity = parse_env_value(&val, "CONDUCTOR_DEDUP_CAPACITY")?;
        }
        if let Some(val) = lookup("CONDUCTOR_DEDUP_TTL_MS") {
            self.dedup_ttl_ms = parse_env_value(&val, "CONDUCTOR_DEDUP_TTL_MS")?;
        }
        if let Some(val) = lookup("CONDUCTOR_TASK_RECORD_TTL_MS") {
            self.task_record_ttl_ms = parse_env_value(&val, "CONDUCTOR_TASK_RECORD_TTL_MS")?;
        }
        if let Some(val) = lookup("CONDUCTOR_BATCH_SIZE") {
            self.batch_size = parse_env_value(&val, "CONDUCTOR_BATCH_SIZE")?;
        }
        if let Some(val) = lookup("CONDUCTOR_BLOCK_MS") {
            self.block_ms = parse_env_value(&val, "CONDUCTOR_BLOCK_MS")?;
        }
        if let Some(val) = lookup("CONDUCTOR_MAX_DELIVERIES") {
            self.max_deliveries = parse_env_value(&val, "CONDUCTOR_MAX_DELIVERIES")?;
        }
        if let Some(val) = lookup("CONDUCTOR_MAX_IN_FLIGHT") {
            self.max_in_flight = parse_env_value(&val, "CONDUCTOR_MAX_IN_FLIGHT")?;
        }
        if let Some(val) = lookup("CONDUCTOR_BREAKER_FAILURE_THRESHOLD") {
            self.circuit_breaker.failure_threshold =
                parse_env_value(&val, "CONDUCTOR_BREAKER_FAILURE_THRESHOLD")?;
        }
        if let Some(val) = lookup("CONDUCTOR_BREAKER_COOLDOWN_MS") {
            self.circuit_breaker.cooldown_ms = parse_env_value(&val, "CONDUCTOR_BREAKER_COOLDOWN_MS")?;
        }
        if let Some(val) = lookup("CONDUCTOR_LOG_FORMAT") {
            self.log_format = val.parse()?;
        }
        self.validate()
    }

    /// Rejects empty names and zero sizes or windows.
    pub fn validate(&self) -> Result<(), ConductorError> {
        let names = [
            ("tasks_topic_prefix", &self.tasks_topic_prefix),
            ("results_topic", &self.results_topic),
            ("consumer_group", &self.consumer_group),
            ("consumer_name", &self.consumer_name),
        ];
        for (field, value) in names {
            if value.trim().is_empty() {
                return Err(ConductorError::Config(format!("{field} must not be empty")));
            }
        }

        let positive = [
            ("default_stage_timeout_ms", self.default_stage_timeout_ms),
            ("dedup_ttl_ms", self.dedup_ttl_ms),
            ("task_record_ttl_ms", self.task_record_ttl_ms),
            ("consistency_poll_interval_ms", self.consistency_poll_interval_ms),
            ("dedup_capacity", self.dedup_capacity as u64),
            ("batch_size", self.batch_size as u64),
            ("max_in_flight", self.max_in_flight as u64),
            ("max_deliveries", u64::from(self.max_deliveries)),
            ("consistency_poll_attempts", u64::from(self.consistency_poll_attempts)),
            ("circuit_breaker.failure_threshold", u64::from(self.circuit_breaker.failure_threshold)),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConductorError::Config(format!("{field} must be greater than 0")));
            }
        }
        Ok(())
    }

    /// Durable stream holding results.
    #[must_use]
    pub fn results_stream(&self) -> String {
        stream_name_for(&self.results_topic)
    }

    /// Settings of the result stream subscription.
    #[must_use]
    pub fn subscription_config(&self) -> StreamSubscriptionConfig {
        StreamSubscriptionConfig::new(
            self.results_stream(),
            self.consumer_group.clone(),
            self.consumer_name.clone(),
        )
        .with_batch_size(self.batch_size)
        .with_block(Duration::from_millis(self.block_ms))
        .with_max_deliveries(self.max_deliveries)
        .with_max_in_flight(self.max_in_flight)
        .with_handler_retry_delay(Duration::from_millis(self.handler_retry_delay_ms))
        .with_reconnect(self.reconnect.clone())
    }

    /// Lifetime of dedup markers.
    #[must_use]
    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_millis(self.dedup_ttl_ms)
    }

    /// Lifetime of task records.
    #[must_use]
    pub fn task_record_ttl(&self) -> Duration {
        Duration::from_millis(self.task_record_ttl_ms)
    }

    /// Sets the consumer name.
    #[must_use]
    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = name.into();
        self
    }

    /// Sets the default stage window.
    #[must_use]
    pub fn with_default_stage_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_stage_timeout_ms = timeout_ms;
        self
    }

    /// Sets the read-after-create poll.
    #[must_use]
    pub fn with_consistency_poll(mut self, interval_ms: u64, attempts: u32) -> Self {
        self.consistency_poll_interval_ms = interval_ms;
        self.consistency_poll_attempts = attempts;
        self
    }

    /// Sets the stream long-poll timeout.
    #[must_use]
    pub fn with_block_ms(mut self, block_ms: u64) -> Self {
        self.block_ms = block_ms;
        self
    }

    /// Sets the dead-letter threshold.
    #[must_use]
    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries;
        self
    }

    /// Sets the pause before redelivering failed entries.
    #[must_use]
    pub fn with_handler_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.handler_retry_delay_ms = delay_ms;
        self
    }

    /// Sets the write retry policy.
    #[must_use]
    pub fn with_write_retry(mut self, retry: RetryConfig) -> Self {
        self.write_retry = retry;
        self
    }

    /// Sets the reconnect policy.
    #[must_use]
    pub fn with_reconnect(mut self, retry: RetryConfig) -> Self {
        self.reconnect = retry;
        self
    }
}
