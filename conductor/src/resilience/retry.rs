//! Retry utilities with configurable backoff and jitter strategies.
//!
//! Used for transport-level recovery: reconnecting a stream subscription,
//! re-attempting repository writes, and the worker harness publishing results.
//! Pipeline-level retries are never automatic; see
//! [`crate::machine::PipelineStateMachine::retry_stage`].

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Doubles after every failure.
    #[default]
    Exponential,
    /// Grows by `base_delay_ms` after every failure.
    Linear,
    /// Always `base_delay_ms`.
    Constant,
}

/// Randomization applied on top of the backoff delay.
///
/// Reconnecting orchestrator instances must not hammer the transport in
/// lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Exact backoff delay.
    None,
    /// Uniform in `[0, delay]`.
    #[default]
    Full,
    /// `delay / 2` plus uniform in `[0, delay / 2]`.
    Equal,
    /// Uniform in `[base, previous * 3]`, capped.
    Decorrelated,
}

/// Retry policy for one kind of operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts including the first; 0 retries forever.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// First delay, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound of any delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth of the delay.
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    /// Randomization of the delay.
    #[serde(default)]
    pub jitter_strategy: JitterStrategy,
}

fn default_max_attempts() -> usize {
    5
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::Full,
        }
    }
}

impl RetryConfig {
    /// Five attempts, exponential from 100ms with full jitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Retries forever; used for long-lived subscriptions.
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Sets the attempt limit; 0 means unbounded.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the first delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the delay growth.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the randomization.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }
}

/// Progress of one retried operation or reconnect loop.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Retries made so far.
    pub attempt: usize,
    /// Previous delay, for decorrelated jitter.
    previous_delay_ms: Option<u64>,
}

impl RetryState {
    /// Fresh state, no retries made.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets after a success so the next failure starts from the base delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.previous_delay_ms = None;
    }

    /// Returns true once the next attempt would exceed `max_attempts`.
    #[must_use]
    pub fn is_exhausted(&self, config: &RetryConfig) -> bool {
        config.max_attempts != 0 && self.attempt + 1 >= config.max_attempts
    }

    /// Delay before the next attempt, without advancing.
    #[must_use]
    pub fn calculate_delay(&mut self, config: &RetryConfig) -> Duration {
        let (base, cap) = (config.base_delay_ms, config.max_delay_ms);
        let exponent = u32::try_from(self.attempt).unwrap_or(u32::MAX);

        let delay = match config.backoff_strategy {
            BackoffStrategy::Exponential => base
                .saturating_mul(2u64.saturating_pow(exponent))
                .min(cap),
            BackoffStrategy::Linear => base
                .saturating_mul(u64::from(exponent).saturating_add(1))
                .min(cap),
            BackoffStrategy::Constant => base.min(cap),
        };

        let jittered = match config.jitter_strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let prev = self.previous_delay_ms.unwrap_or(base);
                let upper = prev.saturating_mul(3).min(cap);
                if upper <= base {
                    base
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                }
            }
        };

        self.previous_delay_ms = Some(jittered);
        Duration::from_millis(jittered)
    }

    /// Decides whether to retry, advancing the attempt counter when it does.
    #[must_use]
    pub fn next_delay(&mut self, config: &RetryConfig) -> Option<Duration> {
        if self.is_exhausted(config) {
            return None;
        }
        let delay = self.calculate_delay(config);
        self.attempt += 1;
        Some(delay)
    }
}

/// Runs `operation`, retrying every error under `config`.
pub async fn with_retry<T, E, F, Fut>(config: &RetryConfig, key: &str, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    with_retry_if(config, key, operation, |_| true).await
}

/// Runs `operation`, retrying only errors `retryable` accepts.
///
/// `key` names the operation in logs.
pub async fn with_retry_if<T, E, F, Fut, P>(
    config: &RetryConfig,
    key: &str,
    mut operation: F,
    retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut state = RetryState::new();

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) if !retryable(&err) => return Err(err),
            Err(err) => match state.next_delay(config) {
                Some(delay) => {
                    tracing::debug!(
                        key,
                        attempt = state.attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Retrying after error"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    tracing::warn!(key, attempts = state.attempt + 1, error = %err, "Retries exhausted");
                    return Err(err);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn no_jitter() -> RetryConfig {
        RetryConfig::new()
            .with_base_delay_ms(100)
            .with_jitter(JitterStrategy::None)
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_delay_ms, 100);
        assert_eq!(config.backoff_strategy, BackoffStrategy::Exponential);
    }

    #[test]
    fn test_retry_config_deserialize_partial() {
        let config: RetryConfig = serde_json::from_str(r#"{"max_attempts": 2, "jitter_strategy": "none"}"#).unwrap();
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.base_delay_ms, 100);
        assert_eq!(config.jitter_strategy, JitterStrategy::None);
    }

    #[test]
    fn test_calculate_delay_exponential_no_jitter() {
        let config = no_jitter();
        let mut state = RetryState::new();

        assert_eq!(state.next_delay(&config), Some(Duration::from_millis(100)));
        assert_eq!(state.next_delay(&config), Some(Duration::from_millis(200)));
        assert_eq!(state.next_delay(&config), Some(Duration::from_millis(400)));
    }

    #[test]
    fn test_calculate_delay_linear_and_constant() {
        let mut state = RetryState::new();
        state.attempt = 2;
        let linear = no_jitter().with_backoff(BackoffStrategy::Linear);
        assert_eq!(state.calculate_delay(&linear), Duration::from_millis(300));

        let constant = no_jitter().with_backoff(BackoffStrategy::Constant);
        assert_eq!(state.calculate_delay(&constant), Duration::from_millis(100));
    }

    #[test]
    fn test_calculate_delay_capped_at_max() {
        let config = no_jitter().with_base_delay_ms(1000).with_max_delay_ms(5000);
        let mut state = RetryState::new();
        state.attempt = 40;
        assert_eq!(state.calculate_delay(&config), Duration::from_millis(5000));
    }

    #[test]
    fn test_full_jitter_bounded() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant);
        let mut state = RetryState::new();
        for _ in 0..20 {
            assert!(state.calculate_delay(&config) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_exhaustion_and_reset() {
        let config = no_jitter().with_max_attempts(3);
        let mut state = RetryState::new();
        assert!(state.next_delay(&config).is_some());
        assert!(state.next_delay(&config).is_some());
        assert!(state.next_delay(&config).is_none());

        state.reset();
        assert_eq!(state.next_delay(&config), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_unbounded_never_exhausts() {
        let config = RetryConfig::unbounded();
        let mut state = RetryState::new();
        state.attempt = 10_000;
        assert!(!state.is_exhausted(&config));
    }

    #[tokio::test]
    async fn test_with_retry_success_after_failures() {
        let config = RetryConfig::new()
            .with_max_attempts(5)
            .with_base_delay_ms(1)
            .with_jitter(JitterStrategy::None);
        let calls = Arc::new(AtomicUsize::new(0));

        let result: Result<i32, String> = with_retry(&config, "test", || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("attempt {n}"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_after_max_attempts() {
        let config = RetryConfig::new()
            .with_max_attempts(3)
            .with_base_delay_ms(1)
            .with_jitter(JitterStrategy::None);
        let calls = Arc::new(AtomicUsize::new(0));

        let result: Result<i32, String> = with_retry(&config, "test", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("always fails".to_string())
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_if_stops_on_permanent_error() {
        let config = RetryConfig::new().with_base_delay_ms(1);
        let calls = Arc::new(AtomicUsize::new(0));

        let result: Result<i32, String> = with_retry_if(
            &config,
            "test",
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("permanent".to_string())
                }
            },
            |err| err != "permanent",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
