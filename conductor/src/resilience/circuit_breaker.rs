//! Circuit breaker for calls workers make to volatile dependencies.
//!
//! One breaker is kept per worker type. The state machine is
//! `closed -> open -> half_open -> closed`:
//!
//! - closed: calls pass; consecutive failures are counted and reset on success
//! - open: calls fail fast until the cool-down window elapses
//! - half open: exactly one trial call passes; success closes the breaker,
//!   failure reopens it and restarts the cool-down
//!
//! Every state change bumps a generation counter. Permits remember the
//! generation they were issued in, and outcomes from an earlier generation
//! are ignored: a call admitted while closed cannot close an open breaker,
//! and only the trial permit decides a half-open breaker.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the breaker stays open before admitting a trial call.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    30_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Sets the failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Sets the cool-down window.
    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_ms = u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Cool-down as a duration.
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass.
    Closed,
    /// Calls fail fast.
    Open,
    /// One trial call may pass.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The breaker rejected the call without attempting it.
    #[error("Circuit '{name}' is open; retry in {retry_after:?}")]
    Open {
        /// Breaker name.
        name: String,
        /// Time until a trial call may be admitted.
        retry_after: Duration,
    },
    /// The call was attempted and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitError<E> {
    /// Returns true if the breaker rejected the call.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    generation: u64,
}

impl BreakerState {
    fn move_to(&mut self, state: CircuitState) {
        self.state = state;
        self.generation += 1;
    }
}

/// Point-in-time view of a breaker, for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures while closed.
    pub consecutive_failures: u32,
}

/// A single breaker guarding one dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
///
/// Report the outcome with [`CircuitPermit::success`] or
/// [`CircuitPermit::failure`]. Dropping an unreported trial permit frees the
/// half-open slot without changing state. Outcomes reported after the breaker
/// has changed state since admission are ignored.
#[derive(Debug)]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    generation: u64,
    reported: bool,
}

impl CircuitPermit<'_> {
    /// Whether this permit is the half-open trial.
    #[must_use]
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Records a successful call.
    pub fn success(mut self) {
        self.reported = true;
        self.breaker.record_success(self.generation, self.trial);
    }

    /// Records a failed call.
    pub fn failure(mut self) {
        self.reported = true;
        self.breaker.record_failure(self.generation, self.trial);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.reported {
            let mut inner = self.breaker.inner.lock();
            if inner.generation == self.generation {
                inner.trial_in_flight = false;
            }
        }
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    ///
    /// A zero failure threshold, possible through deserialization, is raised to 1.
    pub fn new(name: impl Into<String>, mut config: CircuitBreakerConfig) -> Self {
        config.failure_threshold = config.failure_threshold.max(1);
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
                generation: 0,
            }),
        }
    }

    /// Effective thresholds.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. An open breaker whose cool-down elapsed reads as half open.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) if opened_at.elapsed() >= self.config.cooldown() => {
                CircuitState::HalfOpen
            }
            (state, _) => state,
        }
    }

    /// Snapshot for logs and tests.
    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let consecutive_failures = self.inner.lock().consecutive_failures;
        CircuitSnapshot {
            name: self.name.clone(),
            state: self.state(),
            consecutive_failures,
        }
    }

    /// Asks for admission of one call.
    pub fn try_acquire(&self) -> Result<CircuitPermit<'_>, CircuitError<std::convert::Infallible>> {
        let mut inner = self.inner.lock();
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = inner.opened_at.map_or(Duration::MAX, |at| at.elapsed());
                let cooldown = self.config.cooldown();
                if elapsed < cooldown {
                    return Err(CircuitError::Open {
                        name: self.name.clone(),
                        retry_after: cooldown - elapsed,
                    });
                }
                info!(breaker = %self.name, "Circuit half open, admitting trial call");
                inner.move_to(CircuitState::HalfOpen);
                inner.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(CircuitError::Open {
                        name: self.name.clone(),
                        retry_after: Duration::ZERO,
                    });
                }
                inner.trial_in_flight = true;
                true
            }
        };
        let generation = inner.generation;
        drop(inner);

        Ok(CircuitPermit {
            breaker: self,
            trial,
            generation,
            reported: false,
        })
    }

    /// Runs `operation` if the breaker admits it and records the outcome.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire().map_err(|err| match err {
            CircuitError::Open { name, retry_after } => CircuitError::Open { name, retry_after },
            CircuitError::Inner(never) => match never {},
        })?;

        match operation().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(err) => {
                permit.failure();
                Err(CircuitError::Inner(err))
            }
        }
    }

    fn record_success(&self, generation: u64, trial: bool) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen if trial => {
                info!(breaker = %self.name, "Circuit closed");
                inner.move_to(CircuitState::Closed);
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn record_failure(&self, generation: u64, trial: bool) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        match inner.state {
            CircuitState::HalfOpen if trial => {
                warn!(breaker = %self.name, "Trial call failed, circuit reopened");
                inner.move_to(CircuitState::Open);
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        cooldown_ms = self.config.cooldown_ms,
                        "Circuit opened"
                    );
                    inner.move_to(CircuitState::Open);
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }
}

/// One breaker per worker type, created on first use.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Creates a registry whose breakers share `config`.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for `worker_type`.
    #[must_use]
    pub fn breaker(&self, worker_type: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(worker_type.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(worker_type, self.config.clone())))
            .clone()
    }

    /// Snapshots of every breaker, sorted by name.
    #[must_use]
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.iter().map(|entry| entry.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "llm",
            CircuitBreakerConfig::default()
                .with_failure_threshold(5)
                .with_cooldown(Duration::from_secs(10)),
        )
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        breaker.call(|| async { Err::<(), _>("backend down") }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32, CircuitError<&'static str>> {
        breaker.call(|| async { Ok::<_, &'static str>(7) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breaker = breaker();
        for _ in 0..4 {
            assert!(matches!(fail(&breaker).await, Err(CircuitError::Inner(_))));
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        // Fails fast without running the operation.
        let err = succeed(&breaker).await.unwrap_err();
        assert!(err.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let breaker = breaker();
        for _ in 0..4 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let breaker = breaker();
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_and_restarts_cooldown() {
        let breaker = breaker();
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(matches!(fail(&breaker).await, Err(CircuitError::Inner(_))));
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(succeed(&breaker).await.unwrap_err().is_open());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(succeed(&breaker).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let breaker = breaker();
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert!(breaker.try_acquire().is_err());

        drop(trial);
        let retry = breaker.try_acquire().unwrap();
        retry.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permit_admitted_while_closed_cannot_close_open_breaker() {
        let breaker = breaker();
        let slow = breaker.try_acquire().unwrap();
        for _ in 0..5 {
            breaker.try_acquire().unwrap().failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        slow.success();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_failures_do_not_reopen_or_double_count() {
        let breaker = breaker();
        let late: Vec<_> = (0..3).map(|_| breaker.try_acquire().unwrap()).collect();
        for _ in 0..5 {
            breaker.try_acquire().unwrap().failure();
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        let trial = breaker.try_acquire().unwrap();
        trial.success();
        assert_eq!(breaker.state(), CircuitState::Closed);

        for permit in late {
            permit.failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_failure_during_trial_keeps_single_trial() {
        let breaker = breaker();
        let slow = breaker.try_acquire().unwrap();
        for _ in 0..5 {
            breaker.try_acquire().unwrap().failure();
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());

        slow.failure();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().is_err());

        trial.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_success_during_trial_does_not_close() {
        let breaker = breaker();
        let slow = breaker.try_acquire().unwrap();
        for _ in 0..5 {
            breaker.try_acquire().unwrap().failure();
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        let trial = breaker.try_acquire().unwrap();

        slow.success();
        assert!(breaker.try_acquire().is_err());

        trial.failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_deserialized_zero_threshold_is_raised() {
        let config: CircuitBreakerConfig =
            serde_json::from_str(r#"{"failure_threshold": 0}"#).unwrap();
        let breaker = CircuitBreaker::new("llm", config);
        assert_eq!(breaker.config().failure_threshold, 1);
        assert_eq!(breaker.config().cooldown_ms, 30_000);
    }

    #[test]
    fn test_registry_one_breaker_per_worker_type() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let a = registry.breaker("codegen");
        let b = registry.breaker("codegen");
        let c = registry.breaker("tester");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.snapshots().len(), 2);
        assert_eq!(registry.snapshots()[0].name, "codegen");
    }
}
