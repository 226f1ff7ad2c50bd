//! Resilience primitives: circuit breakers and retry with backoff.

mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitError, CircuitPermit,
    CircuitSnapshot, CircuitState,
};
pub use retry::{with_retry, with_retry_if, BackoffStrategy, JitterStrategy, RetryConfig, RetryState};
