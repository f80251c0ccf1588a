//! Failure isolation: backoff policy, per-operation circuit breakers, and
//! the retry coordinator that ties them together.

pub mod backoff;
pub mod breaker;
pub mod retry;

pub use breaker::{BreakerSnapshot, CircuitBreakerRegistry, CircuitState};
pub use retry::Retryer;
