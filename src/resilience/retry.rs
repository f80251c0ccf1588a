use super::backoff;
use super::breaker::CircuitBreakerRegistry;
use crate::config::{CircuitBreakerConfig, RetryConfig};
use crate::error::Error;
use std::future::Future;
use tracing::debug;

/// Wraps operations with a per-attempt timeout, circuit-breaker gating, and
/// a sequential bounded retry loop with backoff sleeps in between.
pub struct Retryer {
    breakers: CircuitBreakerRegistry,
}

impl Retryer {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: CircuitBreakerRegistry::new(config),
        }
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Run `op` under the named breaker. Retries are sequential, never
    /// fanned out; non-retryable errors surface immediately without
    /// consuming further attempts. Exhaustion wraps the last error with the
    /// attempt count and final circuit state.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        config: &RetryConfig,
        mut op: F,
    ) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.breakers.check(operation)?;

            let outcome = match tokio::time::timeout(config.attempt_timeout(), op()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!(
                    "attempt exceeded {}ms",
                    config.timeout_ms
                ))),
            };

            match outcome {
                Ok(value) => {
                    self.breakers.record_success(operation);
                    return Ok(value);
                }
                Err(error) => {
                    self.breakers.record_failure(operation);

                    if !error.is_retryable() {
                        return Err(error);
                    }
                    if attempt >= config.max_attempts {
                        return Err(Error::RetriesExhausted {
                            operation: operation.to_string(),
                            attempts: attempt,
                            circuit: self.breakers.state(operation),
                            source: Box::new(error),
                        });
                    }

                    let wait = backoff::delay(attempt, config);
                    debug!(
                        operation,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        %error,
                        "retrying after backoff"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}
