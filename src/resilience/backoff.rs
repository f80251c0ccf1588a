use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Delay before the retry following `attempt` (1-based).
///
/// Exponential growth capped at `max_delay_ms`, plus uniform jitter in
/// `[0, jitter_ms]`. Total never exceeds `max_delay_ms + jitter_ms`.
pub fn delay(attempt: u32, config: &RetryConfig) -> Duration {
    delay_with(attempt, config, |bound| {
        if bound == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=bound)
        }
    })
}

/// Same as [`delay`] with an injected jitter source, deterministic for tests.
pub fn delay_with(attempt: u32, config: &RetryConfig, jitter: impl FnOnce(u64) -> u64) -> Duration {
    let attempt = attempt.max(1);
    // powi saturates to inf for absurd attempts; min() brings it back down.
    let exponent = (attempt - 1).min(64) as i32;
    let raw = config.base_delay_ms as f64 * config.backoff_multiplier.powi(exponent);
    let capped = raw.min(config.max_delay_ms as f64).max(0.0) as u64;
    Duration::from_millis(capped + jitter(config.jitter_ms).min(config.jitter_ms))
}
