use crate::config::CircuitBreakerConfig;
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Read-only view of one operation's breaker record.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub requests: u32,
    pub failures: u32,
}

struct BreakerRecord {
    state: CircuitState,
    requests: u32,
    failures: u32,
    window_start: Instant,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

impl BreakerRecord {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            requests: 0,
            failures: 0,
            window_start: now,
            last_failure: None,
            probe_in_flight: false,
        }
    }

    fn maybe_reset_window(&mut self, now: Instant, window: std::time::Duration) {
        // Bounds memory of old statistics regardless of state transitions.
        if now.duration_since(self.window_start) > window {
            self.requests = 0;
            self.failures = 0;
            self.window_start = now;
        }
    }
}

/// Per-operation failure tracker shared by all sessions.
///
/// State transitions are the sole mutator of the records; they are logged
/// as observable events and never block the calling operation.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    records: Mutex<HashMap<String, BreakerRecord>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Gate a call. `Err(CircuitOpen)` means no attempt may be made.
    ///
    /// An open breaker past its recovery timeout moves to half-open and
    /// admits exactly one probe; further calls are rejected until the probe
    /// reports back.
    pub fn check(&self, operation: &str) -> Result<(), Error> {
        let now = Instant::now();
        let mut records = self.lock();
        let record = records
            .entry(operation.to_string())
            .or_insert_with(|| BreakerRecord::new(now));
        record.maybe_reset_window(now, self.config.monitoring_window());

        match record.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let recovered = record
                    .last_failure
                    .is_some_and(|at| now.duration_since(at) > self.config.recovery_timeout());
                if recovered {
                    record.state = CircuitState::HalfOpen;
                    record.probe_in_flight = true;
                    info!(operation, "circuit half-open, admitting probe");
                    Ok(())
                } else {
                    Err(Error::CircuitOpen {
                        operation: operation.to_string(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if record.probe_in_flight {
                    Err(Error::CircuitOpen {
                        operation: operation.to_string(),
                    })
                } else {
                    record.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self, operation: &str) {
        let now = Instant::now();
        let mut records = self.lock();
        let record = records
            .entry(operation.to_string())
            .or_insert_with(|| BreakerRecord::new(now));
        record.maybe_reset_window(now, self.config.monitoring_window());
        record.requests += 1;

        if record.state == CircuitState::HalfOpen {
            record.state = CircuitState::Closed;
            record.requests = 0;
            record.failures = 0;
            record.window_start = now;
            record.last_failure = None;
            record.probe_in_flight = false;
            info!(operation, "probe succeeded, circuit closed");
        }
    }

    pub fn record_failure(&self, operation: &str) {
        let now = Instant::now();
        let mut records = self.lock();
        let record = records
            .entry(operation.to_string())
            .or_insert_with(|| BreakerRecord::new(now));
        record.maybe_reset_window(now, self.config.monitoring_window());
        record.requests += 1;
        record.failures += 1;

        match record.state {
            CircuitState::HalfOpen => {
                record.state = CircuitState::Open;
                record.last_failure = Some(now);
                record.probe_in_flight = false;
                warn!(operation, "probe failed, circuit re-opened");
            }
            CircuitState::Closed => {
                let rate = f64::from(record.failures) / f64::from(record.requests);
                if record.requests >= self.config.volume_threshold
                    && rate >= self.config.failure_rate_threshold
                {
                    record.state = CircuitState::Open;
                    record.last_failure = Some(now);
                    warn!(
                        operation,
                        requests = record.requests,
                        failures = record.failures,
                        "failure rate {rate:.2} tripped circuit open"
                    );
                } else {
                    debug!(
                        operation,
                        requests = record.requests,
                        failures = record.failures,
                        "failure recorded"
                    );
                }
            }
            // Open breakers reject before any attempt; a failure here can
            // only come from a call that raced the transition. Keep it open.
            CircuitState::Open => {}
        }
    }

    pub fn state(&self, operation: &str) -> CircuitState {
        self.lock()
            .get(operation)
            .map_or(CircuitState::Closed, |record| record.state)
    }

    pub fn snapshot(&self, operation: &str) -> BreakerSnapshot {
        self.lock().get(operation).map_or(
            BreakerSnapshot {
                state: CircuitState::Closed,
                requests: 0,
                failures: 0,
            },
            |record| BreakerSnapshot {
                state: record.state,
                requests: record.requests,
                failures: record.failures,
            },
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BreakerRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry() -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_rate_threshold: 0.5,
            volume_threshold: 10,
            recovery_timeout_ms: 1_000,
            monitoring_window_ms: 60_000,
        })
    }

    fn fail_times(registry: &CircuitBreakerRegistry, operation: &str, times: u32) {
        for _ in 0..times {
            registry.check(operation).expect("closed breaker admits");
            registry.record_failure(operation);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_failures_trip_the_breaker() {
        let registry = registry();
        fail_times(&registry, "prepare", 10);

        assert_eq!(registry.state("prepare"), CircuitState::Open);
        assert!(matches!(
            registry.check("prepare"),
            Err(Error::CircuitOpen { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_stays_closed_below_volume_threshold() {
        let registry = registry();
        fail_times(&registry, "prepare", 9);
        assert_eq!(registry.state("prepare"), CircuitState::Closed);
        assert!(registry.check("prepare").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_outcomes_below_rate_threshold_stay_closed() {
        let registry = registry();
        for _ in 0..8 {
            registry.check("prepare").unwrap();
            registry.record_success("prepare");
        }
        fail_times(&registry, "prepare", 3);
        // 3 failures out of 11 requests is below the 0.5 rate.
        assert_eq!(registry.state("prepare"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_timeout_admits_single_probe() {
        let registry = registry();
        fail_times(&registry, "prepare", 10);
        assert!(registry.check("prepare").is_err());

        tokio::time::advance(Duration::from_millis(1_001)).await;

        assert!(registry.check("prepare").is_ok());
        assert_eq!(registry.state("prepare"), CircuitState::HalfOpen);
        // Second caller while the probe is outstanding is rejected.
        assert!(matches!(
            registry.check("prepare"),
            Err(Error::CircuitOpen { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_probe_closes_and_resets_counters() {
        let registry = registry();
        fail_times(&registry, "prepare", 10);
        tokio::time::advance(Duration::from_millis(1_001)).await;
        registry.check("prepare").expect("probe admitted");

        registry.record_success("prepare");

        let snapshot = registry.snapshot("prepare");
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.requests, 0);
        assert_eq!(snapshot.failures, 0);
        assert!(registry.check("prepare").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens_with_fresh_failure_time() {
        let registry = registry();
        fail_times(&registry, "prepare", 10);
        tokio::time::advance(Duration::from_millis(1_001)).await;
        registry.check("prepare").expect("probe admitted");

        registry.record_failure("prepare");
        assert_eq!(registry.state("prepare"), CircuitState::Open);

        // The re-open restarted the recovery clock.
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(registry.check("prepare").is_err());
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(registry.check("prepare").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitoring_window_reset_forgets_stale_statistics() {
        let registry = registry();
        fail_times(&registry, "prepare", 9);

        tokio::time::advance(Duration::from_millis(60_001)).await;

        // Window rolled: this failure is 1/1, not 10/10.
        registry.check("prepare").unwrap();
        registry.record_failure("prepare");
        assert_eq!(registry.state("prepare"), CircuitState::Closed);
        let snapshot = registry.snapshot("prepare");
        assert_eq!(snapshot.requests, 1);
        assert_eq!(snapshot.failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_are_tracked_independently() {
        let registry = registry();
        fail_times(&registry, "prepare", 10);
        assert_eq!(registry.state("prepare"), CircuitState::Open);
        assert_eq!(registry.state("tool:calculator"), CircuitState::Closed);
        assert!(registry.check("tool:calculator").is_ok());
    }
}
