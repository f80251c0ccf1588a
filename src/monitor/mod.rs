//! Periodic health probing and connectivity verdicts shared by all sessions.

use crate::api::ApiClient;
use crate::config::MonitorConfig;
use crate::error::Error;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityStatus {
    Unknown,
    Healthy,
    Degraded,
    Offline,
}

/// Aggregated connectivity view. Replaced whole on every probe cycle,
/// never partially mutated mid-read.
#[derive(Debug, Clone)]
pub struct ConnectivityVerdict {
    pub status: ConnectivityStatus,
    pub latency_ms: Option<u64>,
    pub services: HashMap<String, bool>,
    pub checked_at: Option<Instant>,
}

impl ConnectivityVerdict {
    fn initial() -> Self {
        Self {
            status: ConnectivityStatus::Unknown,
            latency_ms: None,
            services: HashMap::new(),
            checked_at: None,
        }
    }
}

/// Outcome of a caller-triggered diagnostic probe.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub success: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// Runs a periodic health check (latency-sampled GET) and a heartbeat
/// (HEAD liveness probe); a failed heartbeat forces an immediate
/// out-of-cycle health check. Health failures feed an alert-only counter,
/// deliberately separate from the circuit breaker's statistics.
pub struct ConnectionMonitor {
    client: Arc<ApiClient>,
    config: MonitorConfig,
    verdict: RwLock<ConnectivityVerdict>,
    consecutive_failures: AtomicU32,
    recheck: Notify,
    cancel: CancellationToken,
}

impl ConnectionMonitor {
    pub fn new(client: Arc<ApiClient>, config: MonitorConfig) -> Arc<Self> {
        Arc::new(Self {
            client,
            config,
            verdict: RwLock::new(ConnectivityVerdict::initial()),
            consecutive_failures: AtomicU32::new(0),
            recheck: Notify::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Start the periodic tasks. Idempotent per monitor instance is not
    /// required; call once at construction time.
    pub fn spawn(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        tokio::spawn(async move { monitor.health_loop().await });
        let monitor = Arc::clone(self);
        tokio::spawn(async move { monitor.heartbeat_loop().await });
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn verdict(&self) -> ConnectivityVerdict {
        self.verdict
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// OS-level connectivity transition (online/offline). Recomputes the
    /// verdict immediately instead of waiting for the next timer tick.
    pub fn notify_online_change(&self, online: bool) {
        if !online {
            self.replace_verdict(ConnectivityVerdict {
                status: ConnectivityStatus::Offline,
                latency_ms: None,
                services: HashMap::new(),
                checked_at: Some(Instant::now()),
            });
        }
        self.recheck.notify_one();
    }

    /// On-demand diagnostic probe. Does not touch the periodic counters or
    /// the published verdict.
    pub async fn probe(&self) -> ProbeOutcome {
        let started = Instant::now();
        match self.checked_health().await {
            Ok(_) => ProbeOutcome {
                success: true,
                latency_ms: Some(started.elapsed().as_millis() as u64),
                error: None,
            },
            Err(error) => ProbeOutcome {
                success: false,
                latency_ms: None,
                error: Some(error.to_string()),
            },
        }
    }

    async fn health_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.health_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.recheck.notified() => {}
            }
            self.run_health_check().await;
        }
    }

    async fn heartbeat_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.client.heartbeat().await.is_err() {
                debug!("heartbeat failed, forcing health check");
                self.run_health_check().await;
            }
        }
    }

    pub(crate) async fn run_health_check(&self) {
        let started = Instant::now();
        let verdict = match self.checked_health().await {
            Ok(payload) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                let services: HashMap<String, bool> = payload
                    .services
                    .iter()
                    .map(|(name, status)| (name.clone(), service_healthy(status)))
                    .collect();
                let all_up =
                    service_healthy(&payload.status) && services.values().all(|healthy| *healthy);
                ConnectivityVerdict {
                    status: if all_up {
                        ConnectivityStatus::Healthy
                    } else {
                        ConnectivityStatus::Degraded
                    },
                    latency_ms: Some(started.elapsed().as_millis() as u64),
                    services,
                    checked_at: Some(Instant::now()),
                }
            }
            Err(error) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= self.config.alert_threshold {
                    warn!(failures, %error, "health check failing repeatedly");
                } else {
                    debug!(failures, %error, "health check failed");
                }
                ConnectivityVerdict {
                    status: ConnectivityStatus::Offline,
                    latency_ms: None,
                    services: HashMap::new(),
                    checked_at: Some(Instant::now()),
                }
            }
        };
        self.replace_verdict(verdict);
    }

    async fn checked_health(&self) -> Result<crate::types::HealthPayload, Error> {
        match tokio::time::timeout(self.config.health_timeout(), self.client.health()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "health check exceeded {}ms",
                self.config.health_timeout_ms
            ))),
        }
    }

    fn replace_verdict(&self, verdict: ConnectivityVerdict) {
        *self
            .verdict
            .write()
            .unwrap_or_else(PoisonError::into_inner) = verdict;
    }
}

fn service_healthy(status: &str) -> bool {
    matches!(
        status.trim().to_ascii_lowercase().as_str(),
        "ok" | "healthy" | "up"
    )
}
