use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::util::{is_local_endpoint_url, parse_bool_flag};

/// Retry behavior for one control-plane operation class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_ms: u64,
    pub timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter_ms: 250,
            timeout_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Fraction of failed requests within the window that trips the breaker.
    pub failure_rate_threshold: f64,
    /// Minimum requests in the window before the rate is meaningful.
    pub volume_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub monitoring_window_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            volume_threshold: 10,
            recovery_timeout_ms: 30_000,
            monitoring_window_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn monitoring_window(&self) -> Duration {
        Duration::from_millis(self.monitoring_window_ms)
    }
}

/// Which tool calls skip the human decision channel, and how long a
/// published approval request stays actionable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    pub auto_approve_tools: Vec<String>,
    pub auto_approve_all: bool,
    pub expiry_ms: Option<u64>,
}

pub const DEFAULT_APPROVAL_EXPIRY_MS: u64 = 5 * 60 * 1000;

impl ApprovalPolicy {
    pub fn auto_approves(&self, tool_name: &str) -> bool {
        self.auto_approve_all || self.auto_approve_tools.iter().any(|t| t == tool_name)
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_millis(self.expiry_ms.unwrap_or(DEFAULT_APPROVAL_EXPIRY_MS))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub health_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub health_timeout_ms: u64,
    /// Consecutive health-check failures before the monitor logs an alert.
    pub alert_threshold: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            health_interval_ms: 30_000,
            heartbeat_interval_ms: 60_000,
            health_timeout_ms: 5_000,
            alert_threshold: 3,
        }
    }
}

impl MonitorConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub base_url: String,
    pub api_key: Option<String>,
    pub retry: RetryConfig,
    pub breaker: CircuitBreakerConfig,
    pub approvals: ApprovalPolicy,
    pub monitor: MonitorConfig,
    /// Consecutive undecodable stream frames tolerated before the session
    /// fails with a protocol error.
    pub malformed_frame_limit: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        let base_url = std::env::var("STREAMGATE_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:8080".to_string());
        let api_key = std::env::var("STREAMGATE_API_KEY").ok().and_then(|v| {
            if v.trim().is_empty() {
                None
            } else {
                Some(v)
            }
        });

        let mut retry = RetryConfig::default();
        if let Some(attempts) = env_u64("STREAMGATE_MAX_ATTEMPTS") {
            retry.max_attempts = attempts as u32;
        }
        if let Some(timeout) = env_u64("STREAMGATE_ATTEMPT_TIMEOUT_MS") {
            retry.timeout_ms = timeout;
        }

        let mut approvals = ApprovalPolicy::default();
        if let Some(value) = std::env::var("STREAMGATE_AUTO_APPROVE")
            .ok()
            .and_then(parse_bool_flag)
        {
            approvals.auto_approve_all = value;
        }
        if let Ok(tools) = std::env::var("STREAMGATE_AUTO_APPROVE_TOOLS") {
            approvals.auto_approve_tools = tools
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(ToOwned::to_owned)
                .collect();
        }
        approvals.expiry_ms = env_u64("STREAMGATE_APPROVAL_EXPIRY_MS");

        Ok(Self {
            base_url,
            api_key,
            retry,
            breaker: CircuitBreakerConfig::default(),
            approvals,
            monitor: MonitorConfig::default(),
            malformed_frame_limit: 5,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            bail!(
                "Invalid STREAMGATE_BASE_URL '{}': expected http:// or https:// URL",
                self.base_url
            );
        }

        if !self.is_local_endpoint() && self.api_key.is_none() {
            bail!(
                "STREAMGATE_API_KEY must be set for non-local endpoints (url: '{}')",
                self.base_url
            );
        }

        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }

        if !(0.0..=1.0).contains(&self.breaker.failure_rate_threshold) {
            bail!(
                "breaker.failure_rate_threshold must be within [0, 1], got {}",
                self.breaker.failure_rate_threshold
            );
        }

        if self.malformed_frame_limit == 0 {
            bail!("malformed_frame_limit must be at least 1");
        }

        Ok(())
    }

    pub fn is_local_endpoint(&self) -> bool {
        is_local_endpoint_url(&self.base_url)
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}
