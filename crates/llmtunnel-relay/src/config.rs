//! Typed relay configuration.
//!
//! Every section defaults independently, so a config file only needs the
//! fields it overrides. Loaded with `llmtunnel_core::config::load_config`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::quota::QuotaConfig;
use crate::ratelimit::RateLimitConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub health: HealthConfig,
    pub rate_limit: RateLimitConfig,
    pub quota: QuotaConfig,
    pub webhook: WebhookConfig,
    pub tunnel: TunnelServiceConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub metrics_flush_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            probe_timeout_secs: 5,
            metrics_flush_interval_secs: 300,
        }
    }
}

impl HealthConfig {
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub const fn metrics_flush_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_flush_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Per-attempt HTTP timeout.
    pub timeout_secs: u64,
    /// One slot per attempt, the initial attempt included. The first slot
    /// is taken by the attempt made on dispatch; each later slot is the
    /// delay after the preceding failure. Its length is the attempt budget.
    pub retry_schedule_secs: Vec<u64>,
    pub sweep_interval_secs: u64,
    /// Max due deliveries re-attempted per sweep.
    pub sweep_batch: i64,
    /// Capacity of the in-process event queue.
    pub event_queue: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            retry_schedule_secs: vec![1, 5, 30, 300, 3600],
            sweep_interval_secs: 1,
            sweep_batch: 100,
            event_queue: 1024,
        }
    }
}

impl WebhookConfig {
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Total attempts a delivery gets before it is failed.
    pub fn max_attempts(&self) -> usize {
        self.retry_schedule_secs.len().max(1)
    }

    /// Delay before the next attempt once `attempts` have failed, or `None`
    /// when the attempt budget is spent.
    pub fn retry_delay(&self, attempts: usize) -> Option<Duration> {
        if attempts == 0 || attempts >= self.max_attempts() {
            return None;
        }
        self.retry_schedule_secs
            .get(attempts)
            .map(|s| Duration::from_secs(*s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelServiceConfig {
    /// Idle time after which a `disconnected`/`error` tunnel is deleted.
    pub stale_retention_secs: u64,
    pub expiry_sweep_interval_secs: u64,
    /// How long a new agent session has to send its `register` frame.
    pub register_timeout_secs: u64,
}

impl Default for TunnelServiceConfig {
    fn default() -> Self {
        Self {
            stale_retention_secs: 7 * 24 * 3600,
            expiry_sweep_interval_secs: 3600,
            register_timeout_secs: 10,
        }
    }
}

impl TunnelServiceConfig {
    pub const fn stale_retention(&self) -> Duration {
        Duration::from_secs(self.stale_retention_secs)
    }

    pub const fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_interval_secs)
    }

    pub const fn register_timeout(&self) -> Duration {
        Duration::from_secs(self.register_timeout_secs)
    }
}
