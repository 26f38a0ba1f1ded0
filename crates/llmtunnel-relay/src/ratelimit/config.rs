//! Rate-limit configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::Tier;

/// Limits for one subject (a user of some tier, or an IP address).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSpec {
    pub window_secs: u64,
    pub max_requests: u32,
    pub burst_window_secs: u64,
    /// Requests admitted within one burst sub-window. The defaults match
    /// `max_requests`, so a whole window may be spent in one spike and the
    /// window limit is always the first to block a steady client.
    pub burst_max: u32,
    /// Simultaneous in-flight requests; `0` disables the cap.
    pub max_concurrent: u32,
}

impl Default for LimitSpec {
    fn default() -> Self {
        Self::per_minute(100, 100, 5)
    }
}

impl LimitSpec {
    /// A 60s window with a 10s burst sub-window.
    pub const fn per_minute(max_requests: u32, burst_max: u32, max_concurrent: u32) -> Self {
        Self {
            window_secs: 60,
            max_requests,
            burst_window_secs: 10,
            burst_max,
            max_concurrent,
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    pub const fn window_ms(&self) -> i64 {
        (self.window_secs * 1000) as i64
    }

    #[allow(clippy::cast_possible_wrap)]
    pub const fn burst_window_ms(&self) -> i64 {
        (self.burst_window_secs * 1000) as i64
    }

    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub free: LimitSpec,
    pub premium: LimitSpec,
    pub enterprise: LimitSpec,
    /// Applied to every client address independently of the user limits.
    pub ip: LimitSpec,
    /// Per-user exemption quotas reset after this long.
    pub exemption_quota_window_secs: u64,
    /// Rolling period covered by violation reports.
    pub report_period_secs: u64,
    /// Upper bound on retained decision events.
    pub max_report_events: usize,
    /// Counter state untouched for this long is pruned.
    pub idle_state_ttl_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            free: LimitSpec::per_minute(100, 100, 5),
            premium: LimitSpec::per_minute(1_000, 1_000, 20),
            enterprise: LimitSpec::per_minute(10_000, 10_000, 100),
            ip: LimitSpec::per_minute(300, 300, 0),
            exemption_quota_window_secs: 3600,
            report_period_secs: 24 * 3600,
            max_report_events: 100_000,
            idle_state_ttl_secs: 600,
        }
    }
}

impl RateLimitConfig {
    pub const fn for_tier(&self, tier: Tier) -> &LimitSpec {
        match tier {
            Tier::Free => &self.free,
            Tier::Premium => &self.premium,
            Tier::Enterprise => &self.enterprise,
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    pub const fn exemption_quota_window_ms(&self) -> i64 {
        (self.exemption_quota_window_secs * 1000) as i64
    }

    pub const fn report_period(&self) -> Duration {
        Duration::from_secs(self.report_period_secs)
    }
}
