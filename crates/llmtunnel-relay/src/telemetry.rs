//! Prometheus metrics emitted by the relay.
//!
//! Thin wrappers over the `metrics` macros so metric names and label sets
//! live in one place. Without an installed recorder these are no-ops.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::auth::Tier;

/// Record one rate-limit decision (`allowed`, `blocked` or `exempt`).
pub fn record_rate_limit_decision(decision: &'static str, tier: Tier, elapsed: Duration) {
    counter!(
        "llmtunnel_rate_limit_requests_total",
        "decision" => decision,
        "user_tier" => tier.as_str()
    )
    .increment(1);
    histogram!("llmtunnel_rate_limit_check_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn record_rate_limit_violation(tier: Tier, violation_type: &'static str) {
    counter!(
        "llmtunnel_rate_limit_violations_total",
        "user_tier" => tier.as_str(),
        "violation_type" => violation_type
    )
    .increment(1);
}

pub fn record_rate_limit_exemption(rule_id: &str, exemption_type: &'static str) {
    counter!(
        "llmtunnel_rate_limit_exemptions_total",
        "rule_id" => rule_id.to_string(),
        "exemption_type" => exemption_type
    )
    .increment(1);
}

/// Per-user counter levels after an admitted request.
pub fn record_rate_limit_usage(user_id: &str, window: u32, burst: u32, concurrent: u32) {
    gauge!("llmtunnel_rate_limit_window_usage", "user_id" => user_id.to_string())
        .set(f64::from(window));
    gauge!("llmtunnel_rate_limit_burst_usage", "user_id" => user_id.to_string())
        .set(f64::from(burst));
    gauge!("llmtunnel_rate_limit_concurrent", "user_id" => user_id.to_string())
        .set(f64::from(concurrent));
}

pub fn record_proxy_request(status: Option<u16>, elapsed: Duration) {
    let status_class = status.map_or_else(|| "error".to_string(), |s| format!("{}xx", s / 100));
    counter!("llmtunnel_proxy_requests_total", "status_class" => status_class).increment(1);
    histogram!("llmtunnel_proxy_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn record_health_check(healthy: bool) {
    let result = if healthy { "healthy" } else { "unhealthy" };
    counter!("llmtunnel_health_checks_total", "result" => result).increment(1);
}

pub fn record_webhook_delivery(outcome: &'static str) {
    counter!("llmtunnel_webhook_deliveries_total", "outcome" => outcome).increment(1);
}

pub fn record_quota_exceeded(resource_type: &'static str) {
    counter!("llmtunnel_quota_exceeded_total", "resource_type" => resource_type).increment(1);
}

pub fn set_connected_agents(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("llmtunnel_connected_agents").set(count as f64);
}
