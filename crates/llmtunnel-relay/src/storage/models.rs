//! Row types for relay storage.
//!
//! Timestamps are milliseconds since the Unix epoch.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TunnelRow {
    pub id: String,
    pub user_id: String,
    pub status: String,
    pub config: String,
    pub request_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub avg_latency_ms: f64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EndpointRow {
    pub id: String,
    pub tunnel_id: String,
    pub url: String,
    pub priority: i64,
    pub weight: i64,
    pub health_status: String,
    pub last_health_check_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActivityRow {
    pub id: i64,
    pub tunnel_id: String,
    pub user_id: String,
    pub action: String,
    pub details: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MetricsRow {
    pub id: i64,
    pub tunnel_id: String,
    pub request_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub total_latency_ms: i64,
    pub min_latency_ms: Option<i64>,
    pub max_latency_ms: Option<i64>,
    pub window_start: i64,
    pub flushed_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QuotaRow {
    pub id: String,
    pub user_id: String,
    pub resource_type: String,
    pub tier: String,
    pub period_start: i64,
    pub period_end: i64,
    pub current_usage: i64,
    pub limit_value: i64,
    pub exceeded_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QuotaEventRow {
    pub id: i64,
    pub quota_id: String,
    pub user_id: String,
    pub resource_type: String,
    pub delta: i64,
    pub new_total: i64,
    pub percentage_used: Option<f64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookRow {
    pub id: String,
    pub user_id: String,
    pub tunnel_id: String,
    pub url: String,
    pub secret: String,
    pub event_patterns: String,
    pub property_filters: String,
    pub is_active: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryRow {
    pub id: String,
    pub webhook_id: String,
    pub event_id: String,
    pub event_type: String,
    pub payload: String,
    pub status: String,
    pub attempt_count: i64,
    pub next_retry_at: Option<i64>,
    pub last_http_status: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub delivered_at: Option<i64>,
}
