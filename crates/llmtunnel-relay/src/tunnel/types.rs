//! Tunnel domain types and their conversions from storage rows.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::config::TunnelConfig;
use super::state::TunnelStatus;
use crate::storage::{ActivityRow, DatabaseError, EndpointRow, MetricsRow, TunnelRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl HealthStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(Self::Healthy),
            "unhealthy" => Ok(Self::Unhealthy),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown health status: {other}")),
        }
    }
}

/// Cumulative counters persisted on the tunnel row by metrics flushes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelMetricsSnapshot {
    pub request_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tunnel {
    pub id: String,
    pub user_id: String,
    pub status: TunnelStatus,
    pub config: TunnelConfig,
    pub metrics: TunnelMetricsSnapshot,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<TunnelRow> for Tunnel {
    type Error = DatabaseError;

    fn try_from(row: TunnelRow) -> Result<Self, Self::Error> {
        Ok(Self {
            status: row.status.parse().map_err(DatabaseError::Corrupt)?,
            config: TunnelConfig::from_stored(&row.config)?,
            metrics: TunnelMetricsSnapshot {
                request_count: row.request_count,
                success_count: row.success_count,
                error_count: row.error_count,
                avg_latency_ms: row.avg_latency_ms,
            },
            id: row.id,
            user_id: row.user_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelEndpoint {
    pub id: String,
    pub tunnel_id: String,
    pub url: String,
    pub priority: i64,
    pub weight: i64,
    pub health_status: HealthStatus,
    pub last_health_check_at: Option<i64>,
}

impl TryFrom<EndpointRow> for TunnelEndpoint {
    type Error = DatabaseError;

    fn try_from(row: EndpointRow) -> Result<Self, Self::Error> {
        Ok(Self {
            health_status: row.health_status.parse().map_err(DatabaseError::Corrupt)?,
            id: row.id,
            tunnel_id: row.tunnel_id,
            url: row.url,
            priority: row.priority,
            weight: row.weight,
            last_health_check_at: row.last_health_check_at,
        })
    }
}

/// Endpoint as declared by an agent or an API caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSpec {
    pub url: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_weight")]
    pub weight: i64,
}

const fn default_weight() -> i64 {
    1
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub id: i64,
    pub tunnel_id: String,
    pub user_id: String,
    pub action: String,
    pub details: serde_json::Value,
    pub created_at: i64,
}

impl From<ActivityRow> for ActivityEntry {
    fn from(row: ActivityRow) -> Self {
        let details = serde_json::from_str(&row.details)
            .unwrap_or(serde_json::Value::String(row.details));
        Self {
            id: row.id,
            tunnel_id: row.tunnel_id,
            user_id: row.user_id,
            action: row.action,
            details,
            created_at: row.created_at,
        }
    }
}

/// One flushed metrics window.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsWindow {
    pub request_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub average_latency_ms: f64,
    pub min_latency_ms: Option<i64>,
    pub max_latency_ms: Option<i64>,
    pub window_start: i64,
    pub flushed_at: i64,
}

impl From<MetricsRow> for MetricsWindow {
    #[allow(clippy::cast_precision_loss)]
    fn from(row: MetricsRow) -> Self {
        let average_latency_ms = if row.request_count == 0 {
            0.0
        } else {
            row.total_latency_ms as f64 / row.request_count as f64
        };
        Self {
            request_count: row.request_count,
            success_count: row.success_count,
            error_count: row.error_count,
            average_latency_ms,
            min_latency_ms: row.min_latency_ms,
            max_latency_ms: row.max_latency_ms,
            window_start: row.window_start,
            flushed_at: row.flushed_at,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn row(status: &str, config: &str) -> TunnelRow {
        TunnelRow {
            id: "t1".into(),
            user_id: "u1".into(),
            status: status.into(),
            config: config.into(),
            request_count: 0,
            success_count: 0,
            error_count: 0,
            avg_latency_ms: 0.0,
            created_at: 1,
            updated_at: 1,
        }
    }

    #[test]
    fn tunnel_row_converts() {
        let tunnel = Tunnel::try_from(row("connected", r#"{"timeoutMs":2000}"#)).unwrap();
        assert_eq!(tunnel.status, TunnelStatus::Connected);
        assert_eq!(tunnel.config.timeout_ms, 2_000);
    }

    #[test]
    fn corrupt_status_is_reported() {
        let err = Tunnel::try_from(row("sleeping", "{}")).unwrap_err();
        assert!(matches!(err, DatabaseError::Corrupt(_)));
    }

    #[test]
    fn endpoint_spec_defaults() {
        let spec: EndpointSpec = serde_json::from_str(r#"{"url":"http://x"}"#).unwrap();
        assert_eq!(spec.priority, 0);
        assert_eq!(spec.weight, 1);
    }

    #[test]
    fn tunnel_serializes_camel_case() {
        let tunnel = Tunnel::try_from(row("created", "{}")).unwrap();
        let json = serde_json::to_value(&tunnel).unwrap();
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["config"]["maxConnections"], 100);
        assert_eq!(json["metrics"]["requestCount"], 0);
    }
}
