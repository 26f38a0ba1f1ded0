//! Error envelope returned by every REST endpoint.
//!
//! Service errors are mapped onto a small set of stable codes. The body is
//! always `{"error": {"code": ..., "message": ...}}` plus code-specific
//! extras, and every 429 carries a `Retry-After` header.

use std::time::Duration;

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Map, Value, json};
use tracing::error;

use crate::health::HealthError;
use crate::quota::{QuotaError, ResourceType};
use crate::ratelimit::{ExemptionError, ViolationType};
use crate::storage::DatabaseError;
use crate::tunnel::TunnelError;
use crate::webhook::WebhookError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("{0}")]
    AuthRequired(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Rate limit exceeded")]
    RateLimited {
        violation_type: ViolationType,
        retry_after: Duration,
    },

    #[error("Quota exceeded for {resource}")]
    QuotaExceeded {
        resource: ResourceType,
        retry_after: Duration,
    },

    #[error("{0}")]
    TunnelUnavailable(String),

    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(vec![message.into()])
    }

    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::AuthRequired(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RateLimited { .. } | Self::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::TunnelUnavailable(_) | Self::ServiceUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::AuthRequired(_) => "AUTH_REQUIRED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::TunnelUnavailable(_) => "TUNNEL_UNAVAILABLE",
            Self::Upstream(_) => "UPSTREAM_ERROR",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } | Self::QuotaExceeded { retry_after, .. } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    fn body(&self) -> Value {
        let mut error = Map::new();
        error.insert("code".into(), json!(self.code()));
        let message = match self {
            Self::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };
        error.insert("message".into(), json!(message));

        match self {
            Self::Validation(details) => {
                error.insert("details".into(), json!(details));
            }
            Self::RateLimited { violation_type, .. } => {
                error.insert("violationType".into(), json!(violation_type.as_str()));
            }
            Self::QuotaExceeded { resource, .. } => {
                error.insert("resourceType".into(), json!(resource.as_str()));
            }
            _ => {}
        }
        if let Some(retry_after) = self.retry_after() {
            error.insert("retryAfter".into(), json!(retry_after_secs(retry_after)));
        }
        json!({ "error": error })
    }
}

/// Whole seconds for a `Retry-After` hint, never zero.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(detail) = &self {
            error!(error = %detail, "Request failed");
        }
        let mut response = (self.status(), Json(self.body())).into_response();
        if let Some(retry_after) = self.retry_after() {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(retry_after_secs(retry_after)),
            );
        }
        response
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => Self::NotFound(format!("{what} not found")),
            DatabaseError::Conflict(what) => Self::Conflict(what),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<TunnelError> for ApiError {
    fn from(e: TunnelError) -> Self {
        match e {
            TunnelError::Validation(details) => Self::Validation(details),
            TunnelError::NotFound(_) => Self::NotFound("Tunnel not found".into()),
            TunnelError::Conflict(what) => Self::Conflict(what),
            TunnelError::InvalidTransition(e) => Self::Conflict(e.to_string()),
            TunnelError::TunnelUnavailable(_) => {
                Self::TunnelUnavailable("No connected tunnel; reconnect the desktop agent".into())
            }
            TunnelError::Upstream(detail) => Self::Upstream(detail),
            e @ TunnelError::Saturated { .. } => Self::ServiceUnavailable(e.to_string()),
            TunnelError::QuotaExceeded {
                resource,
                retry_after,
            } => Self::QuotaExceeded {
                resource,
                retry_after,
            },
            TunnelError::Database(e) => e.into(),
        }
    }
}

impl From<HealthError> for ApiError {
    fn from(e: HealthError) -> Self {
        match e {
            HealthError::NotFound(_) => Self::NotFound("Tunnel not found".into()),
            HealthError::Database(e) => e.into(),
        }
    }
}

impl From<QuotaError> for ApiError {
    fn from(e: QuotaError) -> Self {
        match e {
            QuotaError::Validation(msg) => Self::validation(msg),
            QuotaError::Exceeded {
                resource,
                retry_after,
            } => Self::QuotaExceeded {
                resource,
                retry_after,
            },
            QuotaError::Database(e) => e.into(),
        }
    }
}

impl From<WebhookError> for ApiError {
    fn from(e: WebhookError) -> Self {
        match e {
            WebhookError::Validation(msg) => Self::validation(msg),
            WebhookError::NotFound(_) => Self::NotFound("Webhook not found".into()),
            WebhookError::Http(e) => Self::Internal(e.to_string()),
            WebhookError::Database(e) => e.into(),
        }
    }
}

impl From<ExemptionError> for ApiError {
    fn from(e: ExemptionError) -> Self {
        match e {
            ExemptionError::NotFound(_) => Self::NotFound(e.to_string()),
            ExemptionError::Duplicate(_) => Self::Conflict(e.to_string()),
            ExemptionError::BuiltIn(_) => Self::Forbidden(e.to_string()),
            ExemptionError::Invalid(_) => Self::validation(e.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn body_json(error: ApiError) -> (StatusCode, Option<String>, Value) {
        let response = error.into_response();
        let status = response.status();
        let retry = response
            .headers()
            .get(header::RETRY_AFTER)
            .map(|v| v.to_str().unwrap().to_string());
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, retry, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn validation_lists_every_detail() {
        let (status, _, body) = body_json(ApiError::Validation(vec![
            "maxConnections must be between 1 and 10000".into(),
            "timeoutMs must be between 1000 and 300000".into(),
        ]))
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(body["error"]["details"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rate_limited_carries_retry_hint() {
        let (status, retry, body) = body_json(ApiError::RateLimited {
            violation_type: ViolationType::BurstLimitExceeded,
            retry_after: Duration::from_millis(2_300),
        })
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(retry.as_deref(), Some("3"));
        assert_eq!(body["error"]["retryAfter"], 3);
        assert_eq!(body["error"]["violationType"], "burst_limit_exceeded");
    }

    #[tokio::test]
    async fn quota_exceeded_is_distinct_from_rate_limit() {
        let (status, retry, body) = body_json(ApiError::QuotaExceeded {
            resource: ResourceType::ApiRequests,
            retry_after: Duration::from_secs(86_400),
        })
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(retry.as_deref(), Some("86400"));
        assert_eq!(body["error"]["code"], "QUOTA_EXCEEDED");
        assert_eq!(body["error"]["resourceType"], "api_requests");
    }

    #[tokio::test]
    async fn internal_errors_hide_details() {
        let (status, _, body) =
            body_json(DatabaseError::Query("no such table: tunnels".into()).into()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["message"], "Internal server error");
    }

    #[test]
    fn unavailable_tunnel_and_dependency_differ() {
        let tunnel = ApiError::from(TunnelError::TunnelUnavailable("u1".into()));
        let dependency = ApiError::ServiceUnavailable("Metrics recorder not installed".into());
        assert_eq!(tunnel.status(), dependency.status());
        assert_ne!(tunnel.code(), dependency.code());
    }

    #[tokio::test]
    async fn saturated_tunnel_is_service_unavailable() {
        let (status, retry, body) = body_json(
            TunnelError::Saturated {
                tunnel_id: "t1".into(),
                limit: 4,
            }
            .into(),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(retry, None);
        assert_eq!(body["error"]["code"], "SERVICE_UNAVAILABLE");
        assert_eq!(
            body["error"]["message"],
            "Tunnel t1 is at its limit of 4 concurrent requests"
        );
    }

    #[test]
    fn retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(1_001)), 2);
        assert_eq!(retry_after_secs(Duration::from_secs(60)), 60);
    }
}
