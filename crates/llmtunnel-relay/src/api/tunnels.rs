//! Tunnel records, status, health, metrics, configuration, activity and
//! endpoints. Every route is owner-scoped: a tunnel that belongs to
//! someone else is reported as not found.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;

use super::AppState;
use super::error::ApiError;
use super::extract::{ApiJson, AuthUser};
use crate::health::RequestSample;
use crate::tunnel::{EndpointSpec, TunnelConfigPatch};

const DEFAULT_ACTIVITY_LIMIT: i64 = 50;
const DEFAULT_HISTORY_LIMIT: i64 = 24;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsQuery {
    #[serde(default)]
    pub history: bool,
    pub limit: Option<i64>,
}

// =========================================================================
// Records
// =========================================================================

pub async fn list_tunnels(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let tunnels = state.tunnels.list_tunnels(claims.user_id()).await?;
    Ok(Json(json!({ "total": tunnels.len(), "tunnels": tunnels })))
}

pub async fn create_tunnel(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ApiJson(patch): ApiJson<TunnelConfigPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let tunnel = state
        .tunnels
        .create_tunnel(claims.user_id(), claims.tier, &patch)
        .await?;
    Ok((StatusCode::CREATED, Json(tunnel)))
}

pub async fn get_tunnel(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.tunnels.get_tunnel(&id, claims.user_id()).await?))
}

pub async fn delete_tunnel(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.tunnels.delete_tunnel(&id, claims.user_id()).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =========================================================================
// Status and health
// =========================================================================

pub async fn status(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let summary = state
        .tunnels
        .health()
        .get_tunnel_status_summary(&id, claims.user_id())
        .await?;
    Ok(Json(summary))
}

pub async fn endpoint_health(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let endpoints = state.tunnels.list_endpoints(&id, claims.user_id()).await?;
    Ok(Json(json!({ "tunnelId": id, "endpoints": endpoints })))
}

pub async fn force_health_check(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.tunnels.get_tunnel(&id, claims.user_id()).await?;
    let endpoints = state.tunnels.health().check_tunnel(&id).await?;
    Ok(Json(json!({ "tunnelId": id, "endpoints": endpoints })))
}

// =========================================================================
// Metrics
// =========================================================================

pub async fn metrics(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
    Query(query): Query<MetricsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let tunnel = state.tunnels.get_tunnel(&id, claims.user_id()).await?;
    let health = state.tunnels.health();
    let mut body = json!({
        "tunnelId": tunnel.id,
        "current": health.get_aggregated_metrics(&id),
        "cumulative": tunnel.metrics,
    });
    if query.history {
        let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, 1_000);
        body["history"] = json!(health.metrics_history(&id, limit).await?);
    }
    Ok(Json(body))
}

pub async fn record_metrics(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
    ApiJson(sample): ApiJson<RequestSample>,
) -> Result<impl IntoResponse, ApiError> {
    state.tunnels.get_tunnel(&id, claims.user_id()).await?;
    let health = state.tunnels.health();
    health.record_request_metrics(&id, &sample);
    Ok((StatusCode::ACCEPTED, Json(health.get_aggregated_metrics(&id))))
}

pub async fn flush_metrics(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.tunnels.get_tunnel(&id, claims.user_id()).await?;
    let window = state.tunnels.health().flush_metrics_to_database(&id).await?;
    Ok(Json(json!({ "flushed": window.is_some(), "window": window })))
}

// =========================================================================
// Configuration
// =========================================================================

pub async fn get_config(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.tunnels.get_config(&id, claims.user_id()).await?))
}

pub async fn update_config(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
    ApiJson(patch): ApiJson<TunnelConfigPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let tunnel = state
        .tunnels
        .update_config(&id, claims.user_id(), &patch)
        .await?;
    Ok(Json(tunnel))
}

pub async fn reset_config(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.tunnels.reset_config(&id, claims.user_id()).await?))
}

pub async fn activity(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT);
    let entries = state
        .tunnels
        .list_activity(&id, claims.user_id(), limit)
        .await?;
    Ok(Json(json!({ "tunnelId": id, "activity": entries })))
}

// =========================================================================
// Endpoints
// =========================================================================

pub async fn list_endpoints(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.tunnels.list_endpoints(&id, claims.user_id()).await?))
}

pub async fn add_endpoint(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
    ApiJson(spec): ApiJson<EndpointSpec>,
) -> Result<impl IntoResponse, ApiError> {
    let endpoint = state
        .tunnels
        .add_endpoint(&id, claims.user_id(), &spec)
        .await?;
    Ok((StatusCode::CREATED, Json(endpoint)))
}

pub async fn remove_endpoint(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path((id, endpoint_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .tunnels
        .remove_endpoint(&id, claims.user_id(), &endpoint_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
