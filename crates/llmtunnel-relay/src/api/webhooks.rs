//! Webhook registrations of a tunnel and their delivery log.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;

use super::AppState;
use super::error::ApiError;
use super::extract::{ApiJson, AuthUser};
use super::tunnels::LimitQuery;
use crate::webhook::{WebhookDeliveryService, WebhookInput, WebhookUpdate};

const DEFAULT_DELIVERY_LIMIT: i64 = 50;

fn service(state: &AppState) -> Result<&Arc<WebhookDeliveryService>, ApiError> {
    state
        .webhooks
        .as_ref()
        .ok_or_else(|| ApiError::ServiceUnavailable("Webhook delivery is not available".into()))
}

pub async fn list(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(tunnel_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let webhooks = service(&state)?.list(&tunnel_id, claims.user_id()).await?;
    Ok(Json(webhooks))
}

pub async fn register(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(tunnel_id): Path<String>,
    ApiJson(input): ApiJson<WebhookInput>,
) -> Result<impl IntoResponse, ApiError> {
    let webhook = service(&state)?
        .register(claims.user_id(), &tunnel_id, input)
        .await?;
    Ok((StatusCode::CREATED, Json(webhook)))
}

pub async fn get(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path((tunnel_id, webhook_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let webhook = service(&state)?
        .get(&webhook_id, &tunnel_id, claims.user_id())
        .await?;
    Ok(Json(webhook))
}

pub async fn update(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path((tunnel_id, webhook_id)): Path<(String, String)>,
    ApiJson(update): ApiJson<WebhookUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let webhook = service(&state)?
        .update(&webhook_id, &tunnel_id, claims.user_id(), update)
        .await?;
    Ok(Json(webhook))
}

pub async fn delete(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path((tunnel_id, webhook_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    service(&state)?
        .delete(&webhook_id, &tunnel_id, claims.user_id())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn deliveries(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path((tunnel_id, webhook_id)): Path<(String, String)>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let deliveries = service(&state)?
        .list_deliveries(
            &webhook_id,
            &tunnel_id,
            claims.user_id(),
            query.limit.unwrap_or(DEFAULT_DELIVERY_LIMIT),
        )
        .await?;
    Ok(Json(deliveries))
}

pub async fn send_test(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path((tunnel_id, webhook_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let delivery = service(&state)?
        .send_test_event(&webhook_id, &tunnel_id, claims.user_id())
        .await?;
    Ok(Json(delivery))
}
