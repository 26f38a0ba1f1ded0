//! Quota usage for the caller, plus the admin reset.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;
use tracing::info;

use super::AppState;
use super::error::ApiError;
use super::extract::{AdminUser, AuthUser};
use super::tunnels::LimitQuery;
use crate::auth::Tier;
use crate::quota::ResourceType;

const DEFAULT_HISTORY_LIMIT: i64 = 12;

/// Whose quota to reset. Both fields default to the calling admin.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetQuotaRequest {
    pub user_id: Option<String>,
    pub tier: Option<Tier>,
}

fn parse_resource(raw: &str) -> Result<ResourceType, ApiError> {
    raw.parse().map_err(ApiError::validation)
}

pub async fn list(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let quotas = state
        .quotas
        .list_quotas(claims.user_id(), claims.tier)
        .await?;
    Ok(Json(quotas))
}

pub async fn summary(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.quotas.summary(claims.user_id(), claims.tier).await?))
}

pub async fn get(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(resource): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let resource = parse_resource(&resource)?;
    let quota = state
        .quotas
        .get_quota(claims.user_id(), claims.tier, resource)
        .await?;
    Ok(Json(quota))
}

pub async fn history(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(resource): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let resource = parse_resource(&resource)?;
    let rows = state
        .quotas
        .history(
            claims.user_id(),
            resource,
            query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
        )
        .await?;
    Ok(Json(rows))
}

pub async fn reset(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(resource): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let resource = parse_resource(&resource)?;
    let request: ResetQuotaRequest = if body.is_empty() {
        ResetQuotaRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::validation(e.to_string()))?
    };
    let user_id = request.user_id.unwrap_or_else(|| admin.sub.clone());
    let tier = request.tier.unwrap_or(admin.tier);

    let quota = state.quotas.reset(&user_id, tier, resource).await?;
    info!(
        user_id = %user_id,
        resource_type = resource.as_str(),
        admin = %admin.sub,
        "Quota reset"
    );
    Ok(Json(quota))
}
