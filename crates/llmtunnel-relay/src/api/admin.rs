//! Admin-only rate-limit reporting and exemption rule management.

use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use tracing::info;

use super::AppState;
use super::error::ApiError;
use super::extract::{AdminUser, ApiJson};
use crate::ratelimit::ExemptionRule;

const DEFAULT_TOP_LIMIT: usize = 10;
const MAX_TOP_LIMIT: usize = 100;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportQuery {
    /// Rolling period in seconds; defaults to the configured report period.
    pub period_secs: Option<u64>,
    pub limit: Option<usize>,
}

impl ReportQuery {
    fn period(&self, state: &AppState) -> Duration {
        self.period_secs.map_or_else(
            || state.limiter.config().report_period(),
            Duration::from_secs,
        )
    }

    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_TOP_LIMIT).clamp(1, MAX_TOP_LIMIT)
    }
}

// =========================================================================
// Reporting
// =========================================================================

pub async fn summary(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    Query(query): Query<ReportQuery>,
) -> impl IntoResponse {
    let now = state.limiter.now_millis();
    Json(state.limiter.reporter().summary(now, query.period(&state)))
}

pub async fn top_violators(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    Query(query): Query<ReportQuery>,
) -> impl IntoResponse {
    let now = state.limiter.now_millis();
    Json(
        state
            .limiter
            .reporter()
            .top_violators(now, query.period(&state), query.limit()),
    )
}

pub async fn top_ips(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    Query(query): Query<ReportQuery>,
) -> impl IntoResponse {
    let now = state.limiter.now_millis();
    Json(
        state
            .limiter
            .reporter()
            .top_ips(now, query.period(&state), query.limit()),
    )
}

pub async fn dashboard(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    Query(query): Query<ReportQuery>,
) -> impl IntoResponse {
    let now = state.limiter.now_millis();
    Json(
        state
            .limiter
            .reporter()
            .dashboard(now, query.period(&state), query.limit()),
    )
}

// =========================================================================
// Exemption rules
// =========================================================================

pub async fn list_exemptions(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
) -> impl IntoResponse {
    Json(state.limiter.exemptions().rules())
}

pub async fn create_exemption(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    ApiJson(mut rule): ApiJson<ExemptionRule>,
) -> Result<impl IntoResponse, ApiError> {
    rule.builtin = false;
    let rule = state.limiter.exemptions().add_rule(rule)?;
    info!(rule_id = %rule.id, admin = %admin.sub, "Exemption rule added");
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn enable_exemption(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let rule = state.limiter.exemptions().set_enabled(&id, true)?;
    info!(rule_id = %id, admin = %admin.sub, "Exemption rule enabled");
    Ok(Json(rule))
}

pub async fn disable_exemption(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let rule = state.limiter.exemptions().set_enabled(&id, false)?;
    info!(rule_id = %id, admin = %admin.sub, "Exemption rule disabled");
    Ok(Json(rule))
}

pub async fn delete_exemption(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.limiter.exemptions().remove_rule(&id)?;
    info!(rule_id = %id, admin = %admin.sub, "Exemption rule deleted");
    Ok(StatusCode::NO_CONTENT)
}
