//! Admission middleware: correlation IDs, optional token decoding and rate
//! limiting, run in front of every route.

use std::net::{IpAddr, SocketAddr};

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use super::AppState;
use super::error::{ApiError, retry_after_secs};
use super::extract::{CorrelationId, bearer_token};
use crate::auth::Tier;
use crate::ratelimit::{Admission, RateLimitDecision, RequestContext};

pub const CORRELATION_ID: HeaderName = HeaderName::from_static("x-correlation-id");
pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const RATE_LIMIT_EXEMPT: HeaderName = HeaderName::from_static("x-ratelimit-exempt");
pub const RATE_LIMIT_EXEMPT_RULE: HeaderName = HeaderName::from_static("x-ratelimit-exempt-rule");

const MAX_CORRELATION_ID_LEN: usize = 128;

/// Decide admission before any handler runs.
///
/// A valid bearer token is decoded here so the limiter sees the caller's
/// identity and tier; its claims are stashed for the auth extractors. An
/// invalid token is not rejected here: the request is limited by IP and
/// the route decides whether it needs authentication.
pub async fn admit(State(state): State<AppState>, mut request: Request<Body>, next: Next) -> Response {
    let correlation_id = incoming_correlation_id(request.headers())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let claims = bearer_token(request.headers()).and_then(|t| state.jwt.validate(t).ok());

    let ctx = RequestContext {
        correlation_id: correlation_id.clone(),
        user_id: claims.as_ref().map(|c| c.sub.clone()),
        tier: claims.as_ref().map_or(Tier::Free, |c| c.tier),
        role: claims.as_ref().map(|c| c.role.clone()),
        ip: client_ip(&request),
        method: request.method().to_string(),
        path: request.uri().path().to_string(),
    };

    if let Some(claims) = claims {
        request.extensions_mut().insert(claims);
    }
    request
        .extensions_mut()
        .insert(CorrelationId(correlation_id.clone()));

    let mut response = match state.limiter.check(&ctx) {
        RateLimitDecision::Exempt(grant) => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert(RATE_LIMIT_EXEMPT, HeaderValue::from_static("true"));
            if let Ok(rule) = HeaderValue::from_str(&grant.rule_id) {
                headers.insert(RATE_LIMIT_EXEMPT_RULE, rule);
            }
            response
        }
        RateLimitDecision::Allowed(Admission {
            limit,
            remaining,
            reset_after,
            permit,
        }) => {
            // The concurrency slot is held until the handler has answered.
            let mut response = next.run(request).await;
            drop(permit);
            let headers = response.headers_mut();
            headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(limit));
            headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(remaining));
            headers.insert(RATE_LIMIT_RESET, HeaderValue::from(reset_after.as_secs()));
            headers.insert(RATE_LIMIT_EXEMPT, HeaderValue::from_static("false"));
            response
        }
        RateLimitDecision::Blocked(block) => {
            debug!(
                correlation_id = %correlation_id,
                path = %ctx.path,
                violation_type = block.violation_type.as_str(),
                "Request rejected by rate limiter"
            );
            let mut response = ApiError::RateLimited {
                violation_type: block.violation_type,
                retry_after: block.retry_after,
            }
            .into_response();
            let headers = response.headers_mut();
            headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(block.limit));
            headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(0u32));
            headers.insert(
                RATE_LIMIT_RESET,
                HeaderValue::from(retry_after_secs(block.retry_after)),
            );
            headers.insert(RATE_LIMIT_EXEMPT, HeaderValue::from_static("false"));
            response
        }
    };

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(CORRELATION_ID, value);
    }
    response
}

fn incoming_correlation_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(&CORRELATION_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= MAX_CORRELATION_ID_LEN)
        .map(str::to_string)
}

/// The caller's address. `X-Forwarded-For` is only honoured when the peer
/// is a local proxy or unknown (in-process requests).
fn client_ip(request: &Request<Body>) -> String {
    let direct = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let trust_forwarded = direct.is_none_or(|ip| ip.is_loopback());
    if trust_forwarded {
        if let Some(forwarded) = forwarded_for(request.headers()) {
            return forwarded.to_string();
        }
    }
    direct.map_or_else(|| "unknown".to_string(), |ip| ip.to_string())
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|ip| ip.trim().parse().ok())
}
