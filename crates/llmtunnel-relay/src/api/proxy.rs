//! `ANY /proxy/{*path}`: forward an application request through the
//! caller's tunnel and relay the local endpoint's answer.

use axum::body::{Body, Bytes};
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::Response;
use tracing::warn;

use super::AppState;
use super::error::ApiError;
use super::extract::AuthUser;
use crate::registry::{ProxyRequest, ProxyResponse};

const PROXY_PREFIX: &str = "/proxy";

/// Headers that describe one hop, or that only the relay may see.
const SKIPPED_HEADERS: &[&str] = &[
    "authorization",
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "x-correlation-id",
];

pub async fn forward(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let path = uri.path().strip_prefix(PROXY_PREFIX).unwrap_or("/");
    let path = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };

    let request = ProxyRequest {
        method: method.to_string(),
        path,
        headers: forwarded_headers(&headers),
        body: body.to_vec(),
    };
    let response = state
        .tunnels
        .proxy_request(claims.user_id(), claims.tier, request)
        .await?;
    into_http_response(response)
}

fn forwarded_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !is_skipped(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn is_skipped(name: &str) -> bool {
    SKIPPED_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

fn into_http_response(response: ProxyResponse) -> Result<Response, ApiError> {
    let status = StatusCode::from_u16(response.status).map_err(|_| {
        ApiError::Upstream(format!("Endpoint answered with invalid status {}", response.status))
    })?;

    let mut builder = Response::builder().status(status);
    for (name, value) in &response.headers {
        if is_skipped(name) {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => builder = builder.header(name, value),
            _ => warn!(header = %name, "Dropping malformed response header from agent"),
        }
    }
    builder
        .body(Body::from(response.body))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn hop_and_auth_headers_are_not_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer t"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));

        let forwarded = forwarded_headers(&headers);
        assert_eq!(
            forwarded,
            vec![("content-type".to_string(), "application/json".to_string())]
        );
    }

    #[tokio::test]
    async fn agent_response_becomes_http_response() {
        let response = into_http_response(ProxyResponse {
            status: 201,
            headers: vec![
                ("content-type".into(), "text/plain".into()),
                ("transfer-encoding".into(), "chunked".into()),
                ("bad header".into(), "x".into()),
            ],
            body: b"made".to_vec(),
        })
        .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["content-type"], "text/plain");
        assert!(response.headers().get("transfer-encoding").is_none());
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"made");
    }

    #[test]
    fn invalid_status_is_an_upstream_error() {
        let err = into_http_response(ProxyResponse {
            status: 1000,
            headers: vec![],
            body: vec![],
        })
        .unwrap_err();
        assert_eq!(err.code(), "UPSTREAM_ERROR");
    }
}
