//! llmtunnel Relay Library
//!
//! Tunnel control plane for local LLM endpoints reached through desktop
//! agents:
//! - `SQLite` storage for tunnels, endpoints, quotas and webhooks
//! - JWT authentication
//! - Agent session registry and WebSocket wire protocol
//! - Tunnel lifecycle, endpoint selection and request proxying
//! - Endpoint health monitoring and request metrics aggregation
//! - Rate limiting with exemptions, and monthly usage quotas
//! - Signed, retried webhook delivery of lifecycle events
//! - REST surface and Prometheus metrics

pub mod api;
pub mod auth;
pub mod config;
pub mod glob;
pub mod health;
pub mod quota;
pub mod ratelimit;
pub mod registry;
pub mod router;
pub mod storage;
pub mod telemetry;
pub mod tunnel;
pub mod webhook;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test_helpers;
