//! `SQLite` storage for the llmtunnel relay.
//!
//! Provides persistence for tunnels, endpoints, activity, flushed metrics,
//! quotas and webhook deliveries.

mod db;
mod models;
mod queries_metrics;
mod queries_quotas;
mod queries_tunnels;
mod queries_webhooks;


pub use db::{DatabaseError, RelayDatabase};
pub use models::*;
pub use queries_metrics::MetricsFlushParams;
pub use queries_quotas::{QuotaUsageParams, QuotaUsageRecord, percentage_used};
pub use queries_webhooks::{DeliveryAttemptUpdate, WebhookParams};
