//! Webhook registrations and the delivery pipeline.
//!
//! An event matching a registration creates a `pending` delivery row that
//! is attempted immediately. Failures move it to `retrying` with
//! `next_retry_at` taken from the retry schedule; a periodic sweep
//! re-attempts due rows. Once the schedule is exhausted the row becomes
//! `failed`. Delivery failures never propagate to whoever emitted the
//! event.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use llmtunnel_core::Clock;

use super::event::{WEBHOOK_TEST, WebhookEvent};
use super::matcher::{EventMatcher, MatcherCache, MatcherError, PropertyFilter};
use super::signature::{
    DELIVERY_ID_HEADER, SIGNATURE_HEADER, WEBHOOK_ID_HEADER, generate_secret, sign,
};
use crate::config::WebhookConfig;
use crate::storage::{
    DatabaseError, DeliveryAttemptUpdate, DeliveryRow, RelayDatabase, WebhookParams, WebhookRow,
};
use crate::telemetry;

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Invalid webhook: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Database(DatabaseError),
}

impl From<DatabaseError> for WebhookError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => Self::NotFound(what),
            other => Self::Database(other),
        }
    }
}

impl From<MatcherError> for WebhookError {
    fn from(e: MatcherError) -> Self {
        Self::Validation(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Retrying,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self, DatabaseError> {
        match s {
            "pending" => Ok(Self::Pending),
            "retrying" => Ok(Self::Retrying),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            other => Err(DatabaseError::Corrupt(format!(
                "unknown delivery status: {other}"
            ))),
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registration as exposed over the API. The secret is only shown in
/// the response to the create call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRegistration {
    pub id: String,
    pub tunnel_id: String,
    pub url: String,
    pub event_patterns: Vec<String>,
    pub property_filters: Vec<PropertyFilter>,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<&WebhookRow> for WebhookRegistration {
    type Error = DatabaseError;

    fn try_from(row: &WebhookRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id.clone(),
            tunnel_id: row.tunnel_id.clone(),
            url: row.url.clone(),
            event_patterns: serde_json::from_str(&row.event_patterns)?,
            property_filters: serde_json::from_str(&row.property_filters)?,
            is_active: row.is_active != 0,
            secret: None,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookInput {
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub event_patterns: Option<Vec<String>>,
    #[serde(default)]
    pub property_filters: Option<Vec<PropertyFilter>>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookUpdate {
    pub url: Option<String>,
    pub secret: Option<String>,
    pub event_patterns: Option<Vec<String>>,
    pub property_filters: Option<Vec<PropertyFilter>>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDelivery {
    pub id: String,
    pub webhook_id: String,
    pub event_id: String,
    pub event_type: String,
    pub status: DeliveryStatus,
    pub attempt_count: i64,
    pub next_retry_at: Option<i64>,
    pub last_http_status: Option<i64>,
    pub last_error: Option<String>,
    pub payload: Value,
    pub created_at: i64,
    pub updated_at: i64,
    pub delivered_at: Option<i64>,
}

impl TryFrom<DeliveryRow> for WebhookDelivery {
    type Error = DatabaseError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            status: DeliveryStatus::parse(&row.status)?,
            payload: serde_json::from_str(&row.payload)?,
            id: row.id,
            webhook_id: row.webhook_id,
            event_id: row.event_id,
            event_type: row.event_type,
            attempt_count: row.attempt_count,
            next_retry_at: row.next_retry_at,
            last_http_status: row.last_http_status,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            delivered_at: row.delivered_at,
        })
    }
}

/// Validated, serialized form of a registration ready for storage.
struct PreparedWebhook {
    url: String,
    secret: String,
    event_patterns: String,
    property_filters: String,
    is_active: bool,
}

impl PreparedWebhook {
    fn new(
        url: String,
        secret: String,
        patterns: &[String],
        filters: &[PropertyFilter],
        is_active: bool,
    ) -> Result<Self, WebhookError> {
        validate_url(&url)?;
        if patterns.is_empty() {
            return Err(WebhookError::Validation(
                "at least one event pattern is required".into(),
            ));
        }
        if secret.is_empty() {
            return Err(WebhookError::Validation("secret must not be empty".into()));
        }
        EventMatcher::compile(patterns, filters)?;
        Ok(Self {
            url,
            secret,
            event_patterns: serde_json::to_string(patterns).map_err(DatabaseError::from)?,
            property_filters: serde_json::to_string(filters).map_err(DatabaseError::from)?,
            is_active,
        })
    }

    fn params(&self) -> WebhookParams<'_> {
        WebhookParams {
            url: &self.url,
            secret: &self.secret,
            event_patterns: &self.event_patterns,
            property_filters: &self.property_filters,
            is_active: self.is_active,
        }
    }
}

fn validate_url(url: &str) -> Result<(), WebhookError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| WebhookError::Validation(format!("invalid url: {e}")))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(()),
        "http" | "https" => Err(WebhookError::Validation("url must have a host".into())),
        other => Err(WebhookError::Validation(format!(
            "url scheme must be http or https, got {other}"
        ))),
    }
}

/// What one HTTP attempt produced.
enum AttemptOutcome {
    Delivered(u16),
    Rejected(u16),
    Transport(String),
}

pub struct WebhookDeliveryService {
    db: RelayDatabase,
    http: reqwest::Client,
    config: WebhookConfig,
    clock: Arc<dyn Clock>,
    matchers: MatcherCache,
}

impl WebhookDeliveryService {
    pub fn new(
        db: RelayDatabase,
        config: WebhookConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, WebhookError> {
        // reqwest is built without a bundled crypto provider. An `Err` here
        // only means one is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(concat!("llmtunnel-relay/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            db,
            http,
            config,
            clock,
            matchers: MatcherCache::new(),
        })
    }

    // =========================================================================
    // Registrations
    // =========================================================================

    #[instrument(skip(self, input), fields(url = %input.url))]
    pub async fn register(
        &self,
        user_id: &str,
        tunnel_id: &str,
        input: WebhookInput,
    ) -> Result<WebhookRegistration, WebhookError> {
        self.db.get_tunnel_for_user(tunnel_id, user_id).await?;

        let secret = input
            .secret
            .filter(|s| !s.is_empty())
            .unwrap_or_else(generate_secret);
        let patterns = input.event_patterns.unwrap_or_else(|| vec!["*".into()]);
        let filters = input.property_filters.unwrap_or_default();
        let prepared = PreparedWebhook::new(
            input.url,
            secret,
            &patterns,
            &filters,
            input.is_active.unwrap_or(true),
        )?;

        let id = uuid::Uuid::new_v4().to_string();
        let now = self.clock.now_millis();
        let row = self
            .db
            .create_webhook(&id, user_id, tunnel_id, &prepared.params(), now)
            .await?;
        info!(webhook_id = %id, tunnel_id, "Webhook registered");

        let mut registration = WebhookRegistration::try_from(&row)?;
        registration.secret = Some(row.secret);
        Ok(registration)
    }

    pub async fn update(
        &self,
        id: &str,
        tunnel_id: &str,
        user_id: &str,
        update: WebhookUpdate,
    ) -> Result<WebhookRegistration, WebhookError> {
        let current = self.db.get_webhook_for_user(id, tunnel_id, user_id).await?;
        let existing = WebhookRegistration::try_from(&current)?;

        let patterns = update.event_patterns.unwrap_or(existing.event_patterns);
        let filters = update.property_filters.unwrap_or(existing.property_filters);
        let prepared = PreparedWebhook::new(
            update.url.unwrap_or(current.url),
            update.secret.unwrap_or(current.secret),
            &patterns,
            &filters,
            update.is_active.unwrap_or(existing.is_active),
        )?;

        let now = self.clock.now_millis();
        let row = self.db.update_webhook(id, &prepared.params(), now).await?;
        self.matchers.invalidate(id);
        info!(webhook_id = %id, "Webhook updated");
        Ok(WebhookRegistration::try_from(&row)?)
    }

    pub async fn delete(&self, id: &str, tunnel_id: &str, user_id: &str) -> Result<(), WebhookError> {
        if !self.db.delete_webhook(id, tunnel_id, user_id).await? {
            return Err(WebhookError::NotFound(format!("Webhook {id}")));
        }
        self.matchers.invalidate(id);
        info!(webhook_id = %id, "Webhook deleted");
        Ok(())
    }

    pub async fn get(
        &self,
        id: &str,
        tunnel_id: &str,
        user_id: &str,
    ) -> Result<WebhookRegistration, WebhookError> {
        let row = self.db.get_webhook_for_user(id, tunnel_id, user_id).await?;
        Ok(WebhookRegistration::try_from(&row)?)
    }

    pub async fn list(
        &self,
        tunnel_id: &str,
        user_id: &str,
    ) -> Result<Vec<WebhookRegistration>, WebhookError> {
        self.db.get_tunnel_for_user(tunnel_id, user_id).await?;
        let rows = self.db.list_webhooks_for_tunnel(tunnel_id, user_id).await?;
        Ok(rows
            .iter()
            .map(WebhookRegistration::try_from)
            .collect::<Result<_, _>>()?)
    }

    pub async fn list_deliveries(
        &self,
        id: &str,
        tunnel_id: &str,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<WebhookDelivery>, WebhookError> {
        self.db.get_webhook_for_user(id, tunnel_id, user_id).await?;
        let rows = self.db.list_deliveries(id, limit.clamp(1, 500)).await?;
        Ok(rows
            .into_iter()
            .map(WebhookDelivery::try_from)
            .collect::<Result<_, _>>()?)
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Deliver `event` to every active matching registration of its user.
    /// Returns the created deliveries after their first attempt.
    #[instrument(skip(self, event), fields(event_type = %event.event_type, event_id = %event.id))]
    pub async fn dispatch(&self, event: &WebhookEvent) -> Result<Vec<WebhookDelivery>, WebhookError> {
        let candidates = self
            .db
            .list_active_webhooks(&event.user_id, event.tunnel_id.as_deref())
            .await?;
        let payload = event.payload();

        let mut targets = Vec::new();
        for webhook in candidates {
            match self.matcher_for(&webhook) {
                Ok(matcher) if matcher.matches(&event.event_type, &payload) => targets.push(webhook),
                Ok(_) => {}
                Err(e) => {
                    warn!(webhook_id = %webhook.id, error = %e, "Skipping webhook with invalid matcher");
                }
            }
        }
        if targets.is_empty() {
            debug!("No webhook matched event");
            return Ok(Vec::new());
        }

        let results = join_all(targets.iter().map(|w| self.deliver_new(w, event))).await;
        let mut deliveries = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(delivery) => deliveries.push(delivery),
                Err(e) => error!(error = %e, "Failed to create webhook delivery"),
            }
        }
        Ok(deliveries)
    }

    /// Send a `webhook.test` event to one registration, bypassing its
    /// patterns and filters.
    pub async fn send_test_event(
        &self,
        id: &str,
        tunnel_id: &str,
        user_id: &str,
    ) -> Result<WebhookDelivery, WebhookError> {
        let webhook = self.db.get_webhook_for_user(id, tunnel_id, user_id).await?;
        let event = WebhookEvent::new(
            WEBHOOK_TEST,
            user_id,
            Some(tunnel_id),
            self.clock.now_millis(),
            serde_json::json!({ "webhookId": id, "message": "Test event" }),
        );
        self.deliver_new(&webhook, &event).await
    }

    /// Re-attempt deliveries whose retry time has come, and pending ones
    /// whose first attempt never finished. Returns how many were attempted.
    pub async fn retry_failed_deliveries(&self) -> Result<usize, WebhookError> {
        let now = self.clock.now_millis();
        // A pending row older than one attempt timeout lost its first
        // attempt to a crash or shutdown.
        let timeout_ms = i64::try_from(self.config.timeout().as_millis()).unwrap_or(i64::MAX);
        let due = self
            .db
            .list_due_deliveries(now, now.saturating_sub(timeout_ms), self.config.sweep_batch)
            .await?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!(count = due.len(), "Retrying due webhook deliveries");

        let attempts = due.into_iter().map(|delivery| async move {
            let webhook = match self.db.get_webhook(&delivery.webhook_id).await {
                Ok(webhook) if webhook.is_active != 0 => webhook,
                Ok(_) => {
                    return self.give_up(&delivery, "webhook is inactive").await;
                }
                Err(e) => return Err(WebhookError::from(e)),
            };
            self.attempt_delivery(&webhook, &delivery).await.map(|_| ())
        });
        let results = join_all(attempts).await;
        let attempted = results.len();
        for result in results {
            if let Err(e) = result {
                warn!(error = %e, "Webhook retry failed to run");
            }
        }
        Ok(attempted)
    }

    /// Make one HTTP attempt for `delivery` and persist the outcome.
    pub async fn attempt_delivery(
        &self,
        webhook: &WebhookRow,
        delivery: &DeliveryRow,
    ) -> Result<WebhookDelivery, WebhookError> {
        let outcome = self.post(webhook, delivery).await;
        let now = self.clock.now_millis();
        let attempt_count = delivery.attempt_count + 1;

        let (status, http_status, last_error) = match &outcome {
            AttemptOutcome::Delivered(code) => (DeliveryStatus::Delivered, Some(*code), None),
            AttemptOutcome::Rejected(code) => (
                DeliveryStatus::Failed,
                Some(*code),
                Some(format!("endpoint returned HTTP {code}")),
            ),
            AttemptOutcome::Transport(e) => (DeliveryStatus::Failed, None, Some(e.clone())),
        };

        let (status, next_retry_at) = if status == DeliveryStatus::Delivered {
            (status, None)
        } else {
            let failed_attempts = usize::try_from(attempt_count).unwrap_or(usize::MAX);
            match self.config.retry_delay(failed_attempts) {
                Some(delay) => (
                    DeliveryStatus::Retrying,
                    Some(now + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX)),
                ),
                None => (DeliveryStatus::Failed, None),
            }
        };

        let row = self
            .db
            .record_delivery_attempt(
                &delivery.id,
                &DeliveryAttemptUpdate {
                    status: status.as_str(),
                    attempt_count,
                    next_retry_at,
                    last_http_status: http_status.map(i64::from),
                    last_error: last_error.as_deref(),
                    delivered_at: (status == DeliveryStatus::Delivered).then_some(now),
                },
                now,
            )
            .await?;

        telemetry::record_webhook_delivery(status.as_str());
        match status {
            DeliveryStatus::Delivered => {
                debug!(delivery_id = %delivery.id, attempt_count, "Webhook delivered");
            }
            DeliveryStatus::Failed => warn!(
                delivery_id = %delivery.id,
                webhook_id = %webhook.id,
                attempt_count,
                error = last_error.as_deref().unwrap_or_default(),
                "Webhook delivery failed permanently"
            ),
            _ => debug!(
                delivery_id = %delivery.id,
                attempt_count,
                error = last_error.as_deref().unwrap_or_default(),
                "Webhook delivery will be retried"
            ),
        }
        Ok(WebhookDelivery::try_from(row)?)
    }

    async fn deliver_new(
        &self,
        webhook: &WebhookRow,
        event: &WebhookEvent,
    ) -> Result<WebhookDelivery, WebhookError> {
        let body = serde_json::to_string(event).map_err(DatabaseError::from)?;
        let id = uuid::Uuid::new_v4().to_string();
        let delivery = self
            .db
            .create_delivery(
                &id,
                &webhook.id,
                &event.id,
                &event.event_type,
                &body,
                self.clock.now_millis(),
            )
            .await?;
        self.attempt_delivery(webhook, &delivery).await
    }

    async fn give_up(&self, delivery: &DeliveryRow, reason: &str) -> Result<(), WebhookError> {
        let now = self.clock.now_millis();
        self.db
            .record_delivery_attempt(
                &delivery.id,
                &DeliveryAttemptUpdate {
                    status: DeliveryStatus::Failed.as_str(),
                    attempt_count: delivery.attempt_count,
                    next_retry_at: None,
                    last_http_status: delivery.last_http_status,
                    last_error: Some(reason),
                    delivered_at: None,
                },
                now,
            )
            .await?;
        telemetry::record_webhook_delivery(DeliveryStatus::Failed.as_str());
        Ok(())
    }

    async fn post(&self, webhook: &WebhookRow, delivery: &DeliveryRow) -> AttemptOutcome {
        let signature = sign(&webhook.secret, delivery.payload.as_bytes());
        let result = self
            .http
            .post(&webhook.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(WEBHOOK_ID_HEADER, &webhook.id)
            .header(DELIVERY_ID_HEADER, &delivery.id)
            .header("X-Webhook-Event", &delivery.event_type)
            .body(delivery.payload.clone())
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                AttemptOutcome::Delivered(response.status().as_u16())
            }
            Ok(response) => AttemptOutcome::Rejected(response.status().as_u16()),
            Err(e) if e.is_timeout() => AttemptOutcome::Transport("request timed out".into()),
            Err(e) => AttemptOutcome::Transport(e.to_string()),
        }
    }

    fn matcher_for(&self, webhook: &WebhookRow) -> Result<Arc<EventMatcher>, WebhookError> {
        let registration = WebhookRegistration::try_from(webhook)?;
        Ok(self.matchers.get_or_compile(
            &webhook.id,
            webhook.updated_at,
            &registration.event_patterns,
            &registration.property_filters,
        )?)
    }

    // =========================================================================
    // Background tasks
    // =========================================================================

    /// Consume published events until shutdown. Each event is dispatched on
    /// its own task so a slow endpoint never holds up later events.
    pub fn spawn_dispatcher(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<WebhookEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let service = Arc::clone(&service);
                        tokio::spawn(async move {
                            if let Err(e) = service.dispatch(&event).await {
                                warn!(event_id = %event.id, error = %e, "Webhook dispatch failed");
                            }
                        });
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Webhook dispatcher stopped");
        })
    }

    /// Periodically run [`Self::retry_failed_deliveries`] until shutdown.
    pub fn spawn_retry_sweeper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let period = service.config.sweep_interval().max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = service.retry_failed_deliveries().await {
                            warn!(error = %e, "Webhook retry sweep failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Webhook retry sweeper stopped");
        })
    }
}
