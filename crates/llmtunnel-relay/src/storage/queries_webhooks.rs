//! Webhook registration and delivery queries.

use super::db::{DatabaseError, RelayDatabase};
use super::models::{DeliveryRow, WebhookRow};

/// Fields for creating or replacing a registration.
#[derive(Debug, Clone)]
pub struct WebhookParams<'a> {
    pub url: &'a str,
    pub secret: &'a str,
    /// JSON array of event-type patterns.
    pub event_patterns: &'a str,
    /// JSON array of property filters.
    pub property_filters: &'a str,
    pub is_active: bool,
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryAttemptUpdate<'a> {
    pub status: &'a str,
    pub attempt_count: i64,
    pub next_retry_at: Option<i64>,
    pub last_http_status: Option<i64>,
    pub last_error: Option<&'a str>,
    pub delivered_at: Option<i64>,
}

impl RelayDatabase {
    // =========================================================================
    // Registration queries
    // =========================================================================

    pub async fn create_webhook(
        &self,
        id: &str,
        user_id: &str,
        tunnel_id: &str,
        params: &WebhookParams<'_>,
        now: i64,
    ) -> Result<WebhookRow, DatabaseError> {
        Ok(sqlx::query_as::<_, WebhookRow>(
            "INSERT INTO webhook_registrations
                 (id, user_id, tunnel_id, url, secret, event_patterns, property_filters,
                  is_active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING *",
        )
        .bind(id)
        .bind(user_id)
        .bind(tunnel_id)
        .bind(params.url)
        .bind(params.secret)
        .bind(params.event_patterns)
        .bind(params.property_filters)
        .bind(i64::from(params.is_active))
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await?)
    }

    /// Get a registration by ID (no ownership check).
    pub async fn get_webhook(&self, id: &str) -> Result<WebhookRow, DatabaseError> {
        sqlx::query_as::<_, WebhookRow>("SELECT * FROM webhook_registrations WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Webhook {id}")))
    }

    /// Get a registration scoped to its tunnel and owner.
    pub async fn get_webhook_for_user(
        &self,
        id: &str,
        tunnel_id: &str,
        user_id: &str,
    ) -> Result<WebhookRow, DatabaseError> {
        sqlx::query_as::<_, WebhookRow>(
            "SELECT * FROM webhook_registrations WHERE id = ? AND tunnel_id = ? AND user_id = ?",
        )
        .bind(id)
        .bind(tunnel_id)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Webhook {id}")))
    }

    pub async fn list_webhooks_for_tunnel(
        &self,
        tunnel_id: &str,
        user_id: &str,
    ) -> Result<Vec<WebhookRow>, DatabaseError> {
        Ok(sqlx::query_as::<_, WebhookRow>(
            "SELECT * FROM webhook_registrations WHERE tunnel_id = ? AND user_id = ?
             ORDER BY created_at ASC",
        )
        .bind(tunnel_id)
        .bind(user_id)
        .fetch_all(self.pool())
        .await?)
    }

    /// Active registrations that may receive an event for `user_id`.
    ///
    /// Tunnel-scoped events only go to registrations on that tunnel;
    /// user-scoped events (`tunnel_id == None`) go to all of them.
    pub async fn list_active_webhooks(
        &self,
        user_id: &str,
        tunnel_id: Option<&str>,
    ) -> Result<Vec<WebhookRow>, DatabaseError> {
        Ok(sqlx::query_as::<_, WebhookRow>(
            "SELECT * FROM webhook_registrations
             WHERE user_id = ? AND is_active = 1 AND (? IS NULL OR tunnel_id = ?)
             ORDER BY created_at ASC",
        )
        .bind(user_id)
        .bind(tunnel_id)
        .bind(tunnel_id)
        .fetch_all(self.pool())
        .await?)
    }

    pub async fn update_webhook(
        &self,
        id: &str,
        params: &WebhookParams<'_>,
        now: i64,
    ) -> Result<WebhookRow, DatabaseError> {
        sqlx::query_as::<_, WebhookRow>(
            "UPDATE webhook_registrations SET
                 url = ?, secret = ?, event_patterns = ?, property_filters = ?,
                 is_active = ?, updated_at = ?
             WHERE id = ?
             RETURNING *",
        )
        .bind(params.url)
        .bind(params.secret)
        .bind(params.event_patterns)
        .bind(params.property_filters)
        .bind(i64::from(params.is_active))
        .bind(now)
        .bind(id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Webhook {id}")))
    }

    pub async fn delete_webhook(
        &self,
        id: &str,
        tunnel_id: &str,
        user_id: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "DELETE FROM webhook_registrations WHERE id = ? AND tunnel_id = ? AND user_id = ?",
        )
        .bind(id)
        .bind(tunnel_id)
        .bind(user_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Delivery queries
    // =========================================================================

    /// Create a `pending` delivery. A second call for the same
    /// `(webhook_id, event_id)` is a conflict.
    pub async fn create_delivery(
        &self,
        id: &str,
        webhook_id: &str,
        event_id: &str,
        event_type: &str,
        payload: &str,
        now: i64,
    ) -> Result<DeliveryRow, DatabaseError> {
        Ok(sqlx::query_as::<_, DeliveryRow>(
            "INSERT INTO webhook_deliveries
                 (id, webhook_id, event_id, event_type, payload, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, 'pending', ?, ?)
             RETURNING *",
        )
        .bind(id)
        .bind(webhook_id)
        .bind(event_id)
        .bind(event_type)
        .bind(payload)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await?)
    }

    pub async fn get_delivery(&self, id: &str) -> Result<DeliveryRow, DatabaseError> {
        sqlx::query_as::<_, DeliveryRow>("SELECT * FROM webhook_deliveries WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Delivery {id}")))
    }

    pub async fn record_delivery_attempt(
        &self,
        id: &str,
        update: &DeliveryAttemptUpdate<'_>,
        now: i64,
    ) -> Result<DeliveryRow, DatabaseError> {
        sqlx::query_as::<_, DeliveryRow>(
            "UPDATE webhook_deliveries SET
                 status = ?, attempt_count = ?, next_retry_at = ?, last_http_status = ?,
                 last_error = ?, delivered_at = ?, updated_at = ?
             WHERE id = ?
             RETURNING *",
        )
        .bind(update.status)
        .bind(update.attempt_count)
        .bind(update.next_retry_at)
        .bind(update.last_http_status)
        .bind(update.last_error)
        .bind(update.delivered_at)
        .bind(now)
        .bind(id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Delivery {id}")))
    }

    /// Deliveries owed an attempt, oldest first: `retrying` rows whose next
    /// attempt is due, and `pending` rows created at or before
    /// `stale_pending_before` whose first attempt never completed.
    pub async fn list_due_deliveries(
        &self,
        now: i64,
        stale_pending_before: i64,
        limit: i64,
    ) -> Result<Vec<DeliveryRow>, DatabaseError> {
        Ok(sqlx::query_as::<_, DeliveryRow>(
            "SELECT * FROM webhook_deliveries
             WHERE (status = 'retrying' AND next_retry_at <= ?)
                OR (status = 'pending' AND created_at <= ?)
             ORDER BY COALESCE(next_retry_at, created_at) ASC LIMIT ?",
        )
        .bind(now)
        .bind(stale_pending_before)
        .bind(limit)
        .fetch_all(self.pool())
        .await?)
    }

    /// Delivery history for a registration, newest first.
    pub async fn list_deliveries(
        &self,
        webhook_id: &str,
        limit: i64,
    ) -> Result<Vec<DeliveryRow>, DatabaseError> {
        Ok(sqlx::query_as::<_, DeliveryRow>(
            "SELECT * FROM webhook_deliveries WHERE webhook_id = ?
             ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(webhook_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?)
    }
}
