//! Lifecycle events and the in-process queue that carries them to the
//! webhook dispatcher.

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const TUNNEL_CREATED: &str = "tunnel.created";
pub const TUNNEL_DELETED: &str = "tunnel.deleted";
pub const TUNNEL_STATUS_CHANGED: &str = "tunnel.status_changed";
pub const TUNNEL_CONFIG_UPDATED: &str = "tunnel.config_updated";
pub const ENDPOINT_HEALTH_CHANGED: &str = "endpoint.health_changed";
pub const QUOTA_EXCEEDED: &str = "quota.exceeded";
pub const WEBHOOK_TEST: &str = "webhook.test";

/// One event occurrence. Its serialized form is the webhook body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
    pub timestamp: i64,
    pub data: Value,
}

impl WebhookEvent {
    pub fn new(
        event_type: &str,
        user_id: &str,
        tunnel_id: Option<&str>,
        timestamp: i64,
        data: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            user_id: user_id.to_string(),
            tunnel_id: tunnel_id.map(str::to_string),
            timestamp,
            data,
        }
    }

    pub fn status_changed(
        user_id: &str,
        tunnel_id: &str,
        previous: &str,
        current: &str,
        reason: Option<&str>,
        timestamp: i64,
    ) -> Self {
        Self::new(
            TUNNEL_STATUS_CHANGED,
            user_id,
            Some(tunnel_id),
            timestamp,
            json!({ "previousStatus": previous, "newStatus": current, "reason": reason }),
        )
    }

    pub fn endpoint_health_changed(
        user_id: &str,
        tunnel_id: &str,
        endpoint_id: &str,
        url: &str,
        previous: &str,
        current: &str,
        timestamp: i64,
    ) -> Self {
        Self::new(
            ENDPOINT_HEALTH_CHANGED,
            user_id,
            Some(tunnel_id),
            timestamp,
            json!({
                "endpointId": endpoint_id,
                "url": url,
                "previousStatus": previous,
                "newStatus": current,
            }),
        )
    }

    /// Payload used for matching and as the HTTP body.
    pub fn payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Cheap, cloneable handle for emitting events without waiting on delivery.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<WebhookEvent>,
}

impl EventPublisher {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<WebhookEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue an event without blocking the caller. When the queue is full
    /// the event is handed to a task that waits for room.
    pub fn publish(&self, event: WebhookEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    warn!(event_type = %event.event_type, event_id = %event.id, "Webhook event queue full outside a runtime, dropping event");
                    return;
                };
                debug!(event_type = %event.event_type, event_id = %event.id, "Webhook event queue full, deferring event");
                let tx = self.tx.clone();
                runtime.spawn(async move {
                    if let Err(mpsc::error::SendError(event)) = tx.send(event).await {
                        debug!(event_type = %event.event_type, "Webhook dispatcher stopped, dropping event");
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!(event_type = %event.event_type, "Webhook dispatcher stopped, dropping event");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn payload_shape() {
        let event = WebhookEvent::status_changed("u1", "t1", "connecting", "connected", None, 42);
        let payload = event.payload();
        assert_eq!(payload["type"], "tunnel.status_changed");
        assert_eq!(payload["userId"], "u1");
        assert_eq!(payload["tunnelId"], "t1");
        assert_eq!(payload["timestamp"], 42);
        assert_eq!(payload["data"]["newStatus"], "connected");
    }

    #[test]
    fn user_scoped_event_omits_tunnel() {
        let event = WebhookEvent::new(QUOTA_EXCEEDED, "u1", None, 1, json!({}));
        assert!(event.payload().get("tunnelId").is_none());
    }

    #[tokio::test]
    async fn full_queue_defers_instead_of_dropping() {
        let (publisher, mut rx) = EventPublisher::channel(1);
        publisher.publish(WebhookEvent::new(WEBHOOK_TEST, "u1", None, 1, json!({})));
        publisher.publish(WebhookEvent::new(WEBHOOK_TEST, "u1", None, 2, json!({})));

        assert_eq!(rx.recv().await.unwrap().timestamp, 1);
        assert_eq!(rx.recv().await.unwrap().timestamp, 2);
    }
}
