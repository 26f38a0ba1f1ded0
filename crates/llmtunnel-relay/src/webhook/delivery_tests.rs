use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use serde_json::json;
use tokio::sync::watch;

use llmtunnel_core::ManualClock;

use super::delivery::{
    DeliveryStatus, WebhookDeliveryService, WebhookError, WebhookInput, WebhookUpdate,
};
use super::event::{EventPublisher, WebhookEvent};
use super::matcher::{FilterOperator, PropertyFilter};
use super::signature;
use crate::config::WebhookConfig;
use crate::storage::RelayDatabase;

const NOW: i64 = 1_700_000_000_000;

#[derive(Debug, Clone)]
struct Received {
    headers: HeaderMap,
    body: String,
}

#[derive(Clone, Default)]
struct Receiver {
    received: Arc<Mutex<Vec<Received>>>,
    /// Status codes to answer with, in order; 200 once exhausted.
    script: Arc<Mutex<VecDeque<u16>>>,
}

impl Receiver {
    fn count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    fn last(&self) -> Received {
        self.received.lock().unwrap().last().cloned().unwrap()
    }

    fn script(&self, codes: &[u16]) {
        self.script.lock().unwrap().extend(codes.iter().copied());
    }
}

async fn hook(State(receiver): State<Receiver>, headers: HeaderMap, body: String) -> StatusCode {
    receiver
        .received
        .lock()
        .unwrap()
        .push(Received { headers, body });
    let code = receiver.script.lock().unwrap().pop_front().unwrap_or(200);
    StatusCode::from_u16(code).unwrap()
}

async fn spawn_receiver() -> (String, Receiver) {
    let receiver = Receiver::default();
    let app = Router::new()
        .route("/hook", post(hook))
        .with_state(receiver.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/hook"), receiver)
}

struct Fixture {
    service: Arc<WebhookDeliveryService>,
    clock: Arc<ManualClock>,
    db: RelayDatabase,
}

async fn fixture_with(config: WebhookConfig) -> Fixture {
    let db = RelayDatabase::open_in_memory().await.unwrap();
    db.create_tunnel("t1", "u1", "{}", NOW).await.unwrap();
    db.create_tunnel("t2", "u2", "{}", NOW).await.unwrap();
    let clock = Arc::new(ManualClock::new(NOW));
    let service = Arc::new(
        WebhookDeliveryService::new(db.clone(), config, clock.clone()).unwrap(),
    );
    Fixture { service, clock, db }
}

async fn fixture() -> Fixture {
    fixture_with(WebhookConfig {
        timeout_secs: 2,
        ..WebhookConfig::default()
    })
    .await
}

fn input(url: &str, patterns: &[&str]) -> WebhookInput {
    WebhookInput {
        url: url.to_string(),
        secret: Some("s3cret".into()),
        event_patterns: Some(patterns.iter().map(|p| (*p).to_string()).collect()),
        property_filters: None,
        is_active: None,
    }
}

fn status_event(user: &str, tunnel: &str, current: &str) -> WebhookEvent {
    WebhookEvent::status_changed(user, tunnel, "connecting", current, None, NOW)
}

#[tokio::test]
async fn delivers_signed_payload_to_matching_registration() {
    let f = fixture().await;
    let (url, receiver) = spawn_receiver().await;
    let hook = f
        .service
        .register("u1", "t1", input(&url, &["tunnel.*"]))
        .await
        .unwrap();
    f.service
        .register("u1", "t1", input(&url, &["quota.*"]))
        .await
        .unwrap();

    let event = status_event("u1", "t1", "connected");
    let deliveries = f.service.dispatch(&event).await.unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].status, DeliveryStatus::Delivered);
    assert_eq!(deliveries[0].attempt_count, 1);
    assert_eq!(deliveries[0].last_http_status, Some(200));
    assert_eq!(deliveries[0].delivered_at, Some(NOW));
    assert_eq!(receiver.count(), 1);

    let received = receiver.last();
    let header = |name: &str| received.headers[name].to_str().unwrap().to_string();
    assert!(signature::verify(
        "s3cret",
        received.body.as_bytes(),
        &header("x-webhook-signature")
    ));
    assert_eq!(header("x-webhook-id"), hook.id);
    assert_eq!(header("x-delivery-id"), deliveries[0].id);

    let body: serde_json::Value = serde_json::from_str(&received.body).unwrap();
    assert_eq!(body["type"], "tunnel.status_changed");
    assert_eq!(body["data"]["newStatus"], "connected");
    assert_eq!(body["id"], event.id);
}

#[tokio::test]
async fn failures_follow_retry_schedule_until_delivered() {
    let f = fixture().await;
    let (url, receiver) = spawn_receiver().await;
    receiver.script(&[500, 500, 500, 500]);
    f.service
        .register("u1", "t1", input(&url, &["*"]))
        .await
        .unwrap();

    let deliveries = f
        .service
        .dispatch(&status_event("u1", "t1", "connected"))
        .await
        .unwrap();
    let id = deliveries[0].id.clone();
    assert_eq!(deliveries[0].status, DeliveryStatus::Retrying);
    assert_eq!(deliveries[0].next_retry_at, Some(NOW + 5_000));
    assert_eq!(deliveries[0].last_http_status, Some(500));

    // Not yet due.
    assert_eq!(f.service.retry_failed_deliveries().await.unwrap(), 0);

    let mut statuses = vec![DeliveryStatus::Retrying];
    for delay in [5, 30, 300, 3600] {
        f.clock.advance(Duration::from_secs(delay));
        assert_eq!(f.service.retry_failed_deliveries().await.unwrap(), 1);
        let row = f.db.get_delivery(&id).await.unwrap();
        statuses.push(match row.status.as_str() {
            "retrying" => DeliveryStatus::Retrying,
            "delivered" => DeliveryStatus::Delivered,
            other => panic!("unexpected status {other}"),
        });
    }
    assert_eq!(
        statuses,
        [
            DeliveryStatus::Retrying,
            DeliveryStatus::Retrying,
            DeliveryStatus::Retrying,
            DeliveryStatus::Retrying,
            DeliveryStatus::Delivered,
        ]
    );
    assert_eq!(receiver.count(), 5);
    let row = f.db.get_delivery(&id).await.unwrap();
    assert_eq!(row.attempt_count, 5);
    assert!(row.next_retry_at.is_none());
}

#[tokio::test]
async fn fifth_failure_marks_failed() {
    let f = fixture().await;
    let (url, receiver) = spawn_receiver().await;
    receiver.script(&[500; 10]);
    f.service
        .register("u1", "t1", input(&url, &["*"]))
        .await
        .unwrap();

    let deliveries = f
        .service
        .dispatch(&status_event("u1", "t1", "error"))
        .await
        .unwrap();
    let id = deliveries[0].id.clone();
    for delay in [5, 30, 300] {
        f.clock.advance(Duration::from_secs(delay));
        f.service.retry_failed_deliveries().await.unwrap();
        assert_eq!(f.db.get_delivery(&id).await.unwrap().status, "retrying");
    }
    f.clock.advance(Duration::from_secs(3600));
    f.service.retry_failed_deliveries().await.unwrap();

    let row = f.db.get_delivery(&id).await.unwrap();
    assert_eq!(row.status, "failed");
    assert_eq!(row.attempt_count, 5);
    assert_eq!(row.last_http_status, Some(500));
    assert!(row.next_retry_at.is_none());

    // Nothing left to sweep.
    f.clock.advance(Duration::from_secs(24 * 3600));
    assert_eq!(f.service.retry_failed_deliveries().await.unwrap(), 0);
    assert_eq!(receiver.count(), 5);
}

#[tokio::test]
async fn short_schedule_bounds_attempts() {
    let f = fixture_with(WebhookConfig {
        timeout_secs: 2,
        retry_schedule_secs: vec![1, 1],
        ..WebhookConfig::default()
    })
    .await;
    let (url, receiver) = spawn_receiver().await;
    receiver.script(&[503; 10]);
    f.service
        .register("u1", "t1", input(&url, &["*"]))
        .await
        .unwrap();

    let deliveries = f
        .service
        .dispatch(&status_event("u1", "t1", "error"))
        .await
        .unwrap();
    f.clock.advance(Duration::from_secs(1));
    f.service.retry_failed_deliveries().await.unwrap();

    let row = f.db.get_delivery(&deliveries[0].id).await.unwrap();
    assert_eq!(row.status, "failed");
    assert_eq!(row.attempt_count, 2);
    assert_eq!(receiver.count(), 2);
}

#[tokio::test]
async fn sweep_recovers_unattempted_pending_delivery() {
    let f = fixture().await;
    let (url, receiver) = spawn_receiver().await;
    let hook = f
        .service
        .register("u1", "t1", input(&url, &["*"]))
        .await
        .unwrap();
    // Row written, process gone before the first POST.
    f.db.create_delivery("d1", &hook.id, "ev1", "tunnel.created", "{}", NOW)
        .await
        .unwrap();

    assert_eq!(f.service.retry_failed_deliveries().await.unwrap(), 0);
    f.clock.advance(Duration::from_secs(2));
    assert_eq!(f.service.retry_failed_deliveries().await.unwrap(), 1);

    let row = f.db.get_delivery("d1").await.unwrap();
    assert_eq!(row.status, "delivered");
    assert_eq!(row.attempt_count, 1);
    assert_eq!(receiver.count(), 1);
}

#[tokio::test]
async fn connection_errors_are_retried() {
    let f = fixture().await;
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = format!("http://{}/hook", listener.local_addr().unwrap());
    drop(listener);

    f.service
        .register("u1", "t1", input(&dead, &["*"]))
        .await
        .unwrap();
    let deliveries = f
        .service
        .dispatch(&status_event("u1", "t1", "connected"))
        .await
        .unwrap();
    assert_eq!(deliveries[0].status, DeliveryStatus::Retrying);
    assert!(deliveries[0].last_http_status.is_none());
    assert!(deliveries[0].last_error.is_some());
}

#[tokio::test]
async fn property_filters_restrict_delivery() {
    let f = fixture().await;
    let (url, receiver) = spawn_receiver().await;
    let mut registration = input(&url, &["tunnel.status_changed"]);
    registration.property_filters = Some(vec![PropertyFilter {
        path: "data.newStatus".into(),
        operator: FilterOperator::In,
        value: json!(["error", "disconnected"]),
    }]);
    f.service.register("u1", "t1", registration).await.unwrap();

    let none = f
        .service
        .dispatch(&status_event("u1", "t1", "connected"))
        .await
        .unwrap();
    assert!(none.is_empty());
    let some = f
        .service
        .dispatch(&status_event("u1", "t1", "error"))
        .await
        .unwrap();
    assert_eq!(some.len(), 1);
    assert_eq!(receiver.count(), 1);
}

#[tokio::test]
async fn events_stay_within_owner_and_tunnel() {
    let f = fixture().await;
    let (url, receiver) = spawn_receiver().await;
    f.service
        .register("u2", "t2", input(&url, &["*"]))
        .await
        .unwrap();

    let delivered = f
        .service
        .dispatch(&status_event("u1", "t1", "connected"))
        .await
        .unwrap();
    assert!(delivered.is_empty());
    assert_eq!(receiver.count(), 0);

    // User-scoped events reach every registration of that user.
    let quota = WebhookEvent::new(
        super::event::QUOTA_EXCEEDED,
        "u2",
        None,
        NOW,
        json!({ "resourceType": "api_requests" }),
    );
    assert_eq!(f.service.dispatch(&quota).await.unwrap().len(), 1);
}

#[tokio::test]
async fn registration_validation() {
    let f = fixture().await;
    let err = f
        .service
        .register("u1", "t1", input("ftp://example.com/hook", &["*"]))
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::Validation(_)));

    let err = f
        .service
        .register("u1", "t1", input("http://example.com/hook", &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::Validation(_)));

    let mut bad_filter = input("http://example.com/hook", &["*"]);
    bad_filter.property_filters = Some(vec![PropertyFilter {
        path: "data.x".into(),
        operator: FilterOperator::Regex,
        value: json!("(unclosed"),
    }]);
    assert!(matches!(
        f.service.register("u1", "t1", bad_filter).await,
        Err(WebhookError::Validation(_))
    ));

    // Someone else's tunnel does not exist as far as u1 is concerned.
    let err = f
        .service
        .register("u1", "t2", input("http://example.com/hook", &["*"]))
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::NotFound(_)));
}

#[tokio::test]
async fn secret_is_generated_and_shown_once() {
    let f = fixture().await;
    let mut registration = input("https://example.com/hook", &["*"]);
    registration.secret = None;
    let created = f.service.register("u1", "t1", registration).await.unwrap();
    assert!(created.secret.as_deref().unwrap().starts_with("whsec_"));
    assert_eq!(created.event_patterns, ["*"]);

    let fetched = f.service.get(&created.id, "t1", "u1").await.unwrap();
    assert!(fetched.secret.is_none());
    let listed = f.service.list("t1", "u1").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].secret.is_none());
}

#[tokio::test]
async fn update_deactivate_and_delete() {
    let f = fixture().await;
    let (url, receiver) = spawn_receiver().await;
    let hook = f
        .service
        .register("u1", "t1", input(&url, &["tunnel.*"]))
        .await
        .unwrap();

    f.clock.advance(Duration::from_millis(1));
    let updated = f
        .service
        .update(
            &hook.id,
            "t1",
            "u1",
            WebhookUpdate {
                is_active: Some(false),
                ..WebhookUpdate::default()
            },
        )
        .await
        .unwrap();
    assert!(!updated.is_active);
    assert_eq!(updated.url, url);
    assert!(f
        .service
        .dispatch(&status_event("u1", "t1", "connected"))
        .await
        .unwrap()
        .is_empty());

    f.clock.advance(Duration::from_millis(1));
    f.service
        .update(
            &hook.id,
            "t1",
            "u1",
            WebhookUpdate {
                is_active: Some(true),
                event_patterns: Some(vec!["quota.*".into()]),
                ..WebhookUpdate::default()
            },
        )
        .await
        .unwrap();
    // The cached matcher for the old patterns must not be reused.
    assert!(f
        .service
        .dispatch(&status_event("u1", "t1", "connected"))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(receiver.count(), 0);

    assert!(matches!(
        f.service.delete(&hook.id, "t1", "u2").await,
        Err(WebhookError::NotFound(_))
    ));
    f.service.delete(&hook.id, "t1", "u1").await.unwrap();
    assert!(matches!(
        f.service.get(&hook.id, "t1", "u1").await,
        Err(WebhookError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_event_bypasses_patterns() {
    let f = fixture().await;
    let (url, receiver) = spawn_receiver().await;
    let hook = f
        .service
        .register("u1", "t1", input(&url, &["quota.*"]))
        .await
        .unwrap();

    let delivery = f
        .service
        .send_test_event(&hook.id, "t1", "u1")
        .await
        .unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Delivered);
    assert_eq!(delivery.event_type, "webhook.test");
    assert_eq!(receiver.count(), 1);

    let history = f
        .service
        .list_deliveries(&hook.id, "t1", "u1", 10)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].payload["data"]["webhookId"], hook.id);
}

#[tokio::test]
async fn inactive_webhook_retries_are_abandoned() {
    let f = fixture().await;
    let (url, receiver) = spawn_receiver().await;
    receiver.script(&[500]);
    let hook = f
        .service
        .register("u1", "t1", input(&url, &["*"]))
        .await
        .unwrap();
    let deliveries = f
        .service
        .dispatch(&status_event("u1", "t1", "connected"))
        .await
        .unwrap();

    f.service
        .update(
            &hook.id,
            "t1",
            "u1",
            WebhookUpdate {
                is_active: Some(false),
                ..WebhookUpdate::default()
            },
        )
        .await
        .unwrap();
    f.clock.advance(Duration::from_secs(5));
    assert_eq!(f.service.retry_failed_deliveries().await.unwrap(), 1);

    let row = f.db.get_delivery(&deliveries[0].id).await.unwrap();
    assert_eq!(row.status, "failed");
    assert_eq!(row.last_error.as_deref(), Some("webhook is inactive"));
    assert_eq!(receiver.count(), 1);
}

#[tokio::test]
async fn dispatcher_consumes_published_events() {
    let f = fixture().await;
    let (url, receiver) = spawn_receiver().await;
    f.service
        .register("u1", "t1", input(&url, &["*"]))
        .await
        .unwrap();

    let (publisher, events) = EventPublisher::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = f.service.spawn_dispatcher(events, shutdown_rx);

    publisher.publish(status_event("u1", "t1", "connected"));
    tokio::time::timeout(Duration::from_secs(5), async {
        while receiver.count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}
