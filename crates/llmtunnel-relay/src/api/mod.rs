//! REST and WebSocket surface of the relay.
//!
//! Every route runs behind the admission middleware, which assigns a
//! correlation ID and applies rate limits before any handler runs.

pub mod admin;
pub mod admission;
pub mod agent;
pub mod error;
pub mod extract;
pub mod proxy;
pub mod quotas;
pub mod system;
pub mod tunnels;
pub mod webhooks;

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::middleware;
use axum::routing::{any, get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use llmtunnel_core::Clock;

use crate::auth::JwtManager;
use crate::config::RelayConfig;
use crate::health::{HealthMonitor, MetricsBuffer};
use crate::quota::QuotaService;
use crate::ratelimit::RateLimiter;
use crate::registry::AgentRegistry;
use crate::router::AgentRouter;
use crate::storage::RelayDatabase;
use crate::tunnel::TunnelService;
use crate::webhook::{EventPublisher, WebhookDeliveryService, WebhookEvent};

pub use error::ApiError;

/// Services shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub jwt: Arc<JwtManager>,
    pub tunnels: Arc<TunnelService>,
    pub quotas: Arc<QuotaService>,
    pub limiter: Arc<RateLimiter>,
    /// `None` when the outbound HTTP client could not be built.
    pub webhooks: Option<Arc<WebhookDeliveryService>>,
    /// `None` when no Prometheus recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire the service graph. Returns the state and the receiving end of
    /// the lifecycle event queue, to be handed to [`AppState::spawn_background`].
    pub fn new(
        db: &RelayDatabase,
        config: &RelayConfig,
        jwt: JwtManager,
        clock: Arc<dyn Clock>,
        metrics: Option<PrometheusHandle>,
    ) -> (Self, mpsc::Receiver<WebhookEvent>) {
        let registry = Arc::new(AgentRegistry::new());
        let router = AgentRouter::new(registry);
        let (publisher, events) = EventPublisher::channel(config.webhook.event_queue);

        let health = Arc::new(HealthMonitor::new(
            db.clone(),
            router.clone(),
            Arc::new(MetricsBuffer::new()),
            publisher.clone(),
            Arc::clone(&clock),
            config.health,
        ));
        let quotas = Arc::new(QuotaService::new(
            db.clone(),
            config.quota.clone(),
            Arc::clone(&clock),
            publisher.clone(),
        ));
        let tunnels = Arc::new(TunnelService::new(
            db.clone(),
            router,
            health,
            Arc::clone(&quotas),
            publisher,
            Arc::clone(&clock),
            config.tunnel,
        ));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone(), Arc::clone(&clock)));

        let webhooks = match WebhookDeliveryService::new(db.clone(), config.webhook.clone(), clock) {
            Ok(service) => Some(Arc::new(service)),
            Err(e) => {
                warn!(error = %e, "Webhook delivery disabled");
                None
            }
        };

        let state = Self {
            jwt: Arc::new(jwt),
            tunnels,
            quotas,
            limiter,
            webhooks,
            metrics,
            started_at: Instant::now(),
        };
        (state, events)
    }

    /// Start the schedulers: event dispatch, webhook retries, metrics
    /// flushes, stale tunnel expiry and rate-limit state pruning. Each
    /// stops when `shutdown` flips.
    pub fn spawn_background(
        &self,
        events: mpsc::Receiver<WebhookEvent>,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![
            self.tunnels.health().spawn_flush_scheduler(shutdown.clone()),
            self.tunnels.spawn_expiry_sweeper(shutdown.clone()),
            self.limiter.spawn_prune_task(shutdown.clone()),
        ];
        match &self.webhooks {
            Some(webhooks) => {
                tasks.push(webhooks.spawn_dispatcher(events, shutdown.clone()));
                tasks.push(webhooks.spawn_retry_sweeper(shutdown.clone()));
            }
            None => drop(events),
        }
        tasks
    }
}

pub fn build_router(state: AppState) -> Router {
    let tunnel_routes = Router::new()
        .route("/tunnels", get(tunnels::list_tunnels).post(tunnels::create_tunnel))
        .route(
            "/tunnels/{id}",
            get(tunnels::get_tunnel).delete(tunnels::delete_tunnel),
        )
        .route("/tunnels/{id}/status", get(tunnels::status))
        .route("/tunnels/{id}/health", get(tunnels::endpoint_health))
        .route("/tunnels/{id}/health-check", post(tunnels::force_health_check))
        .route("/tunnels/{id}/metrics", get(tunnels::metrics))
        .route("/tunnels/{id}/metrics/record", post(tunnels::record_metrics))
        .route("/tunnels/{id}/metrics/flush", post(tunnels::flush_metrics))
        .route(
            "/tunnels/{id}/config",
            get(tunnels::get_config).put(tunnels::update_config),
        )
        .route("/tunnels/{id}/config/reset", post(tunnels::reset_config))
        .route("/tunnels/{id}/activity", get(tunnels::activity))
        .route(
            "/tunnels/{id}/endpoints",
            get(tunnels::list_endpoints).post(tunnels::add_endpoint),
        )
        .route(
            "/tunnels/{id}/endpoints/{endpoint_id}",
            axum::routing::delete(tunnels::remove_endpoint),
        );

    let webhook_routes = Router::new()
        .route(
            "/tunnels/{id}/webhooks",
            get(webhooks::list).post(webhooks::register),
        )
        .route(
            "/tunnels/{id}/webhooks/{webhook_id}",
            get(webhooks::get)
                .put(webhooks::update)
                .delete(webhooks::delete),
        )
        .route(
            "/tunnels/{id}/webhooks/{webhook_id}/deliveries",
            get(webhooks::deliveries),
        )
        .route(
            "/tunnels/{id}/webhooks/{webhook_id}/test",
            post(webhooks::send_test),
        );

    let admin_routes = Router::new()
        .route("/rate-limit-metrics/summary", get(admin::summary))
        .route("/rate-limit-metrics/top-violators", get(admin::top_violators))
        .route("/rate-limit-metrics/top-ips", get(admin::top_ips))
        .route("/rate-limit-metrics/dashboard-data", get(admin::dashboard))
        .route(
            "/rate-limit-exemptions",
            get(admin::list_exemptions).post(admin::create_exemption),
        )
        .route(
            "/rate-limit-exemptions/{id}",
            axum::routing::delete(admin::delete_exemption),
        )
        .route("/rate-limit-exemptions/{id}/enable", post(admin::enable_exemption))
        .route("/rate-limit-exemptions/{id}/disable", post(admin::disable_exemption));

    let quota_routes = Router::new()
        .route("/quotas", get(quotas::list))
        .route("/quotas/summary", get(quotas::summary))
        .route("/quotas/{resource_type}", get(quotas::get))
        .route("/quotas/{resource_type}/history", get(quotas::history))
        .route("/quotas/{resource_type}/reset", post(quotas::reset));

    Router::new()
        .route("/health", get(system::health))
        .route("/metrics", get(system::metrics))
        .route("/agent/connect", get(agent::connect))
        .route("/proxy/{*path}", any(proxy::forward))
        .merge(tunnel_routes)
        .merge(webhook_routes)
        .merge(admin_routes)
        .merge(quota_routes)
        .layer(middleware::from_fn_with_state(state.clone(), admission::admit))
        .with_state(state)
}
