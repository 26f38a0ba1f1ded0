//! Shared fixtures for service-level test modules.
//!
//! Builds the full service graph over an in-memory database and a
//! `ManualClock`, plus a scripted agent that answers relay frames.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use llmtunnel_core::ManualClock;

use crate::config::RelayConfig;
use crate::health::{HealthMonitor, MetricsBuffer};
use crate::quota::QuotaService;
use crate::registry::{AgentFrame, AgentRegistry, ProxyResponse};
use crate::router::AgentRouter;
use crate::storage::RelayDatabase;
use crate::tunnel::TunnelService;
use crate::webhook::{EventPublisher, WebhookEvent};

/// 2024-02-15T12:26:40Z
pub const NOW: i64 = 1_708_000_000_000;

pub struct TestRelay {
    pub db: RelayDatabase,
    pub clock: Arc<ManualClock>,
    pub registry: Arc<AgentRegistry>,
    pub health: Arc<HealthMonitor>,
    pub quotas: Arc<QuotaService>,
    pub tunnels: Arc<TunnelService>,
    pub events: mpsc::Receiver<WebhookEvent>,
}

impl TestRelay {
    pub async fn new() -> Self {
        Self::with_config(RelayConfig::default()).await
    }

    pub async fn with_config(config: RelayConfig) -> Self {
        let db = RelayDatabase::open_in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::new(NOW));
        let registry = Arc::new(AgentRegistry::new());
        let router = AgentRouter::new(Arc::clone(&registry));
        let (publisher, events) = EventPublisher::channel(256);

        let health = Arc::new(HealthMonitor::new(
            db.clone(),
            router.clone(),
            Arc::new(MetricsBuffer::new()),
            publisher.clone(),
            clock.clone(),
            config.health,
        ));
        let quotas = Arc::new(QuotaService::new(
            db.clone(),
            config.quota.clone(),
            clock.clone(),
            publisher.clone(),
        ));
        let tunnels = Arc::new(TunnelService::new(
            db.clone(),
            router,
            Arc::clone(&health),
            Arc::clone(&quotas),
            publisher,
            clock.clone(),
            config.tunnel,
        ));

        Self {
            db,
            clock,
            registry,
            health,
            quotas,
            tunnels,
            events,
        }
    }

    /// Every event published so far.
    pub fn drain_events(&mut self) -> Vec<WebhookEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Answer frames sent to the agent of `tunnel_id` with `respond`.
///
/// `respond` returns the reply for a frame, or `None` to stay silent.
pub fn spawn_agent<F>(
    registry: Arc<AgentRegistry>,
    tunnel_id: String,
    mut rx: mpsc::Receiver<AgentFrame>,
    respond: F,
) -> JoinHandle<()>
where
    F: Fn(&AgentFrame) -> Option<AgentFrame> + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Some(reply) = respond(&frame) else {
                continue;
            };
            let Some(correlation_id) = reply.reply_correlation_id().map(str::to_string) else {
                continue;
            };
            if let Some(conn) = registry.get(&tunnel_id).await {
                conn.complete_pending(&correlation_id, reply).await;
            }
        }
    })
}

/// An agent whose endpoints are all up. Requests are answered with status
/// 200 and the endpoint URL as the body.
pub fn healthy_agent(frame: &AgentFrame) -> Option<AgentFrame> {
    match frame {
        AgentFrame::Request {
            correlation_id,
            endpoint_url,
            ..
        } => Some(AgentFrame::Response {
            correlation_id: correlation_id.clone(),
            response: ProxyResponse {
                status: 200,
                headers: vec![("content-type".into(), "text/plain".into())],
                body: endpoint_url.clone().into_bytes(),
            },
        }),
        AgentFrame::Probe { correlation_id, .. } => Some(AgentFrame::ProbeResult {
            correlation_id: correlation_id.clone(),
            status: Some(200),
            error: None,
        }),
        _ => None,
    }
}
