//! Tunnel lifecycle, configuration and request proxying.
//!
//! `TunnelService` is the orchestration point of the control plane: it owns
//! tunnel and endpoint records, walks the status state machine, binds agent
//! sessions to tunnels and forwards requests through them while feeding
//! quotas, metrics, endpoint health and lifecycle events.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use llmtunnel_core::Clock;

use super::balancer::EndpointBalancer;
use super::config::{ConfigValidationError, TunnelConfig, TunnelConfigPatch};
use super::state::{TransitionError, TunnelStatus};
use super::types::{ActivityEntry, EndpointSpec, Tunnel, TunnelEndpoint};
use crate::auth::Tier;
use crate::config::TunnelServiceConfig;
use crate::health::{HealthError, HealthMonitor, RequestSample};
use crate::quota::{QuotaError, QuotaService, ResourceType};
use crate::registry::{AgentConnection, AgentFrame, ProxyRequest, ProxyResponse};
use crate::router::{AgentRouter, RouterError};
use crate::storage::{DatabaseError, RelayDatabase, TunnelRow};
use crate::telemetry;
use crate::webhook::event::{
    EventPublisher, TUNNEL_CONFIG_UPDATED, TUNNEL_CREATED, TUNNEL_DELETED, WebhookEvent,
};

/// Attempts per proxied request: the best endpoint, then the next best.
const MAX_PROXY_ATTEMPTS: usize = 2;

/// Compare-and-set retries when the status changes underneath a transition.
const MAX_TRANSITION_ATTEMPTS: usize = 3;

const MAX_ENDPOINT_WEIGHT: i64 = 1_000;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Invalid tunnel request: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Tunnel not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("No connected tunnel for user {0}")]
    TunnelUnavailable(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Tunnel {tunnel_id} is at its limit of {limit} concurrent requests")]
    Saturated { tunnel_id: String, limit: u32 },

    #[error("Quota exceeded for {resource}")]
    QuotaExceeded {
        resource: ResourceType,
        retry_after: Duration,
    },

    #[error("Database error: {0}")]
    Database(DatabaseError),
}

impl From<DatabaseError> for TunnelError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => Self::NotFound(what),
            DatabaseError::Conflict(what) => Self::Conflict(what),
            other => Self::Database(other),
        }
    }
}

impl From<serde_json::Error> for TunnelError {
    fn from(e: serde_json::Error) -> Self {
        Self::Database(DatabaseError::from(e))
    }
}

impl From<ConfigValidationError> for TunnelError {
    fn from(e: ConfigValidationError) -> Self {
        Self::Validation(e.0)
    }
}

impl From<QuotaError> for TunnelError {
    fn from(e: QuotaError) -> Self {
        match e {
            QuotaError::Validation(msg) => Self::Validation(vec![msg]),
            QuotaError::Exceeded {
                resource,
                retry_after,
            } => Self::QuotaExceeded {
                resource,
                retry_after,
            },
            QuotaError::Database(e) => e.into(),
        }
    }
}

impl From<HealthError> for TunnelError {
    fn from(e: HealthError) -> Self {
        match e {
            HealthError::NotFound(what) => Self::NotFound(what),
            HealthError::Database(e) => Self::Database(e),
        }
    }
}

pub struct TunnelService {
    db: RelayDatabase,
    router: AgentRouter,
    health: Arc<HealthMonitor>,
    quotas: Arc<QuotaService>,
    events: EventPublisher,
    clock: Arc<dyn Clock>,
    balancer: EndpointBalancer,
    /// Requests currently being forwarded, per tunnel.
    in_flight: DashMap<String, Arc<AtomicU32>>,
    config: TunnelServiceConfig,
}

/// One of a tunnel's `max_connections` slots, released on drop.
struct ConnectionSlot(Arc<AtomicU32>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl TunnelService {
    pub fn new(
        db: RelayDatabase,
        router: AgentRouter,
        health: Arc<HealthMonitor>,
        quotas: Arc<QuotaService>,
        events: EventPublisher,
        clock: Arc<dyn Clock>,
        config: TunnelServiceConfig,
    ) -> Self {
        Self {
            db,
            router,
            health,
            quotas,
            events,
            clock,
            balancer: EndpointBalancer::new(),
            in_flight: DashMap::new(),
            config,
        }
    }

    pub const fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub const fn quotas(&self) -> &Arc<QuotaService> {
        &self.quotas
    }

    pub const fn router(&self) -> &AgentRouter {
        &self.router
    }

    pub const fn config(&self) -> &TunnelServiceConfig {
        &self.config
    }

    // =========================================================================
    // Tunnel records
    // =========================================================================

    /// Create a tunnel in the `created` state with `patch` merged over the
    /// default configuration.
    #[instrument(skip(self, patch))]
    pub async fn create_tunnel(
        &self,
        user_id: &str,
        tier: Tier,
        patch: &TunnelConfigPatch,
    ) -> Result<Tunnel, TunnelError> {
        let config = TunnelConfig::default().apply(patch)?;
        self.insert_tunnel(user_id, tier, config).await
    }

    async fn insert_tunnel(
        &self,
        user_id: &str,
        tier: Tier,
        config: TunnelConfig,
    ) -> Result<Tunnel, TunnelError> {
        self.quotas
            .ensure_headroom(user_id, tier, ResourceType::TunnelCount, 1)
            .await?;

        let id = uuid::Uuid::new_v4().to_string();
        let now = self.clock.now_millis();
        let row = match self
            .db
            .create_tunnel(&id, user_id, &config.to_json()?, now)
            .await
        {
            Ok(row) => row,
            Err(DatabaseError::Conflict(_)) => {
                return Err(TunnelError::Conflict(format!(
                    "user {user_id} already has an active tunnel"
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let tunnel = Tunnel::try_from(row)?;
        info!(tunnel_id = %tunnel.id, user_id, "Tunnel created");
        self.events.publish(WebhookEvent::new(
            TUNNEL_CREATED,
            user_id,
            Some(&tunnel.id),
            now,
            json!({ "status": tunnel.status, "config": tunnel.config }),
        ));
        Ok(tunnel)
    }

    pub async fn get_tunnel(&self, tunnel_id: &str, user_id: &str) -> Result<Tunnel, TunnelError> {
        let row = self.db.get_tunnel_for_user(tunnel_id, user_id).await?;
        Ok(Tunnel::try_from(row)?)
    }

    pub async fn list_tunnels(&self, user_id: &str) -> Result<Vec<Tunnel>, TunnelError> {
        Ok(self
            .db
            .list_tunnels(user_id)
            .await?
            .into_iter()
            .map(Tunnel::try_from)
            .collect::<Result<Vec<_>, _>>()?)
    }

    /// Delete a tunnel and everything hanging off it, dropping its agent
    /// session if one is live.
    #[instrument(skip(self))]
    pub async fn delete_tunnel(&self, tunnel_id: &str, user_id: &str) -> Result<(), TunnelError> {
        self.db.get_tunnel_for_user(tunnel_id, user_id).await?;

        self.health.stop_monitoring(tunnel_id);
        if self.router.registry().remove(tunnel_id).await.is_some() {
            telemetry::set_connected_agents(self.router.registry().connection_count().await);
        }
        if !self.db.delete_tunnel(tunnel_id, user_id).await? {
            return Err(TunnelError::NotFound(format!("Tunnel {tunnel_id}")));
        }
        self.health.discard_metrics(tunnel_id);
        self.balancer.forget(tunnel_id);
        self.in_flight.remove(tunnel_id);

        info!(tunnel_id, user_id, "Tunnel deleted");
        self.events.publish(WebhookEvent::new(
            TUNNEL_DELETED,
            user_id,
            Some(tunnel_id),
            self.clock.now_millis(),
            json!({}),
        ));
        Ok(())
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Move a tunnel to `next`. The only way any status changes.
    ///
    /// Illegal transitions fail with `InvalidTransition`. A concurrent
    /// writer changing the status first causes a re-read and a re-check.
    pub async fn set_status(
        &self,
        tunnel_id: &str,
        next: TunnelStatus,
        reason: Option<&str>,
    ) -> Result<Tunnel, TunnelError> {
        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let row = self.db.get_tunnel(tunnel_id).await?;
            let current: TunnelStatus = row.status.parse().map_err(DatabaseError::Corrupt)?;
            current.transition(next)?;

            let now = self.clock.now_millis();
            let details = json!({ "from": current, "to": next, "reason": reason }).to_string();
            if self
                .db
                .transition_tunnel_status(tunnel_id, current.as_str(), next.as_str(), &details, now)
                .await?
            {
                info!(tunnel_id, from = %current, to = %next, reason, "Tunnel status changed");
                self.events.publish(WebhookEvent::status_changed(
                    &row.user_id,
                    tunnel_id,
                    current.as_str(),
                    next.as_str(),
                    reason,
                    now,
                ));
                return Ok(Tunnel::try_from(self.db.get_tunnel(tunnel_id).await?)?);
            }
            debug!(tunnel_id, from = %current, to = %next, "Status changed concurrently, retrying");
        }
        Err(TunnelError::Conflict(format!(
            "status of tunnel {tunnel_id} keeps changing"
        )))
    }

    // =========================================================================
    // Agent sessions
    // =========================================================================

    /// Bind a freshly registered agent session to the user's tunnel.
    ///
    /// Reuses the user's active tunnel, else reconnects their most recent
    /// one, else creates a new one. The tunnel ends up `connected` with
    /// exactly the declared endpoints and health monitoring running.
    #[instrument(skip(self, endpoints, frame_tx))]
    pub async fn agent_connected(
        &self,
        user_id: &str,
        tier: Tier,
        endpoints: &[EndpointSpec],
        frame_tx: mpsc::Sender<AgentFrame>,
    ) -> Result<(Tunnel, Arc<AgentConnection>), TunnelError> {
        let errors: Vec<String> = endpoints.iter().filter_map(endpoint_spec_error).collect();
        if !errors.is_empty() {
            return Err(TunnelError::Validation(errors));
        }

        let row = self.resolve_agent_tunnel(user_id, tier).await?;
        let tunnel_id = row.id.clone();
        let conn = self
            .router
            .registry()
            .register(tunnel_id.clone(), user_id.to_string(), frame_tx)
            .await;

        match self.bring_online(&row, endpoints).await {
            Ok(tunnel) => {
                self.health.start_monitoring(&tunnel_id);
                telemetry::set_connected_agents(self.router.registry().connection_count().await);
                Ok((tunnel, conn))
            }
            Err(e) => {
                self.router
                    .registry()
                    .unregister(&tunnel_id, &conn.session_id)
                    .await;
                Err(e)
            }
        }
    }

    async fn resolve_agent_tunnel(&self, user_id: &str, tier: Tier) -> Result<TunnelRow, TunnelError> {
        if let Some(row) = self.db.get_active_tunnel(user_id).await? {
            return Ok(row);
        }
        if let Some(row) = self.db.get_latest_tunnel(user_id).await? {
            return Ok(row);
        }
        let tunnel = self
            .insert_tunnel(user_id, tier, TunnelConfig::default())
            .await?;
        Ok(self.db.get_tunnel(&tunnel.id).await?)
    }

    async fn bring_online(
        &self,
        row: &TunnelRow,
        endpoints: &[EndpointSpec],
    ) -> Result<Tunnel, TunnelError> {
        let now = self.clock.now_millis();
        for spec in endpoints {
            self.db
                .upsert_endpoint(
                    &uuid::Uuid::new_v4().to_string(),
                    &row.id,
                    &spec.url,
                    spec.priority,
                    spec.weight,
                    now,
                )
                .await?;
        }
        let urls: Vec<String> = endpoints.iter().map(|e| e.url.clone()).collect();
        self.db.retain_endpoints(&row.id, &urls).await?;

        let status: TunnelStatus = row.status.parse().map_err(DatabaseError::Corrupt)?;
        match status {
            TunnelStatus::Connected => {
                info!(tunnel_id = %row.id, "Agent session replaced on connected tunnel");
                Ok(Tunnel::try_from(self.db.get_tunnel(&row.id).await?)?)
            }
            TunnelStatus::Connecting => {
                self.set_status(&row.id, TunnelStatus::Connected, Some("agent registered"))
                    .await
            }
            TunnelStatus::Created | TunnelStatus::Disconnected | TunnelStatus::Error => {
                self.set_status(&row.id, TunnelStatus::Connecting, Some("agent connecting"))
                    .await?;
                self.set_status(&row.id, TunnelStatus::Connected, Some("agent registered"))
                    .await
            }
        }
    }

    /// Tear down an agent session. Returns `false` if `session_id` is no
    /// longer the tunnel's current session (a newer one replaced it).
    #[instrument(skip(self))]
    pub async fn agent_disconnected(
        &self,
        tunnel_id: &str,
        session_id: &str,
        reason: &str,
    ) -> Result<bool, TunnelError> {
        if self
            .router
            .registry()
            .unregister(tunnel_id, session_id)
            .await
            .is_none()
        {
            return Ok(false);
        }
        telemetry::set_connected_agents(self.router.registry().connection_count().await);
        self.health.stop_monitoring(tunnel_id);

        match self
            .set_status(tunnel_id, TunnelStatus::Disconnected, Some(reason))
            .await
        {
            Ok(_) | Err(TunnelError::InvalidTransition(_) | TunnelError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        if let Err(e) = self.health.flush_metrics_to_database(tunnel_id).await {
            debug!(tunnel_id, error = %e, "Metrics flush on disconnect skipped");
        }
        Ok(true)
    }

    // =========================================================================
    // Proxying
    // =========================================================================

    /// Forward a request through the user's connected tunnel.
    ///
    /// Tries the best endpoint, then once more on the next best. A failed
    /// attempt marks its endpoint unhealthy. Usage is charged only for
    /// requests an endpoint actually answered. At most
    /// `config.max_connections` requests are in flight per tunnel; the
    /// rest fail with `Saturated` without reaching the agent.
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn proxy_request(
        &self,
        user_id: &str,
        tier: Tier,
        request: ProxyRequest,
    ) -> Result<ProxyResponse, TunnelError> {
        self.quotas.check(user_id, ResourceType::ApiRequests).await?;
        self.quotas.check(user_id, ResourceType::DataTransfer).await?;

        let tunnel = match self.db.get_active_tunnel(user_id).await? {
            Some(row) => Tunnel::try_from(row)?,
            None => return Err(TunnelError::TunnelUnavailable(user_id.to_string())),
        };
        if tunnel.status != TunnelStatus::Connected
            || !self.router.registry().is_connected(&tunnel.id).await
        {
            return Err(TunnelError::TunnelUnavailable(user_id.to_string()));
        }
        let _slot = self.acquire_slot(&tunnel)?;

        let endpoints = self.health.endpoint_health(&tunnel.id).await?;
        let plan = self.balancer.plan(&tunnel.id, &endpoints);
        if plan.is_empty() {
            return Err(TunnelError::Upstream(format!(
                "tunnel {} has no usable endpoint",
                tunnel.id
            )));
        }

        let timeout = Duration::from_millis(tunnel.config.timeout_ms);
        let started = Instant::now();
        let mut last_error = String::new();

        for endpoint in plan.iter().take(MAX_PROXY_ATTEMPTS) {
            let attempt_started = Instant::now();
            let result = self
                .router
                .forward_request(&tunnel.id, &endpoint.url, request.clone(), timeout)
                .await;
            let latency_ms = elapsed_millis(attempt_started);

            match result {
                Ok(response) => {
                    self.health.record_request_metrics(
                        &tunnel.id,
                        &RequestSample {
                            latency_ms,
                            success: (200..400).contains(&response.status),
                            status_code: Some(response.status),
                        },
                    );
                    telemetry::record_proxy_request(Some(response.status), started.elapsed());
                    self.charge_usage(user_id, tier, &request, &response).await;
                    return Ok(response);
                }
                Err(RouterError::NotConnected(_)) => {
                    telemetry::record_proxy_request(None, started.elapsed());
                    return Err(TunnelError::TunnelUnavailable(user_id.to_string()));
                }
                Err(e) => {
                    warn!(
                        tunnel_id = %tunnel.id,
                        endpoint_id = %endpoint.id,
                        error = %e,
                        "Proxy attempt failed"
                    );
                    self.health.record_request_metrics(
                        &tunnel.id,
                        &RequestSample {
                            latency_ms,
                            success: false,
                            status_code: None,
                        },
                    );
                    if let Err(e) = self.health.mark_unhealthy(user_id, endpoint).await {
                        warn!(endpoint_id = %endpoint.id, error = %e, "Failed to mark endpoint unhealthy");
                    }
                    last_error = e.to_string();
                }
            }
        }

        telemetry::record_proxy_request(None, started.elapsed());
        Err(TunnelError::Upstream(last_error))
    }

    /// Take an in-flight slot, checked against the tunnel's current
    /// `max_connections` so config updates apply to the next request.
    fn acquire_slot(&self, tunnel: &Tunnel) -> Result<ConnectionSlot, TunnelError> {
        let counter = Arc::clone(self.in_flight.entry(tunnel.id.clone()).or_default().value());
        let limit = tunnel.config.max_connections;
        if counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_err()
        {
            debug!(tunnel_id = %tunnel.id, limit, "Tunnel saturated, rejecting request");
            return Err(TunnelError::Saturated {
                tunnel_id: tunnel.id.clone(),
                limit,
            });
        }
        Ok(ConnectionSlot(counter))
    }

    #[allow(clippy::cast_possible_wrap)]
    async fn charge_usage(
        &self,
        user_id: &str,
        tier: Tier,
        request: &ProxyRequest,
        response: &ProxyResponse,
    ) {
        let bytes = (request.body.len() + response.body.len()) as i64;
        for (resource, delta) in [
            (ResourceType::ApiRequests, 1),
            (ResourceType::DataTransfer, bytes),
        ] {
            if let Err(e) = self.quotas.record_usage(user_id, tier, resource, delta).await {
                warn!(user_id, resource_type = resource.as_str(), error = %e, "Failed to record usage");
            }
        }
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    pub async fn get_config(
        &self,
        tunnel_id: &str,
        user_id: &str,
    ) -> Result<TunnelConfig, TunnelError> {
        Ok(self.get_tunnel(tunnel_id, user_id).await?.config)
    }

    /// Validate `patch` and merge it into the stored configuration in one
    /// transaction.
    #[instrument(skip(self, patch))]
    pub async fn update_config(
        &self,
        tunnel_id: &str,
        user_id: &str,
        patch: &TunnelConfigPatch,
    ) -> Result<Tunnel, TunnelError> {
        patch.validate()?;
        let now = self.clock.now_millis();
        let row = self
            .db
            .update_tunnel_config(
                tunnel_id,
                user_id,
                "tunnel.config_updated",
                now,
                |stored| -> Result<String, TunnelError> {
                    let merged = TunnelConfig::from_stored(stored)?.apply(patch)?;
                    Ok(merged.to_json()?)
                },
            )
            .await?;
        let tunnel = Tunnel::try_from(row)?;

        info!(tunnel_id, user_id, "Tunnel config updated");
        self.events.publish(WebhookEvent::new(
            TUNNEL_CONFIG_UPDATED,
            user_id,
            Some(tunnel_id),
            now,
            json!({ "config": tunnel.config, "changes": patch }),
        ));
        Ok(tunnel)
    }

    /// Restore the default configuration.
    #[instrument(skip(self))]
    pub async fn reset_config(&self, tunnel_id: &str, user_id: &str) -> Result<Tunnel, TunnelError> {
        let now = self.clock.now_millis();
        let row = self
            .db
            .update_tunnel_config(
                tunnel_id,
                user_id,
                "tunnel.config_reset",
                now,
                |_| -> Result<String, TunnelError> { Ok(TunnelConfig::default().to_json()?) },
            )
            .await?;
        let tunnel = Tunnel::try_from(row)?;

        info!(tunnel_id, user_id, "Tunnel config reset");
        self.events.publish(WebhookEvent::new(
            TUNNEL_CONFIG_UPDATED,
            user_id,
            Some(tunnel_id),
            now,
            json!({ "config": tunnel.config, "reset": true }),
        ));
        Ok(tunnel)
    }

    // =========================================================================
    // Endpoints and activity
    // =========================================================================

    pub async fn add_endpoint(
        &self,
        tunnel_id: &str,
        user_id: &str,
        spec: &EndpointSpec,
    ) -> Result<TunnelEndpoint, TunnelError> {
        if let Some(error) = endpoint_spec_error(spec) {
            return Err(TunnelError::Validation(vec![error]));
        }
        self.db.get_tunnel_for_user(tunnel_id, user_id).await?;

        let now = self.clock.now_millis();
        let row = self
            .db
            .upsert_endpoint(
                &uuid::Uuid::new_v4().to_string(),
                tunnel_id,
                &spec.url,
                spec.priority,
                spec.weight,
                now,
            )
            .await?;
        self.db
            .log_activity(
                tunnel_id,
                user_id,
                "endpoint.added",
                &serde_json::to_string(spec)?,
                now,
            )
            .await?;
        Ok(TunnelEndpoint::try_from(row)?)
    }

    pub async fn list_endpoints(
        &self,
        tunnel_id: &str,
        user_id: &str,
    ) -> Result<Vec<TunnelEndpoint>, TunnelError> {
        self.db.get_tunnel_for_user(tunnel_id, user_id).await?;
        Ok(self.health.endpoint_health(tunnel_id).await?)
    }

    pub async fn remove_endpoint(
        &self,
        tunnel_id: &str,
        user_id: &str,
        endpoint_id: &str,
    ) -> Result<(), TunnelError> {
        self.db.get_tunnel_for_user(tunnel_id, user_id).await?;
        if !self.db.delete_endpoint(tunnel_id, endpoint_id).await? {
            return Err(TunnelError::NotFound(format!("Endpoint {endpoint_id}")));
        }
        self.db
            .log_activity(
                tunnel_id,
                user_id,
                "endpoint.removed",
                &json!({ "endpointId": endpoint_id }).to_string(),
                self.clock.now_millis(),
            )
            .await?;
        Ok(())
    }

    pub async fn list_activity(
        &self,
        tunnel_id: &str,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<ActivityEntry>, TunnelError> {
        self.db.get_tunnel_for_user(tunnel_id, user_id).await?;
        Ok(self
            .db
            .list_activity(tunnel_id, limit)
            .await?
            .into_iter()
            .map(ActivityEntry::from)
            .collect())
    }

    // =========================================================================
    // Expiry
    // =========================================================================

    /// Delete `disconnected`/`error` tunnels idle longer than the retention
    /// window.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub async fn expire_stale_tunnels(&self) -> Result<u64, TunnelError> {
        let retention = self.config.stale_retention().as_millis() as i64;
        let before = self.clock.now_millis() - retention;
        let removed = self.db.delete_stale_tunnels(before).await?;
        if removed > 0 {
            info!(removed, "Expired stale tunnels");
        }
        Ok(removed)
    }

    pub fn spawn_expiry_sweeper(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(service.config.expiry_sweep_interval());
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = service.expire_stale_tunnels().await {
                            warn!(error = %e, "Stale tunnel sweep failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Tunnel expiry sweeper shutting down");
                        return;
                    }
                }
            }
        })
    }
}

/// Problem with an endpoint declaration, if any.
fn endpoint_spec_error(spec: &EndpointSpec) -> Option<String> {
    match reqwest::Url::parse(&spec.url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => {}
        _ => return Some(format!("endpoint url must be an absolute http(s) URL: {}", spec.url)),
    }
    if spec.priority < 0 {
        return Some(format!("endpoint priority must not be negative: {}", spec.url));
    }
    if !(1..=MAX_ENDPOINT_WEIGHT).contains(&spec.weight) {
        return Some(format!(
            "endpoint weight must be between 1 and {MAX_ENDPOINT_WEIGHT}: {}",
            spec.url
        ));
    }
    None
}

#[allow(clippy::cast_possible_truncation)]
fn elapsed_millis(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}
