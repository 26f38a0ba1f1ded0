//! Per-tunnel health monitoring.
//!
//! Each monitored tunnel owns one background task that probes all of its
//! endpoints concurrently on every tick. Starting and stopping monitoring
//! is explicit: the task handle lives in the monitor and is aborted on stop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use llmtunnel_core::Clock;

use super::buffer::{AggregatedMetrics, MetricsBuffer, RequestSample};
use crate::config::HealthConfig;
use crate::router::AgentRouter;
use crate::storage::{DatabaseError, RelayDatabase};
use crate::telemetry;
use crate::tunnel::{
    HealthStatus, MetricsWindow, Tunnel, TunnelEndpoint, TunnelMetricsSnapshot, TunnelStatus,
};
use crate::webhook::{EventPublisher, WebhookEvent};

#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("Tunnel not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(DatabaseError),
}

impl From<DatabaseError> for HealthError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => Self::NotFound(what),
            other => Self::Database(other),
        }
    }
}

/// Status, live metrics and endpoint health for one tunnel.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatusSummary {
    pub tunnel_id: String,
    pub status: TunnelStatus,
    pub agent_connected: bool,
    pub monitoring: bool,
    /// Requests since the last flush.
    pub current_metrics: AggregatedMetrics,
    /// Totals folded in by past flushes.
    pub cumulative_metrics: TunnelMetricsSnapshot,
    pub healthy_endpoints: usize,
    pub total_endpoints: usize,
    pub endpoints: Vec<TunnelEndpoint>,
    pub updated_at: i64,
}

pub struct HealthMonitor {
    db: RelayDatabase,
    router: AgentRouter,
    buffer: Arc<MetricsBuffer>,
    events: EventPublisher,
    clock: Arc<dyn Clock>,
    config: HealthConfig,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(
        db: RelayDatabase,
        router: AgentRouter,
        buffer: Arc<MetricsBuffer>,
        events: EventPublisher,
        clock: Arc<dyn Clock>,
        config: HealthConfig,
    ) -> Self {
        Self {
            db,
            router,
            buffer,
            events,
            clock,
            config,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    // =========================================================================
    // Monitoring lifecycle
    // =========================================================================

    /// Start (or restart) periodic probing of a tunnel. The first check runs
    /// immediately.
    pub fn start_monitoring(self: &Arc<Self>, tunnel_id: &str) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let id = tunnel_id.to_string();
        let interval = self.config.interval();

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                let Some(monitor) = weak.upgrade() else {
                    return;
                };
                if let Err(e) = monitor.check_tunnel(&id).await {
                    warn!(tunnel_id = %id, error = %e, "Health check failed");
                    if matches!(e, HealthError::NotFound(_)) {
                        return;
                    }
                }
            }
        });

        if let Some(previous) = self.lock_tasks().insert(tunnel_id.to_string(), handle) {
            previous.abort();
        }
        info!(tunnel_id = %tunnel_id, interval_secs = interval.as_secs(), "Health monitoring started");
    }

    /// Stop probing a tunnel. Returns `false` if it was not monitored.
    pub fn stop_monitoring(&self, tunnel_id: &str) -> bool {
        let handle = self.lock_tasks().remove(tunnel_id);
        handle.is_some_and(|h| {
            h.abort();
            info!(tunnel_id = %tunnel_id, "Health monitoring stopped");
            true
        })
    }

    pub fn is_monitoring(&self, tunnel_id: &str) -> bool {
        self.lock_tasks()
            .get(tunnel_id)
            .is_some_and(|h| !h.is_finished())
    }

    pub fn monitored_tunnels(&self) -> Vec<String> {
        self.lock_tasks()
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn stop_all(&self) {
        let tasks: Vec<_> = self.lock_tasks().drain().collect();
        for (_, handle) in tasks {
            handle.abort();
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // =========================================================================
    // Probing
    // =========================================================================

    /// Probe every endpoint of a tunnel concurrently and persist each
    /// classification as soon as its probe completes.
    #[instrument(skip(self))]
    pub async fn check_tunnel(&self, tunnel_id: &str) -> Result<Vec<TunnelEndpoint>, HealthError> {
        let tunnel = self.db.get_tunnel(tunnel_id).await?;
        let endpoints = self
            .db
            .list_endpoints(tunnel_id)
            .await?
            .into_iter()
            .map(TunnelEndpoint::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let connected = self.router.registry().is_connected(tunnel_id).await;

        let probes = endpoints
            .into_iter()
            .map(|endpoint| self.probe_endpoint(&tunnel.user_id, endpoint, connected));
        let results = join_all(probes).await;

        let mut checked = Vec::with_capacity(results.len());
        for result in results {
            checked.push(result?);
        }
        debug!(
            tunnel_id = %tunnel_id,
            healthy = checked.iter().filter(|e| e.health_status == HealthStatus::Healthy).count(),
            total = checked.len(),
            "Health check complete"
        );
        Ok(checked)
    }

    async fn probe_endpoint(
        &self,
        user_id: &str,
        mut endpoint: TunnelEndpoint,
        connected: bool,
    ) -> Result<TunnelEndpoint, HealthError> {
        let healthy = if connected {
            match self
                .router
                .probe(&endpoint.tunnel_id, &endpoint.url, self.config.probe_timeout())
                .await
            {
                Ok(Some(status)) => (200..400).contains(&status),
                Ok(None) => false,
                Err(e) => {
                    debug!(endpoint_id = %endpoint.id, error = %e, "Probe failed");
                    false
                }
            }
        } else {
            false
        };

        let status = if healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        let now = self.clock.now_millis();
        self.db
            .set_endpoint_health(&endpoint.id, status.as_str(), now)
            .await?;
        telemetry::record_health_check(healthy);

        if endpoint.health_status != status {
            self.events.publish(WebhookEvent::endpoint_health_changed(
                user_id,
                &endpoint.tunnel_id,
                &endpoint.id,
                &endpoint.url,
                endpoint.health_status.as_str(),
                status.as_str(),
                now,
            ));
        }
        endpoint.health_status = status;
        endpoint.last_health_check_at = Some(now);
        Ok(endpoint)
    }

    /// Mark one endpoint unhealthy outside the probe cycle (after a failed
    /// proxy attempt).
    pub async fn mark_unhealthy(
        &self,
        user_id: &str,
        endpoint: &TunnelEndpoint,
    ) -> Result<(), HealthError> {
        let now = self.clock.now_millis();
        self.db
            .set_endpoint_health(&endpoint.id, HealthStatus::Unhealthy.as_str(), now)
            .await?;
        if endpoint.health_status != HealthStatus::Unhealthy {
            self.events.publish(WebhookEvent::endpoint_health_changed(
                user_id,
                &endpoint.tunnel_id,
                &endpoint.id,
                &endpoint.url,
                endpoint.health_status.as_str(),
                HealthStatus::Unhealthy.as_str(),
                now,
            ));
        }
        Ok(())
    }

    // =========================================================================
    // Metrics
    // =========================================================================

    pub fn record_request_metrics(&self, tunnel_id: &str, sample: &RequestSample) {
        self.buffer
            .record(tunnel_id, sample, self.clock.now_millis());
    }

    pub fn get_aggregated_metrics(&self, tunnel_id: &str) -> AggregatedMetrics {
        self.buffer.aggregated(tunnel_id)
    }

    /// Drop buffered metrics without persisting them (the tunnel is gone).
    pub fn discard_metrics(&self, tunnel_id: &str) {
        self.buffer.forget(tunnel_id);
    }

    /// Persist and clear a tunnel's buffered metrics. Returns `None` when
    /// there was nothing to flush, so repeated calls are harmless.
    #[instrument(skip(self))]
    pub async fn flush_metrics_to_database(
        &self,
        tunnel_id: &str,
    ) -> Result<Option<MetricsWindow>, HealthError> {
        let Some(drained) = self.buffer.drain(tunnel_id) else {
            return Ok(None);
        };

        match self
            .db
            .insert_metrics_flush(tunnel_id, &drained.to_flush_params(), self.clock.now_millis())
            .await
        {
            Ok(row) => {
                debug!(tunnel_id = %tunnel_id, requests = drained.request_count, "Metrics flushed");
                Ok(Some(MetricsWindow::from(row)))
            }
            Err(DatabaseError::NotFound(what)) => Err(HealthError::NotFound(what)),
            Err(e) => {
                self.buffer.restore(tunnel_id, &drained);
                Err(HealthError::Database(e))
            }
        }
    }

    /// Flush every tunnel with buffered metrics. Returns how many were written.
    pub async fn flush_all(&self) -> usize {
        let mut flushed = 0;
        for tunnel_id in self.buffer.tunnel_ids() {
            match self.flush_metrics_to_database(&tunnel_id).await {
                Ok(Some(_)) => flushed += 1,
                Ok(None) => {}
                Err(HealthError::NotFound(_)) => {
                    debug!(tunnel_id = %tunnel_id, "Dropping metrics for deleted tunnel");
                }
                Err(e) => warn!(tunnel_id = %tunnel_id, error = %e, "Metrics flush failed"),
            }
        }
        flushed
    }

    /// Flush all buffered metrics on a timer until shutdown, then once more.
    pub fn spawn_flush_scheduler(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(monitor.config.metrics_flush_interval());
            timer.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let flushed = monitor.flush_all().await;
                        if flushed > 0 {
                            info!(flushed, "Periodic metrics flush completed");
                        }
                    }
                    _ = shutdown.changed() => {
                        let flushed = monitor.flush_all().await;
                        info!(flushed, "Metrics flush scheduler shutting down");
                        return;
                    }
                }
            }
        })
    }

    // =========================================================================
    // Summaries
    // =========================================================================

    pub async fn get_tunnel_status_summary(
        &self,
        tunnel_id: &str,
        user_id: &str,
    ) -> Result<TunnelStatusSummary, HealthError> {
        let tunnel = Tunnel::try_from(self.db.get_tunnel_for_user(tunnel_id, user_id).await?)?;
        let endpoints = self.endpoint_health(tunnel_id).await?;
        let healthy_endpoints = endpoints
            .iter()
            .filter(|e| e.health_status == HealthStatus::Healthy)
            .count();

        Ok(TunnelStatusSummary {
            agent_connected: self.router.registry().is_connected(tunnel_id).await,
            monitoring: self.is_monitoring(tunnel_id),
            current_metrics: self.get_aggregated_metrics(tunnel_id),
            cumulative_metrics: tunnel.metrics,
            healthy_endpoints,
            total_endpoints: endpoints.len(),
            endpoints,
            tunnel_id: tunnel.id,
            status: tunnel.status,
            updated_at: tunnel.updated_at,
        })
    }

    /// Flushed metrics windows, newest first (no ownership check).
    pub async fn metrics_history(
        &self,
        tunnel_id: &str,
        limit: i64,
    ) -> Result<Vec<MetricsWindow>, HealthError> {
        Ok(self
            .db
            .list_metrics_history(tunnel_id, limit)
            .await?
            .into_iter()
            .map(MetricsWindow::from)
            .collect())
    }

    /// Stored endpoint health for a tunnel (no ownership check).
    pub async fn endpoint_health(&self, tunnel_id: &str) -> Result<Vec<TunnelEndpoint>, HealthError> {
        Ok(self
            .db
            .list_endpoints(tunnel_id)
            .await?
            .into_iter()
            .map(TunnelEndpoint::try_from)
            .collect::<Result<Vec<_>, _>>()?)
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop_all();
    }
}
