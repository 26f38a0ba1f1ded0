//! Request router that forwards requests and probes through agent sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::warn;

use crate::registry::{AgentFrame, AgentRegistry, ProxyRequest, ProxyResponse};

/// Routes requests and health probes to the agent serving a tunnel.
#[derive(Clone)]
pub struct AgentRouter {
    registry: Arc<AgentRegistry>,
}

impl AgentRouter {
    pub const fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }

    pub const fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Forward a request to one endpoint behind a tunnel and wait for the
    /// response, at most `request_timeout`.
    pub async fn forward_request(
        &self,
        tunnel_id: &str,
        endpoint_url: &str,
        request: ProxyRequest,
        request_timeout: Duration,
    ) -> Result<ProxyResponse, RouterError> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let frame = AgentFrame::Request {
            correlation_id: correlation_id.clone(),
            endpoint_url: endpoint_url.to_string(),
            request,
        };

        match self
            .round_trip(tunnel_id, &correlation_id, frame, request_timeout)
            .await?
        {
            AgentFrame::Response { response, .. } => Ok(response),
            AgentFrame::Error { message, .. } => Err(RouterError::Agent(message)),
            other => Err(RouterError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    /// Ask the agent to probe an endpoint. Returns the HTTP status the
    /// endpoint answered with, or `None` if it was unreachable.
    pub async fn probe(
        &self,
        tunnel_id: &str,
        endpoint_url: &str,
        probe_timeout: Duration,
    ) -> Result<Option<u16>, RouterError> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        #[allow(clippy::cast_possible_truncation)]
        let frame = AgentFrame::Probe {
            correlation_id: correlation_id.clone(),
            endpoint_url: endpoint_url.to_string(),
            timeout_ms: probe_timeout.as_millis() as u64,
        };

        match self
            .round_trip(tunnel_id, &correlation_id, frame, probe_timeout)
            .await?
        {
            AgentFrame::ProbeResult { status, .. } => Ok(status),
            AgentFrame::Error { .. } => Ok(None),
            other => Err(RouterError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    async fn round_trip(
        &self,
        tunnel_id: &str,
        correlation_id: &str,
        frame: AgentFrame,
        wait: Duration,
    ) -> Result<AgentFrame, RouterError> {
        let conn = self
            .registry
            .get(tunnel_id)
            .await
            .ok_or_else(|| RouterError::NotConnected(tunnel_id.to_string()))?;

        // Register pending response before sending
        let reply_rx = conn.register_pending(correlation_id.to_string()).await;

        // The deadline covers queueing the frame as well as the reply, so a
        // stalled writer cannot stretch a request past `wait`.
        let exchange = async {
            conn.send_frame(frame)
                .await
                .map_err(|_| RouterError::SendFailed(tunnel_id.to_string()))?;
            reply_rx
                .await
                .map_err(|_| RouterError::ResponseDropped(correlation_id.to_string()))
        };

        match timeout(wait, exchange).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                conn.drop_pending(correlation_id).await;
                Err(e)
            }
            Err(_) => {
                conn.drop_pending(correlation_id).await;
                warn!(
                    tunnel_id = %tunnel_id,
                    correlation_id = %correlation_id,
                    "Agent request timed out"
                );
                Err(RouterError::Timeout(correlation_id.to_string()))
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("No agent connected for tunnel: {0}")]
    NotConnected(String),

    #[error("Failed to send to agent: {0}")]
    SendFailed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Response channel dropped: {0}")]
    ResponseDropped(String),

    #[error("Agent reported an error: {0}")]
    Agent(String),

    #[error("Unexpected reply from agent: {0}")]
    UnexpectedReply(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn get_request() -> ProxyRequest {
        ProxyRequest {
            method: "GET".into(),
            path: "/v1/models".into(),
            headers: vec![],
            body: vec![],
        }
    }

    #[tokio::test]
    async fn forward_request_to_connected_agent() {
        let registry = Arc::new(AgentRegistry::new());
        let (tx, mut rx) = mpsc::channel(16);
        registry.register("t1".into(), "u1".into(), tx).await;
        let router = AgentRouter::new(Arc::clone(&registry));

        // Spawn responder that echoes the path back
        let reg_clone = Arc::clone(&registry);
        tokio::spawn(async move {
            if let Some(AgentFrame::Request {
                correlation_id,
                request,
                ..
            }) = rx.recv().await
            {
                let conn = reg_clone.get("t1").await.unwrap();
                let response = AgentFrame::Response {
                    correlation_id: correlation_id.clone(),
                    response: ProxyResponse {
                        status: 200,
                        headers: vec![],
                        body: request.path.into_bytes(),
                    },
                };
                conn.complete_pending(&correlation_id, response).await;
            }
        });

        let response = router
            .forward_request("t1", "http://localhost:8080", get_request(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"/v1/models");
    }

    #[tokio::test]
    async fn forward_without_agent_fails() {
        let router = AgentRouter::new(Arc::new(AgentRegistry::new()));
        let result = router
            .forward_request("t1", "http://x", get_request(), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(RouterError::NotConnected(_))));
    }

    #[tokio::test]
    async fn forward_request_timeout() {
        let registry = Arc::new(AgentRegistry::new());
        let (tx, _rx) = mpsc::channel(16);
        let conn = registry.register("t1".into(), "u1".into(), tx).await;
        let router = AgentRouter::new(Arc::clone(&registry));

        let result = router
            .forward_request("t1", "http://x", get_request(), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(RouterError::Timeout(_))));
        assert_eq!(conn.pending_count().await, 0);
    }

    #[tokio::test]
    async fn full_outbound_queue_counts_against_timeout() {
        let registry = Arc::new(AgentRegistry::new());
        let (tx, _rx) = mpsc::channel(1);
        let conn = registry.register("t1".into(), "u1".into(), tx).await;
        conn.send_frame(AgentFrame::Ping).await.unwrap();
        let router = AgentRouter::new(Arc::clone(&registry));

        let started = tokio::time::Instant::now();
        let result = router
            .forward_request("t1", "http://x", get_request(), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(RouterError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(conn.pending_count().await, 0);
    }

    #[tokio::test]
    async fn agent_error_is_surfaced() {
        let registry = Arc::new(AgentRegistry::new());
        let (tx, mut rx) = mpsc::channel(16);
        registry.register("t1".into(), "u1".into(), tx).await;
        let router = AgentRouter::new(Arc::clone(&registry));

        let reg_clone = Arc::clone(&registry);
        tokio::spawn(async move {
            if let Some(AgentFrame::Request { correlation_id, .. }) = rx.recv().await {
                let conn = reg_clone.get("t1").await.unwrap();
                let reply = AgentFrame::Error {
                    correlation_id: correlation_id.clone(),
                    message: "connection refused".into(),
                };
                conn.complete_pending(&correlation_id, reply).await;
            }
        });

        let result = router
            .forward_request("t1", "http://x", get_request(), Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(RouterError::Agent(m)) if m == "connection refused"));
    }

    #[tokio::test]
    async fn probe_reports_status_or_unreachable() {
        let registry = Arc::new(AgentRegistry::new());
        let (tx, mut rx) = mpsc::channel(16);
        registry.register("t1".into(), "u1".into(), tx).await;
        let router = AgentRouter::new(Arc::clone(&registry));

        let reg_clone = Arc::clone(&registry);
        tokio::spawn(async move {
            while let Some(AgentFrame::Probe {
                correlation_id,
                endpoint_url,
                ..
            }) = rx.recv().await
            {
                let conn = reg_clone.get("t1").await.unwrap();
                let status = (endpoint_url == "http://up").then_some(204);
                let reply = AgentFrame::ProbeResult {
                    correlation_id: correlation_id.clone(),
                    status,
                    error: None,
                };
                conn.complete_pending(&correlation_id, reply).await;
            }
        });

        let up = router
            .probe("t1", "http://up", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(up, Some(204));
        let down = router
            .probe("t1", "http://down", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(down, None);
    }
}
