//! In-memory registry of live agent sessions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{info, warn};

use super::protocol::AgentFrame;

/// One live agent session for a tunnel.
pub struct AgentConnection {
    /// Tunnel this session serves.
    pub tunnel_id: String,
    /// User who owns the tunnel.
    pub user_id: String,
    /// Unique per session so a stale session cannot unregister its successor.
    pub session_id: String,
    /// Sender for pushing frames to the agent.
    pub frame_tx: mpsc::Sender<AgentFrame>,
    /// Pending response waiters keyed by correlation ID.
    pub pending: Arc<RwLock<HashMap<String, oneshot::Sender<AgentFrame>>>>,
}

impl AgentConnection {
    pub fn new(tunnel_id: String, user_id: String, frame_tx: mpsc::Sender<AgentFrame>) -> Self {
        Self {
            tunnel_id,
            user_id,
            session_id: uuid::Uuid::new_v4().to_string(),
            frame_tx,
            pending: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Send a frame to the agent.
    pub async fn send_frame(
        &self,
        frame: AgentFrame,
    ) -> Result<(), mpsc::error::SendError<AgentFrame>> {
        self.frame_tx.send(frame).await
    }

    /// Queue a frame only if the outbound queue has room.
    pub fn try_send_frame(
        &self,
        frame: AgentFrame,
    ) -> Result<(), mpsc::error::TrySendError<AgentFrame>> {
        self.frame_tx.try_send(frame)
    }

    /// Register a pending request and return a receiver for the reply.
    pub async fn register_pending(&self, correlation_id: String) -> oneshot::Receiver<AgentFrame> {
        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(correlation_id, tx);
        rx
    }

    /// Complete a pending request with the agent's reply.
    pub async fn complete_pending(&self, correlation_id: &str, frame: AgentFrame) -> bool {
        if let Some(tx) = self.pending.write().await.remove(correlation_id) {
            tx.send(frame).is_ok()
        } else {
            false
        }
    }

    /// Forget a pending request (after a timeout).
    pub async fn drop_pending(&self, correlation_id: &str) {
        self.pending.write().await.remove(correlation_id);
    }

    /// Cancel all pending requests. Waiters observe a dropped channel.
    pub async fn cancel_all_pending(&self) {
        self.pending.write().await.clear();
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }
}

impl fmt::Debug for AgentConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `None` while a writer holds the pending table.
        let pending = self.pending.try_read().map(|p| p.len()).ok();
        f.debug_struct("AgentConnection")
            .field("tunnel_id", &self.tunnel_id)
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("pending", &pending)
            .finish_non_exhaustive()
    }
}

/// Thread-safe registry of live agent sessions, keyed by tunnel ID.
#[derive(Clone)]
pub struct AgentRegistry {
    connections: Arc<RwLock<HashMap<String, Arc<AgentConnection>>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a session for a tunnel, replacing any previous one.
    pub async fn register(
        &self,
        tunnel_id: String,
        user_id: String,
        frame_tx: mpsc::Sender<AgentFrame>,
    ) -> Arc<AgentConnection> {
        let conn = Arc::new(AgentConnection::new(tunnel_id.clone(), user_id, frame_tx));
        let previous = self
            .connections
            .write()
            .await
            .insert(tunnel_id.clone(), Arc::clone(&conn));
        if let Some(previous) = previous {
            previous.cancel_all_pending().await;
            warn!(tunnel_id = %tunnel_id, "Agent session replaced by a new connection");
        }
        info!(tunnel_id = %tunnel_id, session_id = %conn.session_id, "Agent connection registered");
        conn
    }

    /// Remove the session for a tunnel if it is still `session_id`.
    pub async fn unregister(
        &self,
        tunnel_id: &str,
        session_id: &str,
    ) -> Option<Arc<AgentConnection>> {
        let mut connections = self.connections.write().await;
        let current = connections
            .get(tunnel_id)
            .is_some_and(|c| c.session_id == session_id);
        if !current {
            warn!(tunnel_id = %tunnel_id, session_id = %session_id, "Tried to unregister stale or unknown session");
            return None;
        }
        let conn = connections.remove(tunnel_id);
        drop(connections);
        if let Some(ref conn) = conn {
            conn.cancel_all_pending().await;
            info!(tunnel_id = %tunnel_id, "Agent connection unregistered");
        }
        conn
    }

    /// Remove whatever session a tunnel has.
    pub async fn remove(&self, tunnel_id: &str) -> Option<Arc<AgentConnection>> {
        let conn = self.connections.write().await.remove(tunnel_id);
        if let Some(ref conn) = conn {
            conn.cancel_all_pending().await;
        }
        conn
    }

    pub async fn get(&self, tunnel_id: &str) -> Option<Arc<AgentConnection>> {
        self.connections.read().await.get(tunnel_id).cloned()
    }

    pub async fn is_connected(&self, tunnel_id: &str) -> bool {
        self.connections.read().await.contains_key(tunnel_id)
    }

    pub async fn connected_tunnels(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
