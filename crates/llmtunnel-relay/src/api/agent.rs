//! `GET /agent/connect`: the WebSocket a desktop agent keeps open.
//!
//! The agent authenticates with its bearer token on the upgrade request,
//! then must send a `register` frame listing its endpoints. After the relay
//! answers `registered`, frames flow both ways until either side closes.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::response::Response;
use futures_util::stream::SplitStream;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::AppState;
use super::extract::AuthUser;
use crate::auth::Claims;
use crate::registry::{AgentConnection, AgentFrame};
use crate::tunnel::EndpointSpec;

const FRAME_QUEUE: usize = 128;

pub async fn connect(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| run_session(socket, state, claims))
}

async fn run_session(socket: WebSocket, state: AppState, claims: Claims) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let register_timeout = state.tunnels.config().register_timeout();

    let endpoints = match await_register(&mut ws_rx, register_timeout).await {
        Ok(endpoints) => endpoints,
        Err(reason) => {
            warn!(user_id = %claims.sub, reason = %reason, "Agent registration failed");
            let _ = ws_tx.send(close(close_code::POLICY, &reason)).await;
            return;
        }
    };

    let (frame_tx, mut frame_rx) = mpsc::channel::<AgentFrame>(FRAME_QUEUE);
    let (tunnel, conn) = match state
        .tunnels
        .agent_connected(claims.user_id(), claims.tier, &endpoints, frame_tx)
        .await
    {
        Ok(bound) => bound,
        Err(e) => {
            warn!(user_id = %claims.sub, error = %e, "Agent session rejected");
            let _ = ws_tx.send(close(close_code::POLICY, &e.to_string())).await;
            return;
        }
    };

    let registered = AgentFrame::Registered {
        tunnel_id: tunnel.id.clone(),
    };
    if let Err(e) = send_frame(&mut ws_tx, &registered).await {
        error!(tunnel_id = %tunnel.id, error = %e, "Failed to acknowledge agent registration");
        disconnect(&state, &conn, "registration acknowledgement failed").await;
        return;
    }
    info!(tunnel_id = %tunnel.id, user_id = %claims.sub, endpoints = endpoints.len(), "Agent session established");

    let tx_task = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if send_frame(&mut ws_tx, &frame).await.is_err() {
                break;
            }
        }
    });

    let reason = loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<AgentFrame>(text.as_str()) {
                Ok(frame) => {
                    if let Some(reply) = handle_frame(&conn, frame).await {
                        if let Err(reason) = queue_reply(&conn, reply) {
                            break reason;
                        }
                    }
                }
                Err(e) => {
                    warn!(tunnel_id = %conn.tunnel_id, error = %e, "Invalid frame from agent");
                }
            },
            Some(Ok(Message::Close(_))) | None => break "closed by agent",
            Some(Ok(Message::Binary(_))) => {
                warn!(tunnel_id = %conn.tunnel_id, "Ignoring binary frame from agent");
            }
            // Transport-level ping/pong is answered by axum.
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Err(e)) => {
                warn!(tunnel_id = %conn.tunnel_id, error = %e, "Agent socket error");
                break "socket error";
            }
        }
    };

    tx_task.abort();
    disconnect(&state, &conn, reason).await;
}

/// Apply one inbound frame. Returns a frame to send back, if any.
pub async fn handle_frame(conn: &AgentConnection, frame: AgentFrame) -> Option<AgentFrame> {
    if let Some(correlation_id) = frame.reply_correlation_id().map(str::to_string) {
        if !conn.complete_pending(&correlation_id, frame).await {
            debug!(
                tunnel_id = %conn.tunnel_id,
                correlation_id = %correlation_id,
                "Reply for unknown or expired request"
            );
        }
        return None;
    }
    match frame {
        AgentFrame::Ping => Some(AgentFrame::Pong),
        AgentFrame::Pong => None,
        AgentFrame::Register { .. } => {
            warn!(tunnel_id = %conn.tunnel_id, "Agent re-sent register on a live session");
            None
        }
        other => {
            debug!(tunnel_id = %conn.tunnel_id, frame = ?other, "Unexpected frame from agent");
            None
        }
    }
}

/// Queue a reply without waiting on the writer. A reply that finds the
/// queue full is dropped; the agent's next ping gets a fresh one.
fn queue_reply(conn: &AgentConnection, reply: AgentFrame) -> Result<(), &'static str> {
    match conn.try_send_frame(reply) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(frame)) => {
            debug!(tunnel_id = %conn.tunnel_id, frame = ?frame, "Outbound queue full, dropping reply");
            Ok(())
        }
        Err(mpsc::error::TrySendError::Closed(_)) => Err("outbound queue closed"),
    }
}

async fn await_register(
    ws_rx: &mut SplitStream<WebSocket>,
    timeout: Duration,
) -> Result<Vec<EndpointSpec>, String> {
    let message = tokio::time::timeout(timeout, ws_rx.next())
        .await
        .map_err(|_| "registration timeout".to_string())?
        .ok_or_else(|| "connection closed before registration".to_string())?
        .map_err(|e| format!("socket error: {e}"))?;

    let Message::Text(text) = message else {
        return Err("expected a text register frame".into());
    };
    match serde_json::from_str::<AgentFrame>(text.as_str()) {
        Ok(AgentFrame::Register { endpoints }) => Ok(endpoints),
        Ok(_) => Err("first frame must be register".into()),
        Err(e) => Err(format!("invalid register frame: {e}")),
    }
}

async fn send_frame<S>(ws_tx: &mut S, frame: &AgentFrame) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = serde_json::to_string(frame).map_err(|e| e.to_string())?;
    ws_tx
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| e.to_string())
}

async fn disconnect(state: &AppState, conn: &Arc<AgentConnection>, reason: &str) {
    match state
        .tunnels
        .agent_disconnected(&conn.tunnel_id, &conn.session_id, reason)
        .await
    {
        Ok(true) => info!(tunnel_id = %conn.tunnel_id, reason, "Agent session ended"),
        Ok(false) => debug!(tunnel_id = %conn.tunnel_id, "Agent session already replaced"),
        Err(e) => error!(tunnel_id = %conn.tunnel_id, error = %e, "Failed to record agent disconnect"),
    }
}

fn close(code: u16, reason: &str) -> Message {
    // Close reasons are limited to 123 bytes.
    let reason: String = reason.chars().take(100).collect();
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}
