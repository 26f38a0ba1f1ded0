//! Frames exchanged with local agents over the `/agent/connect` WebSocket.
//!
//! Every frame is one JSON text message tagged by `type`. Frames that
//! expect an answer carry a `correlationId`; the agent echoes it back.

use serde::{Deserialize, Serialize};

use crate::tunnel::EndpointSpec;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    /// Agent -> relay, first frame of a session.
    Register { endpoints: Vec<EndpointSpec> },
    /// Relay -> agent, acknowledges `Register`.
    #[serde(rename_all = "camelCase")]
    Registered { tunnel_id: String },
    /// Relay -> agent, forward an HTTP request to a local endpoint.
    #[serde(rename_all = "camelCase")]
    Request {
        correlation_id: String,
        endpoint_url: String,
        request: ProxyRequest,
    },
    /// Agent -> relay, answer to `Request`.
    #[serde(rename_all = "camelCase")]
    Response {
        correlation_id: String,
        response: ProxyResponse,
    },
    /// Relay -> agent, health-probe a local endpoint.
    #[serde(rename_all = "camelCase")]
    Probe {
        correlation_id: String,
        endpoint_url: String,
        timeout_ms: u64,
    },
    /// Agent -> relay, answer to `Probe`. `status` is absent if the
    /// endpoint could not be reached at all.
    #[serde(rename_all = "camelCase")]
    ProbeResult {
        correlation_id: String,
        #[serde(default)]
        status: Option<u16>,
        #[serde(default)]
        error: Option<String>,
    },
    /// Agent -> relay, the request or probe could not be carried out.
    #[serde(rename_all = "camelCase")]
    Error {
        correlation_id: String,
        message: String,
    },
    Ping,
    Pong,
}

impl AgentFrame {
    /// Correlation ID for frames that answer a pending relay request.
    pub fn reply_correlation_id(&self) -> Option<&str> {
        match self {
            Self::Response { correlation_id, .. }
            | Self::ProbeResult { correlation_id, .. }
            | Self::Error { correlation_id, .. } => Some(correlation_id),
            _ => None,
        }
    }
}

/// HTTP request relayed to a local endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub method: String,
    /// Path and query relative to the endpoint URL.
    pub path: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

/// HTTP response produced by a local endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
