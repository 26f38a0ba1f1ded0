//! Live agent sessions and the frames exchanged with them.

pub mod connection;
pub mod protocol;

pub use connection::{AgentConnection, AgentRegistry};
pub use protocol::{AgentFrame, ProxyRequest, ProxyResponse};
