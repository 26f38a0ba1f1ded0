//! Request routing through agent sessions.

pub mod forwarder;

pub use forwarder::{AgentRouter, RouterError};
