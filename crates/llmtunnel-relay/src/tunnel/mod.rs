//! Tunnel records, their state machine and the service that drives them.

pub mod balancer;
pub mod config;
pub mod service;
pub mod state;
pub mod types;


pub use balancer::EndpointBalancer;
pub use config::{ConfigValidationError, TunnelConfig, TunnelConfigPatch};
pub use service::{TunnelError, TunnelService};
pub use state::{TransitionError, TunnelStatus};
pub use types::{
    ActivityEntry, EndpointSpec, HealthStatus, MetricsWindow, Tunnel, TunnelEndpoint,
    TunnelMetricsSnapshot,
};
