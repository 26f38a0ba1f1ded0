//! Endpoint health probing and request metrics aggregation.

pub mod buffer;
pub mod monitor;


pub use buffer::{AggregatedMetrics, BufferedMetrics, MetricsBuffer, RequestSample};
pub use monitor::{HealthError, HealthMonitor, TunnelStatusSummary};
