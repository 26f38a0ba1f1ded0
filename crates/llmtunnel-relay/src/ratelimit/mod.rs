//! Admission control: per-user and per-IP rate limiting with exemptions.

pub mod config;
pub mod exemption;
pub mod limiter;
pub mod report;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod limiter_tests;

pub use config::{LimitSpec, RateLimitConfig};
pub use exemption::{ExemptionEngine, ExemptionError, ExemptionGrant, ExemptionRule, ExemptionType};
pub use limiter::{
    Admission, Block, ConcurrencyPermit, LimitScope, RateLimitDecision, RateLimiter,
    RequestContext, ViolationType,
};
pub use report::{
    DashboardData, DecisionOutcome, IpViolationEntry, RateLimitSummary, TimelineBucket,
    ViolationReporter, ViolatorEntry,
};
