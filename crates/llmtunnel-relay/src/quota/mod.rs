//! Commercial usage accounting: monthly per-resource quotas by tier.

pub mod service;
pub mod tier;

pub use service::{QuotaError, QuotaService, QuotaStatus, QuotaSummary};
pub use tier::{QuotaConfig, ResourceType, TierQuotaLimits, UNLIMITED, month_bounds};
