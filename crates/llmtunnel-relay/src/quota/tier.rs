//! Resource types, per-tier limits and quota period arithmetic.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::Tier;

/// Limit value meaning "no limit".
pub const UNLIMITED: i64 = -1;

const GIB: i64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    ApiRequests,
    /// Bytes, request plus response bodies.
    DataTransfer,
    ConcurrentConnections,
    TunnelCount,
}

impl ResourceType {
    pub const ALL: [Self; 4] = [
        Self::ApiRequests,
        Self::DataTransfer,
        Self::ConcurrentConnections,
        Self::TunnelCount,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ApiRequests => "api_requests",
            Self::DataTransfer => "data_transfer",
            Self::ConcurrentConnections => "concurrent_connections",
            Self::TunnelCount => "tunnel_count",
        }
    }
    /// Usage is the number of records the user holds right now rather than
    /// a running total for the period.
    pub const fn is_live_count(self) -> bool {
        matches!(self, Self::TunnelCount)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Path segments arrive in either casing.
        match s {
            "api_requests" | "apiRequests" => Ok(Self::ApiRequests),
            "data_transfer" | "dataTransfer" => Ok(Self::DataTransfer),
            "concurrent_connections" | "concurrentConnections" => {
                Ok(Self::ConcurrentConnections)
            }
            "tunnel_count" | "tunnelCount" => Ok(Self::TunnelCount),
            other => Err(format!("unknown resource type: {other}")),
        }
    }
}

/// Monthly limits for one tier. `-1` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierQuotaLimits {
    pub api_requests: i64,
    pub data_transfer: i64,
    pub concurrent_connections: i64,
    pub tunnel_count: i64,
}

impl TierQuotaLimits {
    pub const fn unlimited() -> Self {
        Self {
            api_requests: UNLIMITED,
            data_transfer: UNLIMITED,
            concurrent_connections: UNLIMITED,
            tunnel_count: UNLIMITED,
        }
    }

    pub const fn limit(&self, resource: ResourceType) -> i64 {
        match resource {
            ResourceType::ApiRequests => self.api_requests,
            ResourceType::DataTransfer => self.data_transfer,
            ResourceType::ConcurrentConnections => self.concurrent_connections,
            ResourceType::TunnelCount => self.tunnel_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub free: TierQuotaLimits,
    pub premium: TierQuotaLimits,
    pub enterprise: TierQuotaLimits,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            free: TierQuotaLimits {
                api_requests: 10_000,
                data_transfer: GIB,
                concurrent_connections: 2,
                tunnel_count: 1,
            },
            premium: TierQuotaLimits {
                api_requests: 100_000,
                data_transfer: 50 * GIB,
                concurrent_connections: 10,
                tunnel_count: 5,
            },
            enterprise: TierQuotaLimits::unlimited(),
        }
    }
}

impl QuotaConfig {
    pub const fn for_tier(&self, tier: Tier) -> &TierQuotaLimits {
        match tier {
            Tier::Free => &self.free,
            Tier::Premium => &self.premium,
            Tier::Enterprise => &self.enterprise,
        }
    }

    pub const fn limit(&self, tier: Tier, resource: ResourceType) -> i64 {
        self.for_tier(tier).limit(resource)
    }
}

/// Start (inclusive) and end (exclusive) of the UTC calendar month that
/// contains `now_ms`, in milliseconds.
pub fn month_bounds(now_ms: i64) -> (i64, i64) {
    let fallback = (now_ms, now_ms + 31 * 24 * 3600 * 1000);
    let Some(now) = DateTime::<Utc>::from_timestamp_millis(now_ms) else {
        return fallback;
    };
    let (year, month) = (now.year(), now.month());
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let start = NaiveDate::from_ymd_opt(year, month, 1).and_then(|d| d.and_hms_opt(0, 0, 0));
    let end =
        NaiveDate::from_ymd_opt(next_year, next_month, 1).and_then(|d| d.and_hms_opt(0, 0, 0));
    match (start, end) {
        (Some(start), Some(end)) => (
            start.and_utc().timestamp_millis(),
            end.and_utc().timestamp_millis(),
        ),
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_type_parses_both_casings() {
        assert_eq!("api_requests".parse::<ResourceType>(), Ok(ResourceType::ApiRequests));
        assert_eq!("dataTransfer".parse::<ResourceType>(), Ok(ResourceType::DataTransfer));
        assert!("bandwidth".parse::<ResourceType>().is_err());
        for resource in ResourceType::ALL {
            assert_eq!(resource.as_str().parse::<ResourceType>(), Ok(resource));
        }
    }

    #[test]
    fn enterprise_is_unlimited() {
        let config = QuotaConfig::default();
        for resource in ResourceType::ALL {
            assert_eq!(config.limit(Tier::Enterprise, resource), UNLIMITED);
        }
        assert_eq!(config.limit(Tier::Free, ResourceType::ApiRequests), 10_000);
        assert_eq!(config.limit(Tier::Premium, ResourceType::TunnelCount), 5);
    }

    #[test]
    fn month_bounds_cover_calendar_month() {
        // 2024-02-15T12:26:40Z
        let (start, end) = month_bounds(1_708_000_000_000);
        assert_eq!(start, 1_706_745_600_000); // 2024-02-01
        assert_eq!(end, 1_709_251_200_000); // 2024-03-01
    }

    #[test]
    fn december_rolls_into_next_year() {
        // 2023-12-31T23:59:59Z
        let (start, end) = month_bounds(1_704_067_199_000);
        assert_eq!(start, 1_701_388_800_000); // 2023-12-01
        assert_eq!(end, 1_704_067_200_000); // 2024-01-01
    }

    #[test]
    fn bounds_are_half_open() {
        let (start, end) = month_bounds(1_706_745_600_000);
        assert_eq!(start, 1_706_745_600_000);
        let (next_start, _) = month_bounds(end);
        assert_eq!(next_start, end);
    }
}
