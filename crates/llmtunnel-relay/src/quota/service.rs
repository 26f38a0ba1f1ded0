//! Quota accounting service.
//!
//! Usage only ever increases within a period. Every increment runs in one
//! database transaction, so concurrent requests from the same user cannot
//! lose updates, and the increment that first crosses the limit is the only
//! one that emits a `quota.exceeded` event.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use llmtunnel_core::Clock;

use super::tier::{QuotaConfig, ResourceType, UNLIMITED, month_bounds};
use crate::auth::Tier;
use crate::storage::{
    DatabaseError, QuotaRow, QuotaUsageParams, RelayDatabase, percentage_used,
};
use crate::telemetry;
use crate::webhook::event::{EventPublisher, QUOTA_EXCEEDED, WebhookEvent};

#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("Invalid quota request: {0}")]
    Validation(String),

    #[error("Quota exceeded for {resource}")]
    Exceeded {
        resource: ResourceType,
        /// Time until the current period ends.
        retry_after: Duration,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Usage of one resource in one period.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatus {
    pub resource_type: ResourceType,
    pub tier: String,
    pub current_usage: i64,
    /// `-1` when unlimited.
    pub limit: i64,
    pub unlimited: bool,
    pub remaining: Option<i64>,
    pub percentage_used: Option<f64>,
    pub exceeded: bool,
    pub exceeded_at: Option<i64>,
    pub period_start: i64,
    pub period_end: i64,
}

impl QuotaStatus {
    fn from_row(resource_type: ResourceType, row: &QuotaRow) -> Self {
        Self::build(
            resource_type,
            &row.tier,
            row.current_usage,
            row.limit_value,
            row.exceeded_at,
            row.period_start,
            row.period_end,
        )
    }

    fn build(
        resource_type: ResourceType,
        tier: &str,
        current_usage: i64,
        limit: i64,
        exceeded_at: Option<i64>,
        period_start: i64,
        period_end: i64,
    ) -> Self {
        let unlimited = limit == UNLIMITED;
        Self {
            resource_type,
            tier: tier.to_string(),
            current_usage,
            limit,
            unlimited,
            remaining: (!unlimited).then(|| (limit - current_usage).max(0)),
            percentage_used: percentage_used(current_usage, limit),
            exceeded: exceeded_at.is_some(),
            exceeded_at,
            period_start,
            period_end,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSummary {
    pub user_id: String,
    pub tier: Tier,
    pub period_start: i64,
    pub period_end: i64,
    pub any_exceeded: bool,
    pub quotas: Vec<QuotaStatus>,
}

pub struct QuotaService {
    db: RelayDatabase,
    config: QuotaConfig,
    clock: Arc<dyn Clock>,
    events: EventPublisher,
}

impl QuotaService {
    pub fn new(
        db: RelayDatabase,
        config: QuotaConfig,
        clock: Arc<dyn Clock>,
        events: EventPublisher,
    ) -> Self {
        Self {
            db,
            config,
            clock,
            events,
        }
    }

    pub const fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Add `delta` to the current period's usage, opening the period with
    /// the tier's limit if this is its first use.
    #[instrument(skip(self))]
    pub async fn record_usage(
        &self,
        user_id: &str,
        tier: Tier,
        resource: ResourceType,
        delta: i64,
    ) -> Result<QuotaStatus, QuotaError> {
        if delta < 0 {
            return Err(QuotaError::Validation(format!(
                "usage delta must not be negative, got {delta}"
            )));
        }
        if resource.is_live_count() {
            return Err(live_count_error(resource));
        }
        let now = self.clock.now_millis();
        let (period_start, period_end) = month_bounds(now);
        let new_id = uuid::Uuid::new_v4().to_string();
        let record = self
            .db
            .record_quota_usage(&QuotaUsageParams {
                new_id: &new_id,
                user_id,
                resource_type: resource.as_str(),
                tier: tier.as_str(),
                period_start,
                period_end,
                limit_value: self.config.limit(tier, resource),
                delta,
                now,
            })
            .await?;

        if record.crossed {
            warn!(
                user_id,
                resource_type = resource.as_str(),
                usage = record.quota.current_usage,
                limit = record.quota.limit_value,
                "Quota exceeded"
            );
            telemetry::record_quota_exceeded(resource.as_str());
            self.events.publish(WebhookEvent::new(
                QUOTA_EXCEEDED,
                user_id,
                None,
                now,
                json!({
                    "resourceType": resource.as_str(),
                    "currentUsage": record.quota.current_usage,
                    "limit": record.quota.limit_value,
                    "periodStart": record.quota.period_start,
                    "periodEnd": record.quota.period_end,
                }),
            ));
        }
        Ok(QuotaStatus::from_row(resource, &record.quota))
    }

    /// Whether the current period has already gone over its limit.
    pub async fn is_exceeded(
        &self,
        user_id: &str,
        resource: ResourceType,
    ) -> Result<bool, QuotaError> {
        let now = self.clock.now_millis();
        Ok(self
            .db
            .get_current_quota(user_id, resource.as_str(), now)
            .await?
            .is_some_and(|q| q.exceeded_at.is_some()))
    }

    /// Fail with `Exceeded` if the resource's quota is already spent.
    pub async fn check(&self, user_id: &str, resource: ResourceType) -> Result<(), QuotaError> {
        let now = self.clock.now_millis();
        let Some(quota) = self
            .db
            .get_current_quota(user_id, resource.as_str(), now)
            .await?
        else {
            return Ok(());
        };
        if quota.exceeded_at.is_some() {
            return Err(exceeded(resource, quota.period_end, now));
        }
        Ok(())
    }

    /// Fail with `Exceeded` if adding `delta` would take usage over the
    /// limit. Used for countable resources where going over is not allowed
    /// at all, such as tunnel creation.
    ///
    /// Live-count resources are measured against what the user holds now,
    /// so deleting a tunnel frees its slot immediately and the error
    /// carries no retry delay.
    pub async fn ensure_headroom(
        &self,
        user_id: &str,
        tier: Tier,
        resource: ResourceType,
        delta: i64,
    ) -> Result<(), QuotaError> {
        let now = self.clock.now_millis();
        if resource.is_live_count() {
            let limit = self.config.limit(tier, resource);
            let live = self.live_usage(user_id, resource).await?;
            if limit != UNLIMITED && live + delta > limit {
                return Err(QuotaError::Exceeded {
                    resource,
                    retry_after: Duration::ZERO,
                });
            }
            return Ok(());
        }
        let current = self
            .db
            .get_current_quota(user_id, resource.as_str(), now)
            .await?;
        let (usage, limit, period_end) = match &current {
            Some(q) => (q.current_usage, q.limit_value, q.period_end),
            None => (0, self.config.limit(tier, resource), month_bounds(now).1),
        };
        if limit != UNLIMITED && usage + delta > limit {
            return Err(exceeded(resource, period_end, now));
        }
        Ok(())
    }

    /// Current period status. A resource never used this period reports
    /// zero usage against the tier's limit.
    pub async fn get_quota(
        &self,
        user_id: &str,
        tier: Tier,
        resource: ResourceType,
    ) -> Result<QuotaStatus, QuotaError> {
        let now = self.clock.now_millis();
        if resource.is_live_count() {
            let (start, end) = month_bounds(now);
            let live = self.live_usage(user_id, resource).await?;
            return Ok(QuotaStatus::build(
                resource,
                tier.as_str(),
                live,
                self.config.limit(tier, resource),
                None,
                start,
                end,
            ));
        }
        let current = self
            .db
            .get_current_quota(user_id, resource.as_str(), now)
            .await?;
        Ok(current.map_or_else(
            || {
                let (start, end) = month_bounds(now);
                QuotaStatus::build(
                    resource,
                    tier.as_str(),
                    0,
                    self.config.limit(tier, resource),
                    None,
                    start,
                    end,
                )
            },
            |row| QuotaStatus::from_row(resource, &row),
        ))
    }

    pub async fn list_quotas(
        &self,
        user_id: &str,
        tier: Tier,
    ) -> Result<Vec<QuotaStatus>, QuotaError> {
        let mut quotas = Vec::with_capacity(ResourceType::ALL.len());
        for resource in ResourceType::ALL {
            quotas.push(self.get_quota(user_id, tier, resource).await?);
        }
        Ok(quotas)
    }

    pub async fn summary(&self, user_id: &str, tier: Tier) -> Result<QuotaSummary, QuotaError> {
        let quotas = self.list_quotas(user_id, tier).await?;
        let (period_start, period_end) = month_bounds(self.clock.now_millis());
        Ok(QuotaSummary {
            user_id: user_id.to_string(),
            tier,
            period_start,
            period_end,
            any_exceeded: quotas.iter().any(|q| q.exceeded),
            quotas,
        })
    }

    /// Period rows for a resource, newest first.
    pub async fn history(
        &self,
        user_id: &str,
        resource: ResourceType,
        limit: i64,
    ) -> Result<Vec<QuotaStatus>, QuotaError> {
        let rows = self
            .db
            .list_quota_history(user_id, resource.as_str(), limit.clamp(1, 120))
            .await?;
        Ok(rows
            .iter()
            .map(|row| QuotaStatus::from_row(resource, row))
            .collect())
    }

    async fn live_usage(&self, user_id: &str, resource: ResourceType) -> Result<i64, QuotaError> {
        debug_assert!(resource.is_live_count());
        Ok(self.db.count_tunnels(user_id).await?)
    }

    /// Close the current period now and open a fresh one through the end of
    /// the month. The closed row keeps its final usage.
    #[instrument(skip(self))]
    pub async fn reset(
        &self,
        user_id: &str,
        tier: Tier,
        resource: ResourceType,
    ) -> Result<QuotaStatus, QuotaError> {
        if resource.is_live_count() {
            return Err(live_count_error(resource));
        }
        let now = self.clock.now_millis();
        let (_, period_end) = month_bounds(now);
        let new_id = uuid::Uuid::new_v4().to_string();
        let row = self
            .db
            .reset_quota(&QuotaUsageParams {
                new_id: &new_id,
                user_id,
                resource_type: resource.as_str(),
                tier: tier.as_str(),
                period_start: now,
                period_end,
                limit_value: self.config.limit(tier, resource),
                delta: 0,
                now,
            })
            .await?;
        info!(user_id, resource_type = resource.as_str(), "Quota reset");
        Ok(QuotaStatus::from_row(resource, &row))
    }
}

#[allow(clippy::cast_sign_loss)]
fn live_count_error(resource: ResourceType) -> QuotaError {
    QuotaError::Validation(format!(
        "{resource} follows the records the user holds and has no usage counter"
    ))
}

fn exceeded(resource: ResourceType, period_end: i64, now: i64) -> QuotaError {
    QuotaError::Exceeded {
        resource,
        retry_after: Duration::from_millis((period_end - now).max(0) as u64),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use llmtunnel_core::ManualClock;
    use tokio::sync::mpsc;

    use super::*;
    use crate::quota::tier::TierQuotaLimits;

    // 2024-02-15T12:26:40Z
    const NOW: i64 = 1_708_000_000_000;
    const MARCH: i64 = 1_709_251_200_000;

    struct Fixture {
        service: Arc<QuotaService>,
        clock: Arc<ManualClock>,
        db: RelayDatabase,
        events: mpsc::Receiver<WebhookEvent>,
    }

    async fn fixture() -> Fixture {
        let db = RelayDatabase::open_in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::new(NOW));
        let (publisher, events) = EventPublisher::channel(16);
        let config = QuotaConfig {
            free: TierQuotaLimits {
                api_requests: 10,
                data_transfer: 1_000,
                concurrent_connections: 2,
                tunnel_count: 1,
            },
            ..QuotaConfig::default()
        };
        let service = Arc::new(QuotaService::new(
            db.clone(),
            config,
            clock.clone(),
            publisher,
        ));
        Fixture {
            service,
            clock,
            db,
            events,
        }
    }

    #[tokio::test]
    async fn usage_accumulates_within_period() {
        let f = fixture().await;
        let s = &f.service;
        s.record_usage("u1", Tier::Free, ResourceType::ApiRequests, 3)
            .await
            .unwrap();
        let status = s
            .record_usage("u1", Tier::Free, ResourceType::ApiRequests, 4)
            .await
            .unwrap();
        assert_eq!(status.current_usage, 7);
        assert_eq!(status.limit, 10);
        assert_eq!(status.remaining, Some(3));
        assert!((status.percentage_used.unwrap() - 70.0).abs() < 1e-9);
        assert!(!status.exceeded);
    }

    #[tokio::test]
    async fn crossing_sets_exceeded_once_and_emits_event() {
        let mut f = fixture().await;
        let s = &f.service;

        let at_limit = s
            .record_usage("u1", Tier::Free, ResourceType::ApiRequests, 10)
            .await
            .unwrap();
        assert!(!at_limit.exceeded);
        assert!(!s.is_exceeded("u1", ResourceType::ApiRequests).await.unwrap());
        s.check("u1", ResourceType::ApiRequests).await.unwrap();

        f.clock.advance(Duration::from_secs(1));
        let over = s
            .record_usage("u1", Tier::Free, ResourceType::ApiRequests, 1)
            .await
            .unwrap();
        assert!(over.exceeded);
        assert_eq!(over.exceeded_at, Some(NOW + 1_000));

        f.clock.advance(Duration::from_secs(1));
        let again = s
            .record_usage("u1", Tier::Free, ResourceType::ApiRequests, 5)
            .await
            .unwrap();
        assert_eq!(again.exceeded_at, Some(NOW + 1_000));

        let event = f.events.try_recv().unwrap();
        assert_eq!(event.event_type, QUOTA_EXCEEDED);
        assert_eq!(event.data["resourceType"], "api_requests");
        assert_eq!(event.data["currentUsage"], 11);
        assert!(f.events.try_recv().is_err());

        let err = s.check("u1", ResourceType::ApiRequests).await.unwrap_err();
        let QuotaError::Exceeded { retry_after, .. } = err else {
            unreachable!("expected Exceeded, got {err:?}")
        };
        assert_eq!(
            retry_after,
            Duration::from_millis(u64::try_from(MARCH - NOW - 2_000).unwrap())
        );
    }

    #[tokio::test]
    async fn negative_delta_is_rejected() {
        let f = fixture().await;
        let err = f
            .service
            .record_usage("u1", Tier::Free, ResourceType::ApiRequests, -1)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::Validation(_)));
    }

    #[tokio::test]
    async fn enterprise_never_exceeds() {
        let mut f = fixture().await;
        let status = f
            .service
            .record_usage("big", Tier::Enterprise, ResourceType::DataTransfer, i64::from(u32::MAX))
            .await
            .unwrap();
        assert!(status.unlimited);
        assert_eq!(status.remaining, None);
        assert_eq!(status.percentage_used, None);
        assert!(!status.exceeded);
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn new_month_opens_new_row_and_keeps_history() {
        let f = fixture().await;
        let s = &f.service;
        s.record_usage("u1", Tier::Free, ResourceType::ApiRequests, 12)
            .await
            .unwrap();

        f.clock.set(MARCH + 1);
        let march = s
            .record_usage("u1", Tier::Free, ResourceType::ApiRequests, 2)
            .await
            .unwrap();
        assert_eq!(march.current_usage, 2);
        assert!(!march.exceeded);
        assert_eq!(march.period_start, MARCH);

        let history = s.history("u1", ResourceType::ApiRequests, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].current_usage, 2);
        assert_eq!(history[1].current_usage, 12);
        assert!(history[1].exceeded);
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let f = fixture().await;
        let mut handles = Vec::new();
        for _ in 0..20 {
            let service = Arc::clone(&f.service);
            handles.push(tokio::spawn(async move {
                service
                    .record_usage("u1", Tier::Premium, ResourceType::ApiRequests, 1)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let status = f
            .service
            .get_quota("u1", Tier::Premium, ResourceType::ApiRequests)
            .await
            .unwrap();
        assert_eq!(status.current_usage, 20);

        let row = f
            .db
            .get_current_quota("u1", "api_requests", NOW)
            .await
            .unwrap()
            .unwrap();
        let events = f.db.list_quota_events(&row.id).await.unwrap();
        assert_eq!(events.len(), 20);
        assert_eq!(events.last().unwrap().new_total, 20);
    }

    #[tokio::test]
    async fn unused_resources_report_tier_limits() {
        let f = fixture().await;
        let summary = f.service.summary("fresh", Tier::Free).await.unwrap();
        assert_eq!(summary.quotas.len(), 4);
        assert!(!summary.any_exceeded);
        assert!(summary.quotas.iter().all(|q| q.current_usage == 0));
        assert_eq!(summary.period_end, MARCH);
        assert!(f
            .db
            .get_current_quota("fresh", "api_requests", NOW)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn headroom_blocks_countable_resources() {
        let f = fixture().await;
        let s = &f.service;
        s.ensure_headroom("u1", Tier::Free, ResourceType::DataTransfer, 1_000)
            .await
            .unwrap();
        s.record_usage("u1", Tier::Free, ResourceType::DataTransfer, 600)
            .await
            .unwrap();
        let err = s
            .ensure_headroom("u1", Tier::Free, ResourceType::DataTransfer, 500)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QuotaError::Exceeded {
                resource: ResourceType::DataTransfer,
                ..
            }
        ));
        s.ensure_headroom("u1", Tier::Enterprise, ResourceType::DataTransfer, i64::MAX / 2)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn tunnel_count_follows_live_tunnels() {
        let f = fixture().await;
        let s = &f.service;
        f.db.create_tunnel("t1", "u1", "{}", NOW).await.unwrap();

        let err = s
            .ensure_headroom("u1", Tier::Free, ResourceType::TunnelCount, 1)
            .await
            .unwrap_err();
        let QuotaError::Exceeded {
            resource,
            retry_after,
        } = err
        else {
            panic!("expected exceeded, got {err:?}");
        };
        assert_eq!(resource, ResourceType::TunnelCount);
        assert_eq!(retry_after, Duration::ZERO);
        let status = s
            .get_quota("u1", Tier::Free, ResourceType::TunnelCount)
            .await
            .unwrap();
        assert_eq!(status.current_usage, 1);
        assert_eq!(status.remaining, Some(0));

        // Deleting frees the slot within the same period.
        assert!(f.db.delete_tunnel("t1", "u1").await.unwrap());
        s.ensure_headroom("u1", Tier::Free, ResourceType::TunnelCount, 1)
            .await
            .unwrap();
        let status = s
            .get_quota("u1", Tier::Free, ResourceType::TunnelCount)
            .await
            .unwrap();
        assert_eq!(status.current_usage, 0);
        assert!(!status.exceeded);

        let err = s
            .record_usage("u1", Tier::Free, ResourceType::TunnelCount, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::Validation(_)), "{err:?}");
        let err = s
            .reset("u1", Tier::Free, ResourceType::TunnelCount)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::Validation(_)), "{err:?}");
    }

    #[tokio::test]
    async fn reset_preserves_closed_period() {
        let f = fixture().await;
        let s = &f.service;
        s.record_usage("u1", Tier::Free, ResourceType::ApiRequests, 11)
            .await
            .unwrap();
        f.clock.advance(Duration::from_secs(60));

        let fresh = s
            .reset("u1", Tier::Free, ResourceType::ApiRequests)
            .await
            .unwrap();
        assert_eq!(fresh.current_usage, 0);
        assert!(!fresh.exceeded);
        assert_eq!(fresh.period_start, NOW + 60_000);
        assert_eq!(fresh.period_end, MARCH);
        s.check("u1", ResourceType::ApiRequests).await.unwrap();

        let history = s.history("u1", ResourceType::ApiRequests, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].current_usage, 11);
        assert_eq!(history[1].period_end, NOW + 60_000);
    }
}
