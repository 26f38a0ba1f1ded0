//! Quota period and usage queries.

use super::db::{DatabaseError, RelayDatabase};
use super::models::{QuotaEventRow, QuotaRow};

/// Inputs for one atomic usage increment.
#[derive(Debug, Clone)]
pub struct QuotaUsageParams<'a> {
    /// ID to use if a new period row has to be opened.
    pub new_id: &'a str,
    pub user_id: &'a str,
    pub resource_type: &'a str,
    pub tier: &'a str,
    /// Bounds of the period to open if none covers `now`.
    pub period_start: i64,
    pub period_end: i64,
    /// Limit to stamp on a newly opened row. `-1` means unlimited.
    pub limit_value: i64,
    pub delta: i64,
    pub now: i64,
}

/// Result of an increment.
#[derive(Debug, Clone)]
pub struct QuotaUsageRecord {
    pub quota: QuotaRow,
    /// `true` only for the increment that first took usage over the limit.
    pub crossed: bool,
}

const CURRENT_PERIOD: &str =
    "user_id = ? AND resource_type = ? AND period_start <= ? AND period_end > ?";

const INCREMENT_SQL: &str = "UPDATE quotas SET
         current_usage = current_usage + ?1,
         exceeded_at = CASE
             WHEN exceeded_at IS NULL AND limit_value >= 0
                  AND current_usage + ?1 > limit_value THEN ?2
             ELSE exceeded_at END,
         updated_at = ?2
     WHERE id = (SELECT id FROM quotas
                 WHERE user_id = ?3 AND resource_type = ?4
                   AND period_start <= ?2 AND period_end > ?2
                 ORDER BY period_start DESC LIMIT 1)
     RETURNING *";

impl RelayDatabase {
    // =========================================================================
    // Quota queries
    // =========================================================================

    /// Increment usage for the period covering `now`, opening the period if
    /// needed, and append an audit event. Runs as a single transaction whose
    /// first statement is a write.
    pub async fn record_quota_usage(
        &self,
        params: &QuotaUsageParams<'_>,
    ) -> Result<QuotaUsageRecord, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let open_sql = format!(
            "INSERT INTO quotas
                 (id, user_id, resource_type, tier, period_start, period_end,
                  current_usage, limit_value, created_at, updated_at)
             SELECT ?, ?, ?, ?, ?, ?, 0, ?, ?, ?
             WHERE NOT EXISTS (SELECT 1 FROM quotas WHERE {CURRENT_PERIOD})"
        );
        sqlx::query(&open_sql)
            .bind(params.new_id)
            .bind(params.user_id)
            .bind(params.resource_type)
            .bind(params.tier)
            .bind(params.period_start)
            .bind(params.period_end)
            .bind(params.limit_value)
            .bind(params.now)
            .bind(params.now)
            .bind(params.user_id)
            .bind(params.resource_type)
            .bind(params.now)
            .bind(params.now)
            .execute(&mut *tx)
            .await?;

        let quota = sqlx::query_as::<_, QuotaRow>(INCREMENT_SQL)
            .bind(params.delta)
            .bind(params.now)
            .bind(params.user_id)
            .bind(params.resource_type)
            .fetch_one(&mut *tx)
            .await?;

        let previous = quota.current_usage - params.delta;
        let crossed = quota.limit_value >= 0
            && quota.current_usage > quota.limit_value
            && previous <= quota.limit_value;

        sqlx::query(
            "INSERT INTO quota_events
                 (quota_id, user_id, resource_type, delta, new_total, percentage_used, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&quota.id)
        .bind(params.user_id)
        .bind(params.resource_type)
        .bind(params.delta)
        .bind(quota.current_usage)
        .bind(percentage_used(quota.current_usage, quota.limit_value))
        .bind(params.now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(QuotaUsageRecord { quota, crossed })
    }

    /// The period row covering `now`, if one has been opened.
    pub async fn get_current_quota(
        &self,
        user_id: &str,
        resource_type: &str,
        now: i64,
    ) -> Result<Option<QuotaRow>, DatabaseError> {
        let sql = format!(
            "SELECT * FROM quotas WHERE {CURRENT_PERIOD} ORDER BY period_start DESC LIMIT 1"
        );
        Ok(sqlx::query_as::<_, QuotaRow>(&sql)
            .bind(user_id)
            .bind(resource_type)
            .bind(now)
            .bind(now)
            .fetch_optional(self.pool())
            .await?)
    }

    /// Past and current periods for one resource, newest first.
    pub async fn list_quota_history(
        &self,
        user_id: &str,
        resource_type: &str,
        limit: i64,
    ) -> Result<Vec<QuotaRow>, DatabaseError> {
        Ok(sqlx::query_as::<_, QuotaRow>(
            "SELECT * FROM quotas WHERE user_id = ? AND resource_type = ?
             ORDER BY period_start DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(resource_type)
        .bind(limit)
        .fetch_all(self.pool())
        .await?)
    }

    /// Close the current period at `params.now` and open a fresh one with
    /// zero usage that ends at `params.period_end`.
    pub async fn reset_quota(
        &self,
        params: &QuotaUsageParams<'_>,
    ) -> Result<QuotaRow, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let close_sql =
            format!("UPDATE quotas SET period_end = ?, updated_at = ? WHERE {CURRENT_PERIOD}");
        sqlx::query(&close_sql)
            .bind(params.now)
            .bind(params.now)
            .bind(params.user_id)
            .bind(params.resource_type)
            .bind(params.now)
            .bind(params.now)
            .execute(&mut *tx)
            .await?;

        let quota = sqlx::query_as::<_, QuotaRow>(
            "INSERT INTO quotas
                 (id, user_id, resource_type, tier, period_start, period_end,
                  current_usage, limit_value, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
             RETURNING *",
        )
        .bind(params.new_id)
        .bind(params.user_id)
        .bind(params.resource_type)
        .bind(params.tier)
        .bind(params.now)
        .bind(params.period_end)
        .bind(params.limit_value)
        .bind(params.now)
        .bind(params.now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(quota)
    }

    /// Audit events for one period row, oldest first.
    pub async fn list_quota_events(
        &self,
        quota_id: &str,
    ) -> Result<Vec<QuotaEventRow>, DatabaseError> {
        Ok(sqlx::query_as::<_, QuotaEventRow>(
            "SELECT * FROM quota_events WHERE quota_id = ? ORDER BY id ASC",
        )
        .bind(quota_id)
        .fetch_all(self.pool())
        .await?)
    }
}

/// Usage as a percentage of the limit; `None` when unlimited.
#[allow(clippy::cast_precision_loss)]
pub fn percentage_used(usage: i64, limit: i64) -> Option<f64> {
    match limit {
        l if l < 0 => None,
        0 => Some(if usage > 0 { 100.0 } else { 0.0 }),
        l => Some(usage as f64 * 100.0 / l as f64),
    }
}
