//! Flushed tunnel metrics.

use super::db::{DatabaseError, RelayDatabase};
use super::models::MetricsRow;

/// One drained metrics window, ready to persist.
#[derive(Debug, Clone, Default)]
pub struct MetricsFlushParams {
    pub request_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub total_latency_ms: i64,
    pub min_latency_ms: Option<i64>,
    pub max_latency_ms: Option<i64>,
    pub window_start: i64,
}

impl RelayDatabase {
    /// Persist a drained window and fold it into the tunnel's cumulative
    /// snapshot columns.
    pub async fn insert_metrics_flush(
        &self,
        tunnel_id: &str,
        params: &MetricsFlushParams,
        now: i64,
    ) -> Result<MetricsRow, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        // Expressions on the right-hand side see the pre-update row.
        let updated = sqlx::query(
            "UPDATE tunnels SET
                 avg_latency_ms = CASE WHEN request_count + ?1 = 0 THEN 0.0
                     ELSE (avg_latency_ms * request_count + ?2) / (request_count + ?1) END,
                 request_count = request_count + ?1,
                 success_count = success_count + ?3,
                 error_count = error_count + ?4
             WHERE id = ?5",
        )
        .bind(params.request_count)
        .bind(params.total_latency_ms)
        .bind(params.success_count)
        .bind(params.error_count)
        .bind(tunnel_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Tunnel {tunnel_id}")));
        }

        let row = sqlx::query_as::<_, MetricsRow>(
            "INSERT INTO tunnel_metrics
                 (tunnel_id, request_count, success_count, error_count, total_latency_ms,
                  min_latency_ms, max_latency_ms, window_start, flushed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING *",
        )
        .bind(tunnel_id)
        .bind(params.request_count)
        .bind(params.success_count)
        .bind(params.error_count)
        .bind(params.total_latency_ms)
        .bind(params.min_latency_ms)
        .bind(params.max_latency_ms)
        .bind(params.window_start)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row)
    }

    /// Flushed windows for a tunnel, newest first.
    pub async fn list_metrics_history(
        &self,
        tunnel_id: &str,
        limit: i64,
    ) -> Result<Vec<MetricsRow>, DatabaseError> {
        Ok(sqlx::query_as::<_, MetricsRow>(
            "SELECT * FROM tunnel_metrics WHERE tunnel_id = ?
             ORDER BY flushed_at DESC, id DESC LIMIT ?",
        )
        .bind(tunnel_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?)
    }
}
