//! Tunnel, endpoint and activity queries.

use super::db::{DatabaseError, RelayDatabase};
use super::models::{ActivityRow, EndpointRow, TunnelRow};

/// Statuses that hold the per-user active-tunnel slot.
const ACTIVE_STATUSES: &str = "('created', 'connecting', 'connected')";

impl RelayDatabase {
    // =========================================================================
    // Tunnel queries
    // =========================================================================

    /// Insert a tunnel in the `created` state and log the creation.
    pub async fn create_tunnel(
        &self,
        id: &str,
        user_id: &str,
        config_json: &str,
        now: i64,
    ) -> Result<TunnelRow, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "INSERT INTO tunnels (id, user_id, status, config, created_at, updated_at)
             VALUES (?, ?, 'created', ?, ?, ?)",
        )
        .bind(id)
        .bind(user_id)
        .bind(config_json)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        insert_activity(&mut tx, id, user_id, "tunnel.created", config_json, now).await?;
        tx.commit().await?;

        self.get_tunnel(id).await
    }

    /// Get a tunnel by ID.
    pub async fn get_tunnel(&self, id: &str) -> Result<TunnelRow, DatabaseError> {
        sqlx::query_as::<_, TunnelRow>("SELECT * FROM tunnels WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Tunnel {id}")))
    }

    /// Get a tunnel by ID, scoped to its owner.
    pub async fn get_tunnel_for_user(
        &self,
        id: &str,
        user_id: &str,
    ) -> Result<TunnelRow, DatabaseError> {
        sqlx::query_as::<_, TunnelRow>("SELECT * FROM tunnels WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Tunnel {id}")))
    }

    /// The user's non-terminal tunnel, if any.
    pub async fn get_active_tunnel(&self, user_id: &str) -> Result<Option<TunnelRow>, DatabaseError> {
        let sql = format!(
            "SELECT * FROM tunnels WHERE user_id = ? AND status IN {ACTIVE_STATUSES} LIMIT 1"
        );
        Ok(sqlx::query_as::<_, TunnelRow>(&sql)
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?)
    }

    /// The user's most recently updated tunnel regardless of status.
    pub async fn get_latest_tunnel(&self, user_id: &str) -> Result<Option<TunnelRow>, DatabaseError> {
        Ok(sqlx::query_as::<_, TunnelRow>(
            "SELECT * FROM tunnels WHERE user_id = ? ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?)
    }

    /// List all tunnels owned by a user, newest first.
    pub async fn list_tunnels(&self, user_id: &str) -> Result<Vec<TunnelRow>, DatabaseError> {
        Ok(sqlx::query_as::<_, TunnelRow>(
            "SELECT * FROM tunnels WHERE user_id = ? ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?)
    }

    /// Number of tunnels the user owns, in any status.
    pub async fn count_tunnels(&self, user_id: &str) -> Result<i64, DatabaseError> {
        Ok(
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM tunnels WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(self.pool())
                .await?,
        )
    }

    /// Atomically move a tunnel from `from` to `to`, logging the change.
    ///
    /// Returns `false` without writing anything if the tunnel is no longer
    /// in `from` (another writer won the race).
    pub async fn transition_tunnel_status(
        &self,
        id: &str,
        from: &str,
        to: &str,
        details_json: &str,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query_as::<_, (String,)>(
            "UPDATE tunnels SET status = ?, updated_at = ? WHERE id = ? AND status = ?
             RETURNING user_id",
        )
        .bind(to)
        .bind(now)
        .bind(id)
        .bind(from)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((user_id,)) = row else {
            tx.rollback().await?;
            return Ok(false);
        };

        insert_activity(&mut tx, id, &user_id, "tunnel.status_changed", details_json, now)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Read-modify-write of a tunnel's configuration inside one transaction.
    ///
    /// `update` receives the stored JSON and returns the new JSON to store.
    pub async fn update_tunnel_config<F, E>(
        &self,
        id: &str,
        user_id: &str,
        action: &str,
        now: i64,
        update: F,
    ) -> Result<TunnelRow, E>
    where
        F: FnOnce(&str) -> Result<String, E>,
        E: From<DatabaseError>,
    {
        let mut tx = self.pool().begin().await.map_err(DatabaseError::from)?;

        // A no-op write first so the transaction holds the write lock before it reads.
        let touched = sqlx::query("UPDATE tunnels SET updated_at = ? WHERE id = ? AND user_id = ?")
            .bind(now)
            .bind(id)
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(DatabaseError::from)?;
        if touched.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Tunnel {id}")).into());
        }

        let (current,) = sqlx::query_as::<_, (String,)>("SELECT config FROM tunnels WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(DatabaseError::from)?;

        let next = update(&current)?;

        sqlx::query("UPDATE tunnels SET config = ? WHERE id = ?")
            .bind(&next)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(DatabaseError::from)?;

        insert_activity(&mut tx, id, user_id, action, &next, now).await?;
        tx.commit().await.map_err(DatabaseError::from)?;

        Ok(self.get_tunnel(id).await?)
    }

    /// Delete a tunnel owned by `user_id`. Endpoints, activity, metrics and
    /// webhooks cascade.
    pub async fn delete_tunnel(&self, id: &str, user_id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM tunnels WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete terminal tunnels that have not changed since `before`.
    pub async fn delete_stale_tunnels(&self, before: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "DELETE FROM tunnels WHERE status IN ('disconnected', 'error') AND updated_at < ?",
        )
        .bind(before)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Mark every `connecting`/`connected` tunnel as `disconnected`.
    ///
    /// Agent sessions do not survive a relay restart, so this runs at startup.
    pub async fn disconnect_all_tunnels(&self, now: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "UPDATE tunnels SET status = 'disconnected', updated_at = ?
             WHERE status IN ('connecting', 'connected')",
        )
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Activity queries
    // =========================================================================

    /// Append an activity entry outside of any other write.
    pub async fn log_activity(
        &self,
        tunnel_id: &str,
        user_id: &str,
        action: &str,
        details_json: &str,
        now: i64,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool().begin().await?;
        insert_activity(&mut tx, tunnel_id, user_id, action, details_json, now).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Most recent activity for a tunnel, newest first.
    pub async fn list_activity(
        &self,
        tunnel_id: &str,
        limit: i64,
    ) -> Result<Vec<ActivityRow>, DatabaseError> {
        Ok(sqlx::query_as::<_, ActivityRow>(
            "SELECT * FROM tunnel_activity WHERE tunnel_id = ?
             ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(tunnel_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?)
    }

    // =========================================================================
    // Endpoint queries
    // =========================================================================

    /// Insert an endpoint, or update priority/weight if the URL is already
    /// registered on the tunnel.
    pub async fn upsert_endpoint(
        &self,
        id: &str,
        tunnel_id: &str,
        url: &str,
        priority: i64,
        weight: i64,
        now: i64,
    ) -> Result<EndpointRow, DatabaseError> {
        Ok(sqlx::query_as::<_, EndpointRow>(
            "INSERT INTO tunnel_endpoints (id, tunnel_id, url, priority, weight, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (tunnel_id, url) DO UPDATE SET
                 priority = excluded.priority,
                 weight = excluded.weight
             RETURNING *",
        )
        .bind(id)
        .bind(tunnel_id)
        .bind(url)
        .bind(priority)
        .bind(weight)
        .bind(now)
        .fetch_one(self.pool())
        .await?)
    }

    /// Endpoints for a tunnel ordered by priority (lowest first), then weight.
    pub async fn list_endpoints(&self, tunnel_id: &str) -> Result<Vec<EndpointRow>, DatabaseError> {
        Ok(sqlx::query_as::<_, EndpointRow>(
            "SELECT * FROM tunnel_endpoints WHERE tunnel_id = ?
             ORDER BY priority ASC, weight DESC, created_at ASC",
        )
        .bind(tunnel_id)
        .fetch_all(self.pool())
        .await?)
    }

    /// Remove one endpoint from a tunnel.
    pub async fn delete_endpoint(
        &self,
        tunnel_id: &str,
        endpoint_id: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM tunnel_endpoints WHERE tunnel_id = ? AND id = ?")
            .bind(tunnel_id)
            .bind(endpoint_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove every endpoint on a tunnel whose URL is not in `keep`.
    pub async fn retain_endpoints(
        &self,
        tunnel_id: &str,
        keep: &[String],
    ) -> Result<u64, DatabaseError> {
        let mut removed = 0;
        for endpoint in self.list_endpoints(tunnel_id).await? {
            if !keep.contains(&endpoint.url) && self.delete_endpoint(tunnel_id, &endpoint.id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Record a health classification. Last writer wins.
    pub async fn set_endpoint_health(
        &self,
        endpoint_id: &str,
        health_status: &str,
        checked_at: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE tunnel_endpoints SET health_status = ?, last_health_check_at = ? WHERE id = ?",
        )
        .bind(health_status)
        .bind(checked_at)
        .bind(endpoint_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

async fn insert_activity(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    tunnel_id: &str,
    user_id: &str,
    action: &str,
    details_json: &str,
    now: i64,
) -> Result<(), DatabaseError> {
    sqlx::query(
        "INSERT INTO tunnel_activity (tunnel_id, user_id, action, details, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(tunnel_id)
    .bind(user_id)
    .bind(action)
    .bind(details_json)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
