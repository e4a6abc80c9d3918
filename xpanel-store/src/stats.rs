use chrono::NaiveDate;
use xpanel_core::{InboundId, Result, UserId};

use crate::model::{DailyStats, InboundStats};
use crate::{map_db_err, row_or_not_found, Store};

impl Store {
    pub async fn inbound_stats(&self, inbound_id: InboundId) -> Result<InboundStats> {
        let row = sqlx::query_as::<_, InboundStats>(
            "SELECT inbound_id, user_id, upstream_bytes, downstream_bytes, last_active \
             FROM inbound_stats WHERE inbound_id = ?",
        )
        .bind(inbound_id)
        .fetch_optional(self.pool())
        .await;
        row_or_not_found(row, "inbound stats")
    }

    pub async fn inbound_stats_by_user(&self, user_id: UserId) -> Result<Vec<InboundStats>> {
        sqlx::query_as::<_, InboundStats>(
            "SELECT inbound_id, user_id, upstream_bytes, downstream_bytes, last_active \
             FROM inbound_stats WHERE user_id = ? ORDER BY inbound_id",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)
    }

    pub async fn list_inbound_stats(&self) -> Result<Vec<InboundStats>> {
        sqlx::query_as::<_, InboundStats>(
            "SELECT inbound_id, user_id, upstream_bytes, downstream_bytes, last_active \
             FROM inbound_stats ORDER BY inbound_id",
        )
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)
    }

    pub async fn daily_stats_by_user(
        &self,
        user_id: UserId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyStats>> {
        sqlx::query_as::<_, DailyStats>(
            "SELECT id, user_id, date, upstream_bytes, downstream_bytes, total_bytes \
             FROM daily_stats WHERE user_id = ? AND date >= ? AND date <= ? ORDER BY date",
        )
        .bind(user_id)
        .bind(start)
        .bind(end)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)
    }

    pub async fn daily_stats_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyStats>> {
        sqlx::query_as::<_, DailyStats>(
            "SELECT id, user_id, date, upstream_bytes, downstream_bytes, total_bytes \
             FROM daily_stats WHERE date >= ? AND date <= ? ORDER BY user_id, date",
        )
        .bind(start)
        .bind(end)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)
    }

    /// Retention pruning: drop day buckets strictly older than `before`.
    pub async fn delete_daily_stats_before(&self, before: NaiveDate) -> Result<u64> {
        let affected = sqlx::query("DELETE FROM daily_stats WHERE date < ?")
            .bind(before)
            .execute(self.pool())
            .await
            .map_err(map_db_err)?
            .rows_affected();
        Ok(affected)
    }

    /// Aggregate totals across all inbound stats, for the dashboard.
    pub async fn traffic_totals(&self) -> Result<(i64, i64)> {
        let (up, down): (i64, i64) = sqlx::query_as(
            "SELECT COALESCE(SUM(upstream_bytes), 0), COALESCE(SUM(downstream_bytes), 0) \
             FROM inbound_stats",
        )
        .fetch_one(self.pool())
        .await
        .map_err(map_db_err)?;
        Ok((up, down))
    }

    /// Owners with any running counter activity, for the rollup loop.
    pub async fn users_with_activity(&self) -> Result<Vec<(UserId, i64, i64)>> {
        sqlx::query_as(
            "SELECT user_id, SUM(upstream_bytes), SUM(downstream_bytes) FROM inbound_stats \
             GROUP BY user_id HAVING SUM(upstream_bytes) + SUM(downstream_bytes) > 0",
        )
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)
    }

}
