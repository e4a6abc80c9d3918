//! Daily rollup: at UTC date transition, fold the running counters into
//! immutable day buckets and zero them, then prune buckets past retention.

use chrono::{DateTime, Utc};

use crate::engine::TrafficEngine;
use xpanel_core::Result;

impl TrafficEngine {
    pub async fn rollup_once(&self) -> Result<()> {
        self.rollup_once_at(Utc::now()).await
    }

    pub async fn rollup_once_at(&self, now: DateTime<Utc>) -> Result<()> {
        let today = now.date_naive();
        let mut state = self.state.lock().await;
        if today == state.last_rollup_date {
            return Ok(());
        }
        let bucket_date = state.last_rollup_date;

        // Bucket insert and counter zeroing commit together per owner, so a
        // crash mid-rollup never double-counts a user's traffic.
        for (user_id, upstream, downstream) in self.store().users_with_activity().await? {
            let mut tx = self.store().begin().await?;
            tx.insert_daily_stats(user_id, bucket_date, upstream, downstream).await?;
            tx.zero_user_stats(user_id).await?;
            tx.commit().await?;
            tracing::info!(
                user = user_id,
                date = %bucket_date,
                upstream,
                downstream,
                "daily stats rolled up"
            );
        }
        state.last_rollup_date = today;
        drop(state);

        let retention = self.settings().get().traffic.retention_days;
        let cutoff = today - chrono::Duration::days(retention);
        let pruned = self.store().delete_daily_stats_before(cutoff).await?;
        if pruned > 0 {
            tracing::info!(pruned, cutoff = %cutoff, "old daily stats pruned");
        }
        Ok(())
    }

    /// Test hook: pretend the last rollup happened on `date`.
    pub async fn set_last_rollup_date(&self, date: chrono::NaiveDate) {
        self.state.lock().await.last_rollup_date = date;
    }
}
