use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Sqlite, Transaction};
use xpanel_core::{InboundId, Result, UserId};

use crate::map_db_err;
use crate::model::{Inbound, InboundRow};

/// An open transaction over the store.
///
/// Carries the operations that must commit atomically with each other: the
/// sampler's delta append together with quota enforcement, and the daily
/// rollover's bucket insert together with counter zeroing. Dropping the value
/// without `commit` rolls everything back.
pub struct StoreTx {
    tx: Transaction<'static, Sqlite>,
}

impl StoreTx {
    pub(crate) fn new(tx: Transaction<'static, Sqlite>) -> Self {
        Self { tx }
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(map_db_err)
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.map_err(map_db_err)
    }

    pub async fn inbound_by_id(&mut self, id: InboundId) -> Result<Inbound> {
        let row = sqlx::query_as::<_, InboundRow>(
            "SELECT id, user_id, name, protocol, port, settings, enabled, quota_bytes, \
             used_bytes, expires_at, created_at, updated_at FROM inbounds WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await;
        crate::row_or_not_found(row, "inbound")?.try_into()
    }

    /// Append sampled deltas to the running counters, creating the stats row
    /// lazily on first sample.
    pub async fn add_inbound_stats_delta(
        &mut self,
        inbound_id: InboundId,
        user_id: UserId,
        upstream: i64,
        downstream: i64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO inbound_stats (inbound_id, user_id, upstream_bytes, downstream_bytes, last_active) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(inbound_id) DO UPDATE SET \
                upstream_bytes = upstream_bytes + excluded.upstream_bytes, \
                downstream_bytes = downstream_bytes + excluded.downstream_bytes, \
                last_active = excluded.last_active",
        )
        .bind(inbound_id)
        .bind(user_id)
        .bind(upstream)
        .bind(downstream)
        .bind(at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    pub async fn add_inbound_used(&mut self, inbound_id: InboundId, delta: i64) -> Result<()> {
        sqlx::query("UPDATE inbounds SET used_bytes = used_bytes + ?, updated_at = ? WHERE id = ?")
            .bind(delta)
            .bind(Utc::now())
            .bind(inbound_id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_db_err)?;
        Ok(())
    }

    pub async fn set_inbound_enabled(&mut self, inbound_id: InboundId, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE inbounds SET enabled = ?, updated_at = ? WHERE id = ?")
            .bind(enabled)
            .bind(Utc::now())
            .bind(inbound_id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_db_err)?;
        Ok(())
    }

    pub async fn disable_user_inbounds(&mut self, user_id: UserId) -> Result<u64> {
        let affected = sqlx::query(
            "UPDATE inbounds SET enabled = 0, updated_at = ? WHERE user_id = ? AND enabled = 1",
        )
        .bind(Utc::now())
        .bind(user_id)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_err)?
        .rows_affected();
        Ok(affected)
    }

    pub async fn set_user_used(&mut self, user_id: UserId, used: i64) -> Result<()> {
        sqlx::query("UPDATE users SET used_bytes = ?, updated_at = ? WHERE id = ?")
            .bind(used)
            .bind(Utc::now())
            .bind(user_id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_db_err)?;
        Ok(())
    }

    /// Sum of `used_bytes` over the owner's inbounds, inside the transaction.
    pub async fn user_total_used(&mut self, user_id: UserId) -> Result<i64> {
        let (total,): (i64,) =
            sqlx::query_as("SELECT COALESCE(SUM(used_bytes), 0) FROM inbounds WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&mut *self.tx)
                .await
                .map_err(map_db_err)?;
        Ok(total)
    }

    /// Write one immutable day bucket. The `(user, date)` pair is unique;
    /// a duplicate rollover for the same day is a conflict.
    pub async fn insert_daily_stats(
        &mut self,
        user_id: UserId,
        date: NaiveDate,
        upstream: i64,
        downstream: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO daily_stats (user_id, date, upstream_bytes, downstream_bytes, total_bytes) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(date)
        .bind(upstream)
        .bind(downstream)
        .bind(upstream + downstream)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    /// Zero the running counters after a rollover.
    pub async fn zero_user_stats(&mut self, user_id: UserId) -> Result<()> {
        sqlx::query(
            "UPDATE inbound_stats SET upstream_bytes = 0, downstream_bytes = 0 WHERE user_id = ?",
        )
        .bind(user_id)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }
}

impl std::fmt::Debug for StoreTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StoreTx { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewInbound, NewUser};
    use crate::Store;
    use xpanel_core::Protocol;

    async fn seeded() -> (Store, UserId, InboundId) {
        let store = Store::open_in_memory().await.unwrap();
        let user = store
            .create_user(NewUser {
                username: "owner".into(),
                email: "o@example.com".into(),
                password_hash: "h".into(),
                password_salt: "s".into(),
                is_admin: false,
                quota_bytes: 0,
                expires_at: None,
            })
            .await
            .unwrap();
        let inbound = store
            .create_inbound(NewInbound {
                user_id: user.id,
                name: "in".into(),
                protocol: Protocol::Vless,
                port: 5000,
                settings: serde_json::json!({}),
                enabled: true,
                quota_bytes: 1000,
                expires_at: None,
            })
            .await
            .unwrap();
        (store, user.id, inbound.id)
    }

    #[tokio::test]
    async fn rollback_discards_all_steps() {
        let (store, uid, iid) = seeded().await;

        let mut tx = store.begin().await.unwrap();
        tx.add_inbound_stats_delta(iid, uid, 100, 100, Utc::now()).await.unwrap();
        tx.add_inbound_used(iid, 200).await.unwrap();
        tx.set_inbound_enabled(iid, false).await.unwrap();
        tx.rollback().await.unwrap();

        let inbound = store.inbound_by_id(iid).await.unwrap();
        assert!(inbound.enabled);
        assert_eq!(inbound.used_bytes, 0);
        assert_eq!(store.inbound_stats(iid).await.unwrap_err().status(), 404);
    }

    #[tokio::test]
    async fn drop_without_commit_rolls_back() {
        let (store, uid, iid) = seeded().await;
        {
            let mut tx = store.begin().await.unwrap();
            tx.add_inbound_stats_delta(iid, uid, 5, 5, Utc::now()).await.unwrap();
        }
        assert_eq!(store.inbound_stats(iid).await.unwrap_err().status(), 404);
    }

    #[tokio::test]
    async fn duplicate_day_bucket_conflicts() {
        let (store, uid, _iid) = seeded().await;
        let date = NaiveDate::from_ymd_opt(2026, 7, 31).unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.insert_daily_stats(uid, date, 1, 2).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let err = tx.insert_daily_stats(uid, date, 3, 4).await.unwrap_err();
        assert_eq!(err.status(), 409);
    }

    #[tokio::test]
    async fn disable_user_inbounds_counts_rows() {
        let (store, uid, _iid) = seeded().await;
        store
            .create_inbound(NewInbound {
                user_id: uid,
                name: "second".into(),
                protocol: Protocol::Socks,
                port: 5001,
                settings: serde_json::json!({}),
                enabled: true,
                quota_bytes: 0,
                expires_at: None,
            })
            .await
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.disable_user_inbounds(uid).await.unwrap(), 2);
        tx.commit().await.unwrap();
        assert!(store.list_enabled_inbounds().await.unwrap().is_empty());
    }
}
