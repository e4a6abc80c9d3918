use chrono::Utc;
use sqlx::SqliteConnection;
use xpanel_core::{Error, InboundId, Result, UserId};

use crate::model::{Inbound, InboundRow, NewInbound};
use crate::{map_db_err, row_or_not_found, Store};

const INBOUND_COLUMNS: &str = "id, user_id, name, protocol, port, settings, enabled, \
     quota_bytes, used_bytes, expires_at, created_at, updated_at";

/// The duplicate-port check runs on the same connection as the insert/update
/// so the uniqueness invariant cannot race concurrent admin actions. The
/// partial unique index on enabled ports backstops it at the schema level.
async fn assert_port_free(
    conn: &mut SqliteConnection,
    port: u16,
    exclude: Option<InboundId>,
) -> Result<()> {
    let taken: Option<(i64,)> = sqlx::query_as(
        "SELECT id FROM inbounds WHERE port = ? AND enabled = 1 AND id != ? LIMIT 1",
    )
    .bind(port as i64)
    .bind(exclude.unwrap_or(0))
    .fetch_optional(conn)
    .await
    .map_err(map_db_err)?;

    match taken {
        Some(_) => Err(Error::conflict(format!("port {port} already in use"))),
        None => Ok(()),
    }
}

fn validate_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(Error::bad_request("port must be in [1, 65535]"));
    }
    Ok(())
}

impl Store {
    pub async fn create_inbound(&self, new: NewInbound) -> Result<Inbound> {
        validate_port(new.port)?;
        if new.name.trim().is_empty() {
            return Err(Error::bad_request("inbound name must not be empty"));
        }

        let mut tx = self.pool().begin().await.map_err(map_db_err)?;
        if new.enabled {
            assert_port_free(&mut tx, new.port, None).await?;
        }

        let now = Utc::now();
        let settings = serde_json::to_string(&new.settings)
            .map_err(|e| Error::internal(e.to_string()))?;
        let id = sqlx::query(
            "INSERT INTO inbounds (user_id, name, protocol, port, settings, enabled, \
             quota_bytes, expires_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new.user_id)
        .bind(&new.name)
        .bind(new.protocol.as_str())
        .bind(new.port as i64)
        .bind(settings)
        .bind(new.enabled)
        .bind(new.quota_bytes)
        .bind(new.expires_at)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_db_err)?
        .last_insert_rowid();

        tx.commit().await.map_err(map_db_err)?;
        self.inbound_by_id(id).await
    }

    pub async fn inbound_by_id(&self, id: InboundId) -> Result<Inbound> {
        let row = sqlx::query_as::<_, InboundRow>(&format!(
            "SELECT {INBOUND_COLUMNS} FROM inbounds WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await;
        row_or_not_found(row, "inbound")?.try_into()
    }

    pub async fn inbounds_by_user(&self, user_id: UserId) -> Result<Vec<Inbound>> {
        let rows = sqlx::query_as::<_, InboundRow>(&format!(
            "SELECT {INBOUND_COLUMNS} FROM inbounds WHERE user_id = ? ORDER BY id"
        ))
        .bind(user_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;
        rows.into_iter().map(Inbound::try_from).collect()
    }

    pub async fn inbounds_by_port(&self, port: u16) -> Result<Vec<Inbound>> {
        let rows = sqlx::query_as::<_, InboundRow>(&format!(
            "SELECT {INBOUND_COLUMNS} FROM inbounds WHERE port = ? ORDER BY id"
        ))
        .bind(port as i64)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;
        rows.into_iter().map(Inbound::try_from).collect()
    }

    pub async fn list_inbounds(&self, offset: i64, limit: i64) -> Result<Vec<Inbound>> {
        let rows = sqlx::query_as::<_, InboundRow>(&format!(
            "SELECT {INBOUND_COLUMNS} FROM inbounds ORDER BY id LIMIT ? OFFSET ?"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;
        rows.into_iter().map(Inbound::try_from).collect()
    }

    /// The sampler's snapshot: every inbound whose enabled flag is true.
    pub async fn list_enabled_inbounds(&self) -> Result<Vec<Inbound>> {
        let rows = sqlx::query_as::<_, InboundRow>(&format!(
            "SELECT {INBOUND_COLUMNS} FROM inbounds WHERE enabled = 1 ORDER BY id"
        ))
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;
        rows.into_iter().map(Inbound::try_from).collect()
    }

    pub async fn count_inbounds(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM inbounds")
            .fetch_one(self.pool())
            .await
            .map_err(map_db_err)?;
        Ok(n)
    }

    pub async fn update_inbound(&self, inbound: &Inbound) -> Result<()> {
        validate_port(inbound.port)?;

        let mut tx = self.pool().begin().await.map_err(map_db_err)?;
        if inbound.enabled {
            assert_port_free(&mut tx, inbound.port, Some(inbound.id)).await?;
        }

        let settings = serde_json::to_string(&inbound.settings)
            .map_err(|e| Error::internal(e.to_string()))?;
        let affected = sqlx::query(
            "UPDATE inbounds SET user_id = ?, name = ?, protocol = ?, port = ?, settings = ?, \
             enabled = ?, quota_bytes = ?, used_bytes = ?, expires_at = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(inbound.user_id)
        .bind(&inbound.name)
        .bind(inbound.protocol.as_str())
        .bind(inbound.port as i64)
        .bind(settings)
        .bind(inbound.enabled)
        .bind(inbound.quota_bytes)
        .bind(inbound.used_bytes)
        .bind(inbound.expires_at)
        .bind(Utc::now())
        .bind(inbound.id)
        .execute(&mut *tx)
        .await
        .map_err(map_db_err)?
        .rows_affected();

        if affected == 0 {
            return Err(Error::not_found("inbound"));
        }
        tx.commit().await.map_err(map_db_err)?;
        Ok(())
    }

    pub async fn delete_inbound(&self, id: InboundId) -> Result<()> {
        let affected = sqlx::query("DELETE FROM inbounds WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(map_db_err)?
            .rows_affected();
        if affected == 0 {
            return Err(Error::not_found("inbound"));
        }
        Ok(())
    }
}
