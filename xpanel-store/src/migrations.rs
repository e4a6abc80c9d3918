//! Numbered schema migration ledger.
//!
//! Each migration is a `(apply, revert)` pair; applied versions are recorded
//! in `schema_migrations`. The ledger is ordered and idempotent: versions
//! already recorded are skipped, and each migration runs inside its own
//! transaction together with its ledger record.

use sqlx::SqlitePool;
use xpanel_core::{Error, Result};

use crate::map_db_err;

pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub apply: &'static str,
    pub revert: &'static str,
}

pub const LEDGER: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_users",
        apply: r#"
CREATE TABLE users (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    username        TEXT    NOT NULL UNIQUE,
    email           TEXT    NOT NULL UNIQUE,
    password_hash   TEXT    NOT NULL,
    password_salt   TEXT    NOT NULL,
    is_admin        INTEGER NOT NULL DEFAULT 0,
    enabled         INTEGER NOT NULL DEFAULT 1,
    quota_bytes     INTEGER NOT NULL DEFAULT 0,
    used_bytes      INTEGER NOT NULL DEFAULT 0,
    expires_at      TEXT,
    last_login      TEXT,
    failed_logins   INTEGER NOT NULL DEFAULT 0,
    locked_until    TEXT,
    created_at      TEXT    NOT NULL,
    updated_at      TEXT    NOT NULL
);
"#,
        revert: "DROP TABLE users;",
    },
    Migration {
        version: 2,
        name: "create_inbounds",
        apply: r#"
CREATE TABLE inbounds (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id         INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    name            TEXT    NOT NULL,
    protocol        TEXT    NOT NULL,
    port            INTEGER NOT NULL,
    settings        TEXT    NOT NULL DEFAULT '{}',
    enabled         INTEGER NOT NULL DEFAULT 1,
    quota_bytes     INTEGER NOT NULL DEFAULT 0,
    used_bytes      INTEGER NOT NULL DEFAULT 0,
    expires_at      TEXT,
    created_at      TEXT    NOT NULL,
    updated_at      TEXT    NOT NULL
);
CREATE INDEX idx_inbounds_user ON inbounds(user_id);
CREATE UNIQUE INDEX idx_inbounds_enabled_port ON inbounds(port) WHERE enabled = 1;
"#,
        revert: "DROP TABLE inbounds;",
    },
    Migration {
        version: 3,
        name: "create_traffic_stats",
        apply: r#"
CREATE TABLE inbound_stats (
    inbound_id       INTEGER PRIMARY KEY REFERENCES inbounds(id) ON DELETE CASCADE,
    user_id          INTEGER NOT NULL,
    upstream_bytes   INTEGER NOT NULL DEFAULT 0,
    downstream_bytes INTEGER NOT NULL DEFAULT 0,
    last_active      TEXT    NOT NULL
);
CREATE INDEX idx_inbound_stats_user ON inbound_stats(user_id);
CREATE TABLE daily_stats (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id          INTEGER NOT NULL,
    date             TEXT    NOT NULL,
    upstream_bytes   INTEGER NOT NULL DEFAULT 0,
    downstream_bytes INTEGER NOT NULL DEFAULT 0,
    total_bytes      INTEGER NOT NULL DEFAULT 0,
    UNIQUE (user_id, date)
);
"#,
        revert: "DROP TABLE daily_stats;\nDROP TABLE inbound_stats;",
    },
    Migration {
        version: 4,
        name: "create_certificates",
        apply: r#"
CREATE TABLE certificates (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    domain        TEXT    NOT NULL UNIQUE,
    cert_path     TEXT    NOT NULL,
    key_path      TEXT    NOT NULL,
    status        TEXT    NOT NULL DEFAULT 'unknown',
    last_checked  TEXT,
    last_renewed  TEXT,
    expires_at    TEXT
);
"#,
        revert: "DROP TABLE certificates;",
    },
    Migration {
        version: 5,
        name: "create_audit_and_alerts",
        apply: r#"
CREATE TABLE audit_events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    actor_id    INTEGER NOT NULL DEFAULT 0,
    actor_name  TEXT    NOT NULL DEFAULT '',
    action      TEXT    NOT NULL,
    target      TEXT    NOT NULL DEFAULT '',
    detail      TEXT    NOT NULL DEFAULT '',
    client_ip   TEXT    NOT NULL DEFAULT '',
    user_agent  TEXT    NOT NULL DEFAULT '',
    created_at  TEXT    NOT NULL
);
CREATE INDEX idx_audit_actor ON audit_events(actor_id);
CREATE INDEX idx_audit_created ON audit_events(created_at);
CREATE TABLE alerts (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    kind        TEXT    NOT NULL,
    observed    REAL    NOT NULL DEFAULT 0,
    threshold   REAL    NOT NULL DEFAULT 0,
    message     TEXT    NOT NULL DEFAULT '',
    created_at  TEXT    NOT NULL
);
"#,
        revert: "DROP TABLE alerts;\nDROP TABLE audit_events;",
    },
];

/// Apply every ledger entry not yet recorded, in order.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            name       TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );",
    )
    .execute(pool)
    .await
    .map_err(map_db_err)?;

    let applied: Vec<(i64,)> = sqlx::query_as("SELECT version FROM schema_migrations")
        .fetch_all(pool)
        .await
        .map_err(map_db_err)?;
    let applied: std::collections::HashSet<i64> = applied.into_iter().map(|(v,)| v).collect();

    for m in LEDGER {
        if applied.contains(&m.version) {
            continue;
        }
        let mut tx = pool.begin().await.map_err(map_db_err)?;
        sqlx::raw_sql(m.apply).execute(&mut *tx).await.map_err(|e| {
            Error::internal(format!("migration {} ({}) failed: {e}", m.version, m.name))
        })?;
        sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
            .bind(m.version)
            .bind(m.name)
            .bind(chrono::Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;
        tx.commit().await.map_err(map_db_err)?;
        tracing::info!(version = m.version, name = m.name, "migration applied");
    }
    Ok(())
}

/// Revert ledger entries above `target_version`, newest first.
pub async fn revert_to(pool: &SqlitePool, target_version: i64) -> Result<()> {
    for m in LEDGER.iter().rev() {
        if m.version <= target_version {
            break;
        }
        let recorded: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM schema_migrations WHERE version = ?")
                .bind(m.version)
                .fetch_optional(pool)
                .await
                .map_err(map_db_err)?;
        if recorded.is_none() {
            continue;
        }
        let mut tx = pool.begin().await.map_err(map_db_err)?;
        sqlx::raw_sql(m.revert).execute(&mut *tx).await.map_err(|e| {
            Error::internal(format!("revert {} ({}) failed: {e}", m.version, m.name))
        })?;
        sqlx::query("DELETE FROM schema_migrations WHERE version = ?")
            .bind(m.version)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;
        tx.commit().await.map_err(map_db_err)?;
        tracing::info!(version = m.version, name = m.name, "migration reverted");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn mem_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let pool = mem_pool().await;
        migrate(&pool).await.unwrap();
        migrate(&pool).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM schema_migrations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, LEDGER.len() as i64);
    }

    #[tokio::test]
    async fn ledger_versions_are_strictly_increasing() {
        let mut last = 0;
        for m in LEDGER {
            assert!(m.version > last, "ledger out of order at {}", m.name);
            last = m.version;
        }
    }

    #[tokio::test]
    async fn revert_unwinds_in_reverse_order() {
        let pool = mem_pool().await;
        migrate(&pool).await.unwrap();
        revert_to(&pool, 2).await.unwrap();

        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT version FROM schema_migrations ORDER BY version")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(rows, vec![(1,), (2,)]);

        // Dropped tables are really gone; surviving ones still answer.
        assert!(sqlx::query("SELECT COUNT(*) FROM certificates").fetch_one(&pool).await.is_err());
        sqlx::query("SELECT COUNT(*) FROM inbounds").fetch_one(&pool).await.unwrap();

        // Re-applying restores the full schema.
        migrate(&pool).await.unwrap();
        sqlx::query("SELECT COUNT(*) FROM certificates").fetch_one(&pool).await.unwrap();
    }
}
