//! Persistent state for the panel: users, inbounds, traffic counters,
//! certificates, audit events, and alerts, all in a single SQLite file.
//!
//! Reads return the entity or a `NotFound` failure, never an empty zero
//! value. Writes are atomic; multi-step invariants (delta append + quota
//! enforcement, daily rollover) run through [`StoreTx`] so they commit or
//! roll back as one unit. Schema evolution goes through the numbered
//! migration ledger in [`migrations`].

mod audit;
mod certs;
mod inbounds;
pub mod migrations;
mod model;
mod stats;
mod tx;
mod users;

pub use audit::AuditQuery;
pub use model::{
    AlertRecord, AuditEvent, CertStatus, Certificate, DailyStats, Inbound, InboundStats,
    NewAuditEvent, NewCertificate, NewInbound, NewUser, User,
};
pub use tx::StoreTx;

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use xpanel_core::{Error, Result};

/// Handle to the embedded database. Cheap to clone; all components share one.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if necessary) the database file and bring the schema up
    /// to the current ledger version.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        Self::open_with(opts).await
    }

    /// In-memory database for tests. A single connection keeps the schema
    /// alive for the handle's lifetime.
    pub async fn open_in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(map_db_err)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(map_db_err)?;
        migrations::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn open_with(opts: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await
            .map_err(map_db_err)?;
        migrations::migrate(&pool).await?;
        Ok(Self { pool })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin an explicit transaction for multi-step invariants.
    pub async fn begin(&self) -> Result<StoreTx> {
        let tx = self.pool.begin().await.map_err(map_db_err)?;
        Ok(StoreTx::new(tx))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Translate driver failures into the panel taxonomy. Uniqueness violations
/// become `Conflict`; a missing row stays `NotFound` at the call sites that
/// know the resource name.
pub(crate) fn map_db_err(e: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return Error::conflict(db.message().to_string());
        }
    }
    Error::internal(format!("database: {e}"))
}

/// `query_as` helper: absent row becomes `NotFound { resource }`.
pub(crate) fn row_or_not_found<T>(
    row: std::result::Result<Option<T>, sqlx::Error>,
    resource: &'static str,
) -> Result<T> {
    match row {
        Ok(Some(v)) => Ok(v),
        Ok(None) => Err(Error::not_found(resource)),
        Err(e) => Err(map_db_err(e)),
    }
}
