use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use xpanel_core::{Error, InboundId, Protocol, Result, UserId};

/// A panel identity. `quota_bytes == 0` means unlimited; nullable instants
/// distinguish "no value yet" from any real point in time.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    #[serde(skip_serializing)]
    pub password_salt: String,
    pub is_admin: bool,
    pub enabled: bool,
    pub quota_bytes: i64,
    pub used_bytes: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_login: Option<DateTime<Utc>>,
    pub failed_logins: i64,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub password_salt: String,
    pub is_admin: bool,
    pub quota_bytes: i64,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A declared proxy listener, realized at runtime by the child engine.
#[derive(Debug, Clone, Serialize)]
pub struct Inbound {
    pub id: InboundId,
    pub user_id: UserId,
    pub name: String,
    pub protocol: Protocol,
    pub port: u16,
    pub settings: serde_json::Value,
    pub enabled: bool,
    pub quota_bytes: i64,
    pub used_bytes: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewInbound {
    pub user_id: UserId,
    pub name: String,
    pub protocol: Protocol,
    pub port: u16,
    #[serde(default)]
    pub settings: serde_json::Value,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub quota_bytes: i64,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

/// Raw row shape; `protocol` and `settings` are TEXT columns.
#[derive(FromRow)]
pub(crate) struct InboundRow {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub protocol: String,
    pub port: i64,
    pub settings: String,
    pub enabled: bool,
    pub quota_bytes: i64,
    pub used_bytes: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<InboundRow> for Inbound {
    type Error = Error;

    fn try_from(r: InboundRow) -> Result<Self> {
        Ok(Inbound {
            id: r.id,
            user_id: r.user_id,
            name: r.name,
            protocol: r.protocol.parse()?,
            port: u16::try_from(r.port)
                .map_err(|_| Error::internal(format!("stored port {} out of range", r.port)))?,
            settings: serde_json::from_str(&r.settings)
                .map_err(|e| Error::internal(format!("stored settings: {e}")))?,
            enabled: r.enabled,
            quota_bytes: r.quota_bytes,
            used_bytes: r.used_bytes,
            expires_at: r.expires_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

/// Running telemetry for one inbound; created lazily on first sample.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct InboundStats {
    pub inbound_id: InboundId,
    pub user_id: UserId,
    pub upstream_bytes: i64,
    pub downstream_bytes: i64,
    pub last_active: DateTime<Utc>,
}

/// Immutable day bucket written at UTC rollover.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct DailyStats {
    pub id: i64,
    pub user_id: UserId,
    pub date: NaiveDate,
    pub upstream_bytes: i64,
    pub downstream_bytes: i64,
    pub total_bytes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertStatus {
    Valid,
    ExpiringSoon,
    Expired,
    Error,
    Unknown,
}

impl CertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertStatus::Valid => "valid",
            CertStatus::ExpiringSoon => "expiring_soon",
            CertStatus::Expired => "expired",
            CertStatus::Error => "error",
            CertStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "valid" => Ok(CertStatus::Valid),
            "expiring_soon" => Ok(CertStatus::ExpiringSoon),
            "expired" => Ok(CertStatus::Expired),
            "error" => Ok(CertStatus::Error),
            "unknown" => Ok(CertStatus::Unknown),
            other => Err(Error::internal(format!("stored cert status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Certificate {
    pub id: i64,
    pub domain: String,
    pub cert_path: String,
    pub key_path: String,
    pub status: CertStatus,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_renewed: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewCertificate {
    pub domain: String,
    pub cert_path: String,
    pub key_path: String,
}

#[derive(FromRow)]
pub(crate) struct CertificateRow {
    pub id: i64,
    pub domain: String,
    pub cert_path: String,
    pub key_path: String,
    pub status: String,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_renewed: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<CertificateRow> for Certificate {
    type Error = Error;

    fn try_from(r: CertificateRow) -> Result<Self> {
        Ok(Certificate {
            id: r.id,
            domain: r.domain,
            cert_path: r.cert_path,
            key_path: r.key_path,
            status: CertStatus::parse(&r.status)?,
            last_checked: r.last_checked,
            last_renewed: r.last_renewed,
            expires_at: r.expires_at,
        })
    }
}

/// Append-only audit trail entry.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AuditEvent {
    pub id: i64,
    pub actor_id: UserId,
    pub actor_name: String,
    pub action: String,
    pub target: String,
    pub detail: String,
    pub client_ip: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewAuditEvent {
    pub actor_id: UserId,
    pub actor_name: String,
    pub action: String,
    pub target: String,
    pub detail: String,
    pub client_ip: String,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AlertRecord {
    pub id: i64,
    pub kind: String,
    pub observed: f64,
    pub threshold: f64,
    pub message: String,
    pub created_at: DateTime<Utc>,
}
