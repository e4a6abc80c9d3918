use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the whole panel.
///
/// Every failure a handler or background loop can surface maps to exactly one
/// of these kinds. Each kind carries a stable numeric code (HTTP status × 100
/// plus a discriminator, so `QuotaExceeded` stays distinguishable from a
/// plain `Forbidden`) and the HTTP status the management API answers with.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input or an invalid field value.
    #[error("{0}")]
    BadRequest(String),

    /// Missing or invalid session token.
    #[error("{0}")]
    Unauthorized(String),

    /// Valid token, insufficient role, or a locked/disabled/expired account.
    #[error("{0}")]
    Forbidden(String),

    /// Target entity absent.
    #[error("{resource} not found")]
    NotFound { resource: &'static str },

    /// Uniqueness violation (port, username, email, domain) or concurrent
    /// state change.
    #[error("{0}")]
    Conflict(String),

    /// Traffic quota or account expiry reached.
    #[error("{0}")]
    QuotaExceeded(String),

    /// An external collaborator failed: ACME directory, SMTP relay, binary
    /// download, or the child engine refusing to start.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// Invariant violation or an unexpected internal failure. Details are
    /// logged, never returned to clients.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Error::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Error::Unauthorized(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Error::Forbidden(msg.into())
    }

    pub fn not_found(resource: &'static str) -> Self {
        Error::NotFound { resource }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    pub fn quota_exceeded(msg: impl Into<String>) -> Self {
        Error::QuotaExceeded(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Error::Upstream(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Stable machine-readable code, independent of the display message.
    pub fn code(&self) -> u32 {
        match self {
            Error::BadRequest(_) => 40000,
            Error::Unauthorized(_) => 40100,
            Error::Forbidden(_) => 40300,
            Error::QuotaExceeded(_) => 40301,
            Error::NotFound { .. } => 40400,
            Error::Conflict(_) => 40900,
            Error::Upstream(_) => 50200,
            Error::Internal(_) => 50000,
        }
    }

    /// HTTP status the management API maps this kind to.
    pub fn status(&self) -> u16 {
        match self {
            Error::BadRequest(_) => 400,
            Error::Unauthorized(_) => 401,
            Error::Forbidden(_) | Error::QuotaExceeded(_) => 403,
            Error::NotFound { .. } => 404,
            Error::Conflict(_) => 409,
            Error::Upstream(_) => 502,
            Error::Internal(_) => 500,
        }
    }

    /// True for kinds a caller may retry after a backoff. Quota and conflict
    /// failures are never retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Upstream(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::BadRequest(format!("invalid JSON: {e}"))
    }
}
