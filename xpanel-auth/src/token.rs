//! Stateless bearer tokens.
//!
//! HS256 JWTs: an HMAC-SHA256 signature over the canonical claim encoding,
//! keyed by a process secret. Everything the middleware needs rides in the
//! claims, so validation touches no storage.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use xpanel_core::{Error, Result, UserId};

pub const TOKEN_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Owning user id.
    pub sub: UserId,
    pub name: String,
    pub admin: bool,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone)]
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenSigner {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl: Duration::hours(TOKEN_TTL_HOURS),
        }
    }

    /// Fresh random process secret for deployments that do not pin one.
    /// Tokens stop validating across a restart.
    pub fn ephemeral() -> Self {
        use rand::RngCore;
        let mut secret = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        Self::new(&secret)
    }

    pub fn mint(&self, user_id: UserId, username: &str, admin: bool) -> Result<String> {
        self.mint_at(user_id, username, admin, Utc::now())
    }

    pub fn mint_at(
        &self,
        user_id: UserId,
        username: &str,
        admin: bool,
        issued_at: DateTime<Utc>,
    ) -> Result<String> {
        let claims = Claims {
            sub: user_id,
            name: username.to_string(),
            admin,
            iat: issued_at.timestamp(),
            exp: (issued_at + self.ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::internal(format!("token encode: {e}")))
    }

    /// Decode and verify. Expired or malformed tokens fail uniformly.
    pub fn validate(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|_| Error::unauthorized("invalid or expired token"))
    }
}
