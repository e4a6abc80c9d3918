//! Authentication and session core.
//!
//! Credential validation with salted PBKDF2 hashing, lockout on repeated
//! failure, and stateless HS256 bearer tokens. The per-user state machine:
//! `active → (5 failed logins) → locked → (lockout expiry) → active`;
//! admin-disabled and expired accounts never transition out through login.

pub mod password;
mod token;

pub use token::{Claims, TOKEN_TTL_HOURS, TokenSigner};

use chrono::{DateTime, Duration, Utc};
use xpanel_core::{Error, Result, UserId};
use xpanel_store::{Store, User};

/// Failures before the account locks.
pub const MAX_FAILED_LOGINS: i64 = 5;
/// How long a lockout lasts.
pub const LOCKOUT_MINUTES: i64 = 30;

/// Uniform credential failure. Never reveals whether the username exists.
fn invalid_credentials() -> Error {
    Error::unauthorized("invalid username or password")
}

#[derive(Clone)]
pub struct AuthService {
    store: Store,
    signer: TokenSigner,
}

impl AuthService {
    pub fn new(store: Store, signer: TokenSigner) -> Self {
        Self { store, signer }
    }

    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    /// Fresh hash + salt pair for a new credential.
    pub fn new_credential(password: &str) -> Result<(String, String)> {
        let salt = password::generate_salt();
        let hash = password::hash_password(password, &salt)?;
        Ok((hash, salt))
    }

    /// Exchange credentials for a session token.
    pub async fn login(&self, username: &str, password: &str) -> Result<(User, String)> {
        self.login_at(username, password, Utc::now()).await
    }

    /// Clock-injected variant; `login` delegates here.
    pub async fn login_at(
        &self,
        username: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> Result<(User, String)> {
        let mut user = match self.store.user_by_username(username).await {
            Ok(u) => u,
            Err(Error::NotFound { .. }) => return Err(invalid_credentials()),
            Err(e) => return Err(e),
        };

        if let Some(locked_until) = user.locked_until {
            if locked_until > now {
                tracing::warn!(username, "login rejected: account locked");
                return Err(Error::forbidden("account locked, try again later"));
            }
        }
        if let Some(expires_at) = user.expires_at {
            if expires_at <= now {
                return Err(Error::forbidden("account expired"));
            }
        }
        if !user.enabled {
            return Err(Error::forbidden("account disabled"));
        }

        if !password::verify_password(password, &user.password_salt, &user.password_hash) {
            user.failed_logins += 1;
            let locked_until = if user.failed_logins >= MAX_FAILED_LOGINS {
                tracing::warn!(username, "account locked after repeated failures");
                Some(now + Duration::minutes(LOCKOUT_MINUTES))
            } else {
                None
            };
            self.store
                .record_login_attempt(user.id, user.failed_logins, locked_until, None)
                .await?;
            return Err(invalid_credentials());
        }

        // Success: clear the failure state and stamp the login.
        self.store
            .record_login_attempt(user.id, 0, None, Some(now))
            .await?;
        user.failed_logins = 0;
        user.locked_until = None;
        user.last_login = Some(now);

        let token = self.signer.mint(user.id, &user.username, user.is_admin)?;
        Ok((user, token))
    }

    /// Decode a bearer token into its claims.
    pub fn validate(&self, token: &str) -> Result<Claims> {
        self.signer.validate(token)
    }

    /// Verify the old password, then replace hash and salt atomically.
    pub async fn change_password(
        &self,
        user_id: UserId,
        old_password: &str,
        new_password: &str,
    ) -> Result<()> {
        if new_password.len() < 6 {
            return Err(Error::bad_request("new password must be at least 6 characters"));
        }
        let user = self.store.user_by_id(user_id).await?;
        if !password::verify_password(old_password, &user.password_salt, &user.password_hash) {
            return Err(invalid_credentials());
        }
        let (hash, salt) = Self::new_credential(new_password)?;
        self.store.update_credential(user_id, &hash, &salt).await?;
        tracing::info!(user = user.username, "password changed");
        Ok(())
    }

    /// Replace the credential with a generated password. Returns the cleartext
    /// once so the caller can deliver it; it is never stored or logged.
    pub async fn reset_password(&self, user_id: UserId) -> Result<String> {
        let user = self.store.user_by_id(user_id).await?;
        let generated = password::generate_password();
        let (hash, salt) = Self::new_credential(&generated)?;
        self.store.update_credential(user_id, &hash, &salt).await?;
        tracing::info!(user = user.username, "password reset");
        Ok(generated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xpanel_store::NewUser;

    async fn service_with_user(enabled: bool, expires_at: Option<DateTime<Utc>>) -> AuthService {
        let store = Store::open_in_memory().await.unwrap();
        let (hash, salt) = AuthService::new_credential("admin").unwrap();
        let mut user = store
            .create_user(NewUser {
                username: "admin".into(),
                email: "admin@example.com".into(),
                password_hash: hash,
                password_salt: salt,
                is_admin: true,
                quota_bytes: 0,
                expires_at,
            })
            .await
            .unwrap();
        if !enabled {
            user.enabled = false;
            store.update_user(&user).await.unwrap();
        }
        AuthService::new(store, TokenSigner::ephemeral())
    }

    #[tokio::test]
    async fn login_mints_valid_token() {
        let auth = service_with_user(true, None).await;
        let (user, token) = auth.login("admin", "admin").await.unwrap();
        assert!(user.last_login.is_some());
        let claims = auth.validate(&token).unwrap();
        assert_eq!(claims.sub, user.id);
        assert!(claims.admin);
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_look_identical() {
        let auth = service_with_user(true, None).await;
        let a = auth.login("admin", "wrong").await.unwrap_err();
        let b = auth.login("nobody", "whatever").await.unwrap_err();
        assert_eq!(a.status(), 401);
        assert_eq!(a.to_string(), b.to_string());
    }

    #[tokio::test]
    async fn five_failures_lock_even_the_right_password() {
        let auth = service_with_user(true, None).await;
        for _ in 0..5 {
            let err = auth.login("admin", "wrong").await.unwrap_err();
            assert_eq!(err.status(), 401);
        }
        // Sixth attempt with the CORRECT password is still rejected as locked.
        let err = auth.login("admin", "admin").await.unwrap_err();
        assert_eq!(err.status(), 403);
        assert!(err.to_string().contains("locked"));
    }

    #[tokio::test]
    async fn success_before_fifth_failure_resets_counter() {
        let auth = service_with_user(true, None).await;
        for _ in 0..4 {
            auth.login("admin", "wrong").await.unwrap_err();
        }
        auth.login("admin", "admin").await.unwrap();
        // Counter was zeroed: four more failures still do not lock.
        for _ in 0..4 {
            auth.login("admin", "wrong").await.unwrap_err();
        }
        auth.login("admin", "admin").await.unwrap();
    }

    #[tokio::test]
    async fn lockout_expires_after_thirty_minutes() {
        let auth = service_with_user(true, None).await;
        let t0 = Utc::now();
        for _ in 0..5 {
            auth.login_at("admin", "wrong", t0).await.unwrap_err();
        }
        let during = auth.login_at("admin", "admin", t0 + Duration::minutes(29)).await;
        assert_eq!(during.unwrap_err().status(), 403);

        let after = auth.login_at("admin", "admin", t0 + Duration::minutes(31)).await;
        assert!(after.is_ok());
    }

    #[tokio::test]
    async fn disabled_and_expired_accounts_never_log_in() {
        let auth = service_with_user(false, None).await;
        assert_eq!(auth.login("admin", "admin").await.unwrap_err().status(), 403);

        let auth = service_with_user(true, Some(Utc::now() - Duration::days(1))).await;
        let err = auth.login("admin", "admin").await.unwrap_err();
        assert_eq!(err.status(), 403);
        assert!(err.to_string().contains("expired"));
    }

    #[tokio::test]
    async fn change_password_requires_old() {
        let auth = service_with_user(true, None).await;
        let (user, _) = auth.login("admin", "admin").await.unwrap();

        let err = auth.change_password(user.id, "bad-old", "newpass").await.unwrap_err();
        assert_eq!(err.status(), 401);

        auth.change_password(user.id, "admin", "newpass").await.unwrap();
        auth.login("admin", "newpass").await.unwrap();
        assert_eq!(auth.login("admin", "admin").await.unwrap_err().status(), 401);
    }

    #[tokio::test]
    async fn reset_password_issues_usable_credential() {
        let auth = service_with_user(true, None).await;
        let (user, _) = auth.login("admin", "admin").await.unwrap();

        let generated = auth.reset_password(user.id).await.unwrap();
        assert_eq!(generated.len(), 12);
        auth.login("admin", &generated).await.unwrap();
    }
}
