use chrono::{DateTime, Utc};
use xpanel_core::{Result, UserId};

use crate::{map_db_err, model::NewUser, model::User, row_or_not_found, Store};

const USER_COLUMNS: &str = "id, username, email, password_hash, password_salt, is_admin, enabled, \
     quota_bytes, used_bytes, expires_at, last_login, failed_logins, locked_until, \
     created_at, updated_at";

impl Store {
    pub async fn create_user(&self, new: NewUser) -> Result<User> {
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO users (username, email, password_hash, password_salt, is_admin, \
             quota_bytes, expires_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&new.username)
        .bind(&new.email)
        .bind(&new.password_hash)
        .bind(&new.password_salt)
        .bind(new.is_admin)
        .bind(new.quota_bytes)
        .bind(new.expires_at)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(map_db_err)?
        .last_insert_rowid();

        self.user_by_id(id).await
    }

    pub async fn user_by_id(&self, id: UserId) -> Result<User> {
        let row = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await;
        row_or_not_found(row, "user")
    }

    pub async fn user_by_username(&self, username: &str) -> Result<User> {
        let row = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = ?"
        ))
        .bind(username)
        .fetch_optional(self.pool())
        .await;
        row_or_not_found(row, "user")
    }

    pub async fn user_by_email(&self, email: &str) -> Result<User> {
        let row = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = ?"
        ))
        .bind(email)
        .fetch_optional(self.pool())
        .await;
        row_or_not_found(row, "user")
    }

    /// Persist every mutable field of the user. The row must exist.
    pub async fn update_user(&self, user: &User) -> Result<()> {
        let affected = sqlx::query(
            "UPDATE users SET username = ?, email = ?, password_hash = ?, password_salt = ?, \
             is_admin = ?, enabled = ?, quota_bytes = ?, used_bytes = ?, expires_at = ?, \
             last_login = ?, failed_logins = ?, locked_until = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.password_salt)
        .bind(user.is_admin)
        .bind(user.enabled)
        .bind(user.quota_bytes)
        .bind(user.used_bytes)
        .bind(user.expires_at)
        .bind(user.last_login)
        .bind(user.failed_logins)
        .bind(user.locked_until)
        .bind(Utc::now())
        .bind(user.id)
        .execute(self.pool())
        .await
        .map_err(map_db_err)?
        .rows_affected();

        if affected == 0 {
            return Err(xpanel_core::Error::not_found("user"));
        }
        Ok(())
    }

    /// Record a login attempt outcome without racing other credential writes.
    pub async fn record_login_attempt(
        &self,
        id: UserId,
        failed_logins: i64,
        locked_until: Option<DateTime<Utc>>,
        last_login: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE users SET failed_logins = ?, locked_until = ?, \
             last_login = COALESCE(?, last_login), updated_at = ? WHERE id = ?",
        )
        .bind(failed_logins)
        .bind(locked_until)
        .bind(last_login)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    /// Replace hash and salt as one statement.
    pub async fn update_credential(
        &self,
        id: UserId,
        password_hash: &str,
        password_salt: &str,
    ) -> Result<()> {
        let affected = sqlx::query(
            "UPDATE users SET password_hash = ?, password_salt = ?, updated_at = ? WHERE id = ?",
        )
        .bind(password_hash)
        .bind(password_salt)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(map_db_err)?
        .rows_affected();

        if affected == 0 {
            return Err(xpanel_core::Error::not_found("user"));
        }
        Ok(())
    }

    pub async fn delete_user(&self, id: UserId) -> Result<()> {
        let affected = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(map_db_err)?
            .rows_affected();
        if affected == 0 {
            return Err(xpanel_core::Error::not_found("user"));
        }
        Ok(())
    }

    pub async fn list_users(&self, offset: i64, limit: i64) -> Result<Vec<User>> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY id LIMIT ? OFFSET ?"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)
    }

    pub async fn count_users(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
            .fetch_one(self.pool())
            .await
            .map_err(map_db_err)?;
        Ok(n)
    }
}
