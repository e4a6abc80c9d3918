use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use xpanel_auth::AuthService;
use xpanel_core::{Error, UserId};
use xpanel_notify::{Notification, NotificationKind};
use xpanel_store::NewUser;

use crate::AppState;
use crate::error::{ApiError, ApiResult, ok};
use crate::handlers::audit;
use crate::handlers::inbounds::PageQuery;
use crate::middleware::{AdminUser, ClientIp};

pub async fn list(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    Query(page): Query<PageQuery>,
) -> ApiResult {
    let items = state.store.list_users(page.offset, page.limit.clamp(1, 500)).await?;
    let total = state.store.count_users().await?;
    Ok(ok(json!({"items": items, "total": total, "offset": page.offset, "limit": page.limit})))
}

pub async fn get(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    Path(id): Path<UserId>,
) -> ApiResult {
    Ok(ok(state.store.user_by_id(id).await?))
}

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub quota_bytes: i64,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

pub async fn create(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    ip: ClientIp,
    headers: HeaderMap,
    Json(req): Json<CreateUserRequest>,
) -> Result<Response, ApiError> {
    if req.username.trim().is_empty() || req.email.trim().is_empty() {
        return Err(ApiError(Error::bad_request("username and email are required")));
    }
    if req.password.len() < 6 {
        return Err(ApiError(Error::bad_request("password must be at least 6 characters")));
    }
    let (hash, salt) = AuthService::new_credential(&req.password)?;
    let user = state
        .store
        .create_user(NewUser {
            username: req.username,
            email: req.email,
            password_hash: hash,
            password_salt: salt,
            is_admin: req.is_admin,
            quota_bytes: req.quota_bytes,
            expires_at: req.expires_at,
        })
        .await?;

    audit(
        &state,
        Some(&admin),
        ip,
        &headers,
        "user.create",
        format!("user:{}", user.id),
        user.username.clone(),
    )
    .await;
    Ok((StatusCode::CREATED, ok(user)).into_response())
}

#[derive(Deserialize)]
pub struct UpdateUserRequest {
    pub email: Option<String>,
    pub enabled: Option<bool>,
    pub is_admin: Option<bool>,
    pub quota_bytes: Option<i64>,
    #[serde(default, deserialize_with = "crate::handlers::double_option::deserialize")]
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

pub async fn update(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<UserId>,
    ip: ClientIp,
    headers: HeaderMap,
    Json(req): Json<UpdateUserRequest>,
) -> ApiResult {
    let mut user = state.store.user_by_id(id).await?;
    if let Some(email) = req.email {
        user.email = email;
    }
    if let Some(enabled) = req.enabled {
        user.enabled = enabled;
    }
    if let Some(is_admin) = req.is_admin {
        user.is_admin = is_admin;
    }
    if let Some(quota) = req.quota_bytes {
        user.quota_bytes = quota;
    }
    if let Some(expires) = req.expires_at {
        user.expires_at = expires;
    }
    state.store.update_user(&user).await?;

    audit(&state, Some(&admin), ip, &headers, "user.update", format!("user:{id}"), String::new())
        .await;
    Ok(ok(state.store.user_by_id(id).await?))
}

pub async fn delete(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<UserId>,
    ip: ClientIp,
    headers: HeaderMap,
) -> ApiResult {
    if admin.id == id {
        return Err(ApiError(Error::bad_request("cannot delete your own account")));
    }
    state.store.delete_user(id).await?;
    audit(&state, Some(&admin), ip, &headers, "user.delete", format!("user:{id}"), String::new())
        .await;
    state.request_reconcile();
    Ok(ok(json!({"deleted": id})))
}

/// Replace the credential with a generated password and mail it to the user.
pub async fn reset_password(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<UserId>,
    ip: ClientIp,
    headers: HeaderMap,
) -> ApiResult {
    let user = state.store.user_by_id(id).await?;
    let generated = state.auth.reset_password(id).await?;

    state.queue.enqueue(Notification::new(
        NotificationKind::PasswordReset,
        vec![user.email.clone()],
        "Your panel password was reset",
        format!(
            "<p>A new password was generated for account <b>{}</b>: <code>{generated}</code></p>\
             <p>Change it after your next login.</p>",
            user.username
        ),
    ));
    audit(
        &state,
        Some(&admin),
        ip,
        &headers,
        "user.reset_password",
        format!("user:{id}"),
        String::new(),
    )
    .await;
    Ok(ok(json!({"reset": true})))
}
