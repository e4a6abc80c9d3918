use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::json;

use crate::AppState;
use crate::error::{ApiResult, ok};
use crate::handlers::audit;
use crate::middleware::{AuthUser, ClientIp};

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Exchange credentials for a bearer token.
pub async fn login(
    State(state): State<AppState>,
    ip: ClientIp,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> ApiResult {
    match state.auth.login(&req.username, &req.password).await {
        Ok((user, token)) => {
            audit(
                &state,
                Some(&AuthUser { id: user.id, username: user.username.clone(), is_admin: user.is_admin }),
                ip,
                &headers,
                "auth.login",
                format!("user:{}", user.id),
                String::new(),
            )
            .await;
            Ok(ok(json!({
                "token": token,
                "user": {
                    "id": user.id,
                    "username": user.username,
                    "email": user.email,
                    "is_admin": user.is_admin,
                }
            })))
        }
        Err(e) => {
            // Failed attempts are audited without revealing which part failed.
            audit(
                &state,
                None,
                ip,
                &headers,
                "auth.login_failed",
                format!("username:{}", req.username),
                String::new(),
            )
            .await;
            Err(e.into())
        }
    }
}

/// Best-effort logout: tokens are stateless, so this only audits the intent.
pub async fn logout(
    State(state): State<AppState>,
    user: AuthUser,
    ip: ClientIp,
    headers: HeaderMap,
) -> ApiResult {
    audit(&state, Some(&user), ip, &headers, "auth.logout", format!("user:{}", user.id), String::new())
        .await;
    Ok(ok(json!({"logged_out": true})))
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

pub async fn change_password(
    State(state): State<AppState>,
    user: AuthUser,
    ip: ClientIp,
    headers: HeaderMap,
    Json(req): Json<ChangePasswordRequest>,
) -> ApiResult {
    state
        .auth
        .change_password(user.id, &req.old_password, &req.new_password)
        .await?;
    audit(
        &state,
        Some(&user),
        ip,
        &headers,
        "auth.change_password",
        format!("user:{}", user.id),
        String::new(),
    )
    .await;
    Ok(ok(json!({"changed": true})))
}
