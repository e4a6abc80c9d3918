use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::json;
use xpanel_config::Settings;

use crate::AppState;
use crate::error::{ApiResult, ok};
use crate::handlers::audit;
use crate::middleware::{AdminUser, ClientIp};

pub async fn get(State(state): State<AppState>, AdminUser(_): AdminUser) -> ApiResult {
    Ok(ok(state.settings.get()))
}

pub async fn put(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    ip: ClientIp,
    headers: HeaderMap,
    Json(candidate): Json<Settings>,
) -> ApiResult {
    state.settings.update(candidate)?;
    audit(&state, Some(&admin), ip, &headers, "settings.update", "settings".into(), String::new())
        .await;
    Ok(ok(state.settings.get()))
}

pub async fn get_section(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    Path(section): Path<String>,
) -> ApiResult {
    Ok(ok(state.settings.get().section(&section)?))
}

pub async fn put_section(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(section): Path<String>,
    ip: ClientIp,
    headers: HeaderMap,
    Json(value): Json<serde_json::Value>,
) -> ApiResult {
    state.settings.update_section(&section, value)?;
    audit(
        &state,
        Some(&admin),
        ip,
        &headers,
        "settings.update",
        format!("settings:{section}"),
        String::new(),
    )
    .await;
    Ok(ok(state.settings.get().section(&section)?))
}

pub async fn backup(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    ip: ClientIp,
    headers: HeaderMap,
) -> ApiResult {
    let path = state.settings.backup()?;
    audit(
        &state,
        Some(&admin),
        ip,
        &headers,
        "settings.backup",
        path.display().to_string(),
        String::new(),
    )
    .await;
    Ok(ok(json!({"snapshot": path.display().to_string()})))
}

#[derive(Deserialize)]
pub struct RestoreRequest {
    pub snapshot: String,
}

pub async fn restore(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    ip: ClientIp,
    headers: HeaderMap,
    Json(req): Json<RestoreRequest>,
) -> ApiResult {
    state.settings.restore(std::path::Path::new(&req.snapshot))?;
    audit(
        &state,
        Some(&admin),
        ip,
        &headers,
        "settings.restore",
        req.snapshot.clone(),
        String::new(),
    )
    .await;
    Ok(ok(state.settings.get()))
}
