use axum::extract::{Query, State};
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::json;
use xpanel_notify::{Notification, NotificationKind};

use crate::AppState;
use crate::error::{ApiError, ApiResult, ok};
use crate::handlers::audit;
use crate::middleware::{AdminUser, AuthUser, ClientIp};

/// Static host facts plus the engine's current state.
pub async fn info(State(state): State<AppState>, _user: AuthUser) -> ApiResult {
    use sysinfo::System;
    Ok(ok(json!({
        "hostname": System::host_name(),
        "os": System::long_os_version(),
        "kernel": System::kernel_version(),
        "arch": std::env::consts::ARCH,
        "panel_version": env!("CARGO_PKG_VERSION"),
        "engine_version": state.engine.active_version().await,
        "engine_state": state.engine.state().await.as_str(),
    })))
}

/// Live snapshot; computed per request, never persisted.
pub async fn stats(State(state): State<AppState>, _user: AuthUser) -> ApiResult {
    Ok(ok(state.monitor.snapshot()))
}

#[derive(Deserialize)]
pub struct AlertsQuery {
    #[serde(default = "default_alert_limit")]
    pub limit: i64,
}

fn default_alert_limit() -> i64 {
    100
}

pub async fn alerts(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(q): Query<AlertsQuery>,
) -> ApiResult {
    Ok(ok(json!({"items": state.store.list_alerts(q.limit).await?})))
}

/// Emit a test notification to the configured admin address.
pub async fn alerts_test(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    ip: ClientIp,
    headers: HeaderMap,
) -> ApiResult {
    let settings = state.settings.get();
    if settings.admin.email.is_empty() {
        return Err(ApiError(xpanel_core::Error::bad_request(
            "admin.email is not configured",
        )));
    }
    state.queue.enqueue(Notification::new(
        NotificationKind::Test,
        vec![settings.admin.email],
        "xpanel test notification",
        "<p>If you can read this, notification delivery works.</p>",
    ));
    audit(&state, Some(&admin), ip, &headers, "system.alert_test", "notification".into(), String::new())
        .await;
    Ok(ok(json!({"enqueued": true})))
}
