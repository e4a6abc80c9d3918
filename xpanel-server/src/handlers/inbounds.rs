use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use xpanel_core::{Error, InboundId, Protocol};
use xpanel_store::{Inbound, NewInbound};

use crate::AppState;
use crate::error::{ApiError, ApiResult, ok};
use crate::handlers::{audit, double_option};
use crate::middleware::{AdminUser, AuthUser, ClientIp};
use crate::share;

#[derive(Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

/// Admins see every inbound (paginated); other sessions see their own.
pub async fn list(
    State(state): State<AppState>,
    user: AuthUser,
    Query(page): Query<PageQuery>,
) -> ApiResult {
    if user.is_admin {
        let items = state.store.list_inbounds(page.offset, page.limit.clamp(1, 500)).await?;
        let total = state.store.count_inbounds().await?;
        Ok(ok(json!({
            "items": items,
            "total": total,
            "offset": page.offset,
            "limit": page.limit,
        })))
    } else {
        let items = state.store.inbounds_by_user(user.id).await?;
        let total = items.len();
        Ok(ok(json!({"items": items, "total": total, "offset": 0, "limit": total})))
    }
}

async fn owned_inbound(state: &AppState, user: &AuthUser, id: InboundId) -> Result<Inbound, ApiError> {
    let inbound = state.store.inbound_by_id(id).await?;
    if !user.is_admin && inbound.user_id != user.id {
        return Err(ApiError(Error::forbidden("not the owner of this inbound")));
    }
    Ok(inbound)
}

pub async fn get(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<InboundId>,
) -> ApiResult {
    let inbound = owned_inbound(&state, &user, id).await?;
    Ok(ok(inbound))
}

#[derive(Deserialize)]
pub struct CreateInboundRequest {
    /// Owner; defaults to the calling admin.
    pub user_id: Option<i64>,
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

pub async fn create(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    ip: ClientIp,
    headers: HeaderMap,
    Json(req): Json<CreateInboundRequest>,
) -> Result<Response, ApiError> {
    let inbound = state
        .store
        .create_inbound(NewInbound {
            user_id: req.user_id.unwrap_or(admin.id),
            name: req.name,
            protocol: req.protocol,
            port: req.port,
            settings: req.settings,
            enabled: req.enabled,
            quota_bytes: req.quota_bytes,
            expires_at: req.expires_at,
        })
        .await?;

    audit(
        &state,
        Some(&admin),
        ip,
        &headers,
        "inbound.create",
        format!("inbound:{}", inbound.id),
        format!("{} on port {}", inbound.protocol, inbound.port),
    )
    .await;
    state.request_reconcile();
    Ok((StatusCode::CREATED, ok(inbound)).into_response())
}

/// Partial update; absent fields keep their stored value.
#[derive(Deserialize)]
pub struct UpdateInboundRequest {
    pub name: Option<String>,
    pub port: Option<u16>,
    pub settings: Option<serde_json::Value>,
    pub enabled: Option<bool>,
    pub quota_bytes: Option<i64>,
    #[serde(default, deserialize_with = "double_option::deserialize")]
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

pub async fn update(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<InboundId>,
    ip: ClientIp,
    headers: HeaderMap,
    Json(req): Json<UpdateInboundRequest>,
) -> ApiResult {
    let mut inbound = state.store.inbound_by_id(id).await?;
    if let Some(name) = req.name {
        inbound.name = name;
    }
    if let Some(port) = req.port {
        inbound.port = port;
    }
    if let Some(settings) = req.settings {
        inbound.settings = settings;
    }
    if let Some(enabled) = req.enabled {
        inbound.enabled = enabled;
    }
    if let Some(quota) = req.quota_bytes {
        inbound.quota_bytes = quota;
    }
    if let Some(expires) = req.expires_at {
        inbound.expires_at = expires;
    }
    state.store.update_inbound(&inbound).await?;

    audit(
        &state,
        Some(&admin),
        ip,
        &headers,
        "inbound.update",
        format!("inbound:{id}"),
        String::new(),
    )
    .await;
    state.request_reconcile();
    Ok(ok(state.store.inbound_by_id(id).await?))
}

pub async fn delete(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<InboundId>,
    ip: ClientIp,
    headers: HeaderMap,
) -> ApiResult {
    state.store.delete_inbound(id).await?;
    audit(
        &state,
        Some(&admin),
        ip,
        &headers,
        "inbound.delete",
        format!("inbound:{id}"),
        String::new(),
    )
    .await;
    state.request_reconcile();
    Ok(ok(json!({"deleted": id})))
}

/// Hostname the panel was reached on, for share URIs lacking an explicit host.
fn request_host(headers: &HeaderMap) -> String {
    headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_string())
        .unwrap_or_else(|| "localhost".to_string())
}

pub async fn link(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<InboundId>,
    headers: HeaderMap,
) -> ApiResult {
    let inbound = owned_inbound(&state, &user, id).await?;
    let uri = share::share_uri(&inbound, &request_host(&headers))?;
    Ok(ok(json!({"link": uri})))
}

pub async fn qrcode(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<InboundId>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let inbound = owned_inbound(&state, &user, id).await?;
    let uri = share::share_uri(&inbound, &request_host(&headers))?;
    let svg = share::share_qr_svg(&uri)?;
    Ok((
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "image/svg+xml")],
        svg,
    )
        .into_response())
}
