use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use crate::AppState;
use crate::error::{ApiError, ApiResult, ok};
use crate::handlers::audit;
use crate::middleware::{AdminUser, ClientIp};

pub async fn list(State(state): State<AppState>, AdminUser(_): AdminUser) -> ApiResult {
    Ok(ok(json!({"items": state.certs.list()})))
}

pub async fn get(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    Path(domain): Path<String>,
) -> ApiResult {
    Ok(ok(state.certs.get(&domain)?))
}

#[derive(Deserialize)]
pub struct CreateCertRequest {
    pub domain: String,
}

pub async fn create(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    ip: ClientIp,
    headers: HeaderMap,
    Json(req): Json<CreateCertRequest>,
) -> Result<Response, ApiError> {
    let cert = state.certs.create(&req.domain).await?;
    audit(
        &state,
        Some(&admin),
        ip,
        &headers,
        "certificate.create",
        format!("certificate:{}", cert.domain),
        String::new(),
    )
    .await;
    Ok((StatusCode::CREATED, ok(cert)).into_response())
}

pub async fn delete(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(domain): Path<String>,
    ip: ClientIp,
    headers: HeaderMap,
) -> ApiResult {
    state.certs.delete(&domain).await?;
    audit(
        &state,
        Some(&admin),
        ip,
        &headers,
        "certificate.delete",
        format!("certificate:{domain}"),
        String::new(),
    )
    .await;
    Ok(ok(json!({"deleted": domain})))
}

pub async fn renew(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(domain): Path<String>,
    ip: ClientIp,
    headers: HeaderMap,
) -> ApiResult {
    let cert = state.certs.renew(&domain).await?;
    audit(
        &state,
        Some(&admin),
        ip,
        &headers,
        "certificate.renew",
        format!("certificate:{domain}"),
        String::new(),
    )
    .await;
    Ok(ok(cert))
}
