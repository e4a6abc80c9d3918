use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;
use xpanel_core::{Error, UserId};

use crate::AppState;
use crate::error::{ApiError, ApiResult, ok};
use crate::handlers::audit;
use crate::middleware::{AdminUser, AuthUser, ClientIp};

/// Aggregate counters: process-wide for admins, own traffic otherwise.
pub async fn stats(State(state): State<AppState>, user: AuthUser) -> ApiResult {
    if user.is_admin {
        let (upstream, downstream) = state.store.traffic_totals().await?;
        let inbounds = state.store.count_inbounds().await?;
        Ok(ok(json!({
            "upstream_bytes": upstream,
            "downstream_bytes": downstream,
            "total_bytes": upstream + downstream,
            "inbounds": inbounds,
        })))
    } else {
        per_user_stats(&state, user.id).await
    }
}

async fn per_user_stats(state: &AppState, user_id: UserId) -> ApiResult {
    let user = state.store.user_by_id(user_id).await?;
    let stats = state.store.inbound_stats_by_user(user_id).await?;
    let (upstream, downstream) = stats
        .iter()
        .fold((0i64, 0i64), |(u, d), s| (u + s.upstream_bytes, d + s.downstream_bytes));
    Ok(ok(json!({
        "user_id": user.id,
        "username": user.username,
        "quota_bytes": user.quota_bytes,
        "used_bytes": user.used_bytes,
        "upstream_bytes": upstream,
        "downstream_bytes": downstream,
        "inbounds": stats,
    })))
}

/// Per-user counters; owner or admin.
pub async fn user_stats(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<UserId>,
) -> ApiResult {
    if !user.is_admin && user.id != id {
        return Err(ApiError(Error::forbidden("not your account")));
    }
    per_user_stats(&state, id).await
}

#[derive(Deserialize)]
pub struct DailyQuery {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub user_id: Option<UserId>,
}

/// Day buckets over a date window (default: the retention window).
pub async fn daily(
    State(state): State<AppState>,
    user: AuthUser,
    Query(q): Query<DailyQuery>,
) -> ApiResult {
    let end = q.end_date.unwrap_or_else(|| chrono::Utc::now().date_naive());
    let retention = state.settings.get().traffic.retention_days;
    let start = q.start_date.unwrap_or(end - chrono::Duration::days(retention));
    if start > end {
        return Err(ApiError(Error::bad_request("start_date is after end_date")));
    }

    let rows = match (user.is_admin, q.user_id) {
        (true, None) => state.store.daily_stats_range(start, end).await?,
        (true, Some(target)) => state.store.daily_stats_by_user(target, start, end).await?,
        (false, None) => state.store.daily_stats_by_user(user.id, start, end).await?,
        (false, Some(target)) if target == user.id => {
            state.store.daily_stats_by_user(user.id, start, end).await?
        }
        (false, Some(_)) => return Err(ApiError(Error::forbidden("not your account"))),
    };
    Ok(ok(json!({"items": rows, "start_date": start, "end_date": end})))
}

/// Per-user quotas, admin view.
pub async fn limits(State(state): State<AppState>, AdminUser(_): AdminUser) -> ApiResult {
    let users = state.store.list_users(0, 500).await?;
    let rows: Vec<_> = users
        .iter()
        .map(|u| {
            json!({
                "user_id": u.id,
                "username": u.username,
                "quota_bytes": u.quota_bytes,
                "used_bytes": u.used_bytes,
                "expires_at": u.expires_at,
            })
        })
        .collect();
    Ok(ok(json!({"items": rows})))
}

#[derive(Deserialize)]
pub struct SetLimitRequest {
    pub quota_bytes: i64,
    /// True also zeroes the running used-bytes, re-arming a disabled account.
    #[serde(default)]
    pub reset_used: bool,
}

pub async fn set_limit(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<UserId>,
    ip: ClientIp,
    headers: HeaderMap,
    Json(req): Json<SetLimitRequest>,
) -> ApiResult {
    if req.quota_bytes < 0 {
        return Err(ApiError(Error::bad_request("quota_bytes must be >= 0")));
    }
    let mut target = state.store.user_by_id(id).await?;
    target.quota_bytes = req.quota_bytes;
    if req.reset_used {
        target.used_bytes = 0;
    }
    state.store.update_user(&target).await?;

    audit(
        &state,
        Some(&admin),
        ip,
        &headers,
        "traffic.set_limit",
        format!("user:{id}"),
        format!("quota={} reset_used={}", req.quota_bytes, req.reset_used),
    )
    .await;
    Ok(ok(json!({"user_id": id, "quota_bytes": req.quota_bytes})))
}
