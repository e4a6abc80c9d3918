use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use xpanel_core::UserId;
use xpanel_store::AuditQuery;

use crate::AppState;
use crate::error::{ApiError, ApiResult, ok};
use crate::middleware::AdminUser;

#[derive(Deserialize)]
pub struct LogsQuery {
    /// Action verb filter (e.g. `auth.login`).
    #[serde(alias = "level")]
    pub action: Option<String>,
    /// Target resource filter (e.g. `inbound:3`).
    #[serde(alias = "module")]
    pub target: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub user_id: Option<UserId>,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    50
}

impl From<LogsQuery> for AuditQuery {
    fn from(q: LogsQuery) -> Self {
        AuditQuery {
            actor_id: q.user_id,
            action: q.action,
            target: q.target,
            start: q.start_time,
            end: q.end_time,
            page: q.page,
            page_size: q.page_size,
        }
    }
}

pub async fn query(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    Query(q): Query<LogsQuery>,
) -> ApiResult {
    let page = q.page;
    let page_size = q.page_size;
    let (items, total) = state.store.query_audit_events(&q.into()).await?;
    Ok(ok(json!({
        "items": items,
        "total": total,
        "page": page,
        "page_size": page_size,
    })))
}

/// CSV export of the same filtered view, without pagination.
pub async fn export(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    Query(mut q): Query<LogsQuery>,
) -> Result<Response, ApiError> {
    q.page = 1;
    q.page_size = 500;
    let (items, _) = state.store.query_audit_events(&q.into()).await?;

    let mut csv = String::from("id,actor_id,actor_name,action,target,detail,client_ip,user_agent,created_at\n");
    for e in items {
        csv.push_str(&format!(
            "{},{},{},{},{},{},{},{},{}\n",
            e.id,
            e.actor_id,
            csv_escape(&e.actor_name),
            csv_escape(&e.action),
            csv_escape(&e.target),
            csv_escape(&e.detail),
            csv_escape(&e.client_ip),
            csv_escape(&e.user_agent),
            e.created_at.to_rfc3339(),
        ));
    }

    Ok((
        StatusCode::OK,
        [
            (axum::http::header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                axum::http::header::CONTENT_DISPOSITION,
                "attachment; filename=\"audit-log.csv\"",
            ),
        ],
        csv,
    )
        .into_response())
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
