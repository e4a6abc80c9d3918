use chrono::{DateTime, Utc};
use xpanel_core::{Result, UserId};

use crate::model::{AlertRecord, AuditEvent, NewAuditEvent};
use crate::{map_db_err, Store};

/// Filters for the audit log query surface. All fields optional; pagination
/// is 1-based to match the HTTP parameters.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub actor_id: Option<UserId>,
    pub action: Option<String>,
    pub target: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub page: i64,
    pub page_size: i64,
}

impl Store {
    pub async fn create_audit_event(&self, event: NewAuditEvent) -> Result<i64> {
        let id = sqlx::query(
            "INSERT INTO audit_events (actor_id, actor_name, action, target, detail, client_ip, \
             user_agent, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.actor_id)
        .bind(&event.actor_name)
        .bind(&event.action)
        .bind(&event.target)
        .bind(&event.detail)
        .bind(&event.client_ip)
        .bind(&event.user_agent)
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(map_db_err)?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn query_audit_events(&self, q: &AuditQuery) -> Result<(Vec<AuditEvent>, i64)> {
        let mut where_clauses: Vec<&str> = Vec::new();
        if q.actor_id.is_some() {
            where_clauses.push("actor_id = ?");
        }
        if q.action.is_some() {
            where_clauses.push("action = ?");
        }
        if q.target.is_some() {
            where_clauses.push("target = ?");
        }
        if q.start.is_some() {
            where_clauses.push("created_at >= ?");
        }
        if q.end.is_some() {
            where_clauses.push("created_at <= ?");
        }
        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", where_clauses.join(" AND "))
        };

        let page = q.page.max(1);
        let page_size = q.page_size.clamp(1, 500);

        let count_sql = format!("SELECT COUNT(*) FROM audit_events{where_sql}");
        let mut count_query = sqlx::query_as::<_, (i64,)>(&count_sql);
        if let Some(v) = q.actor_id {
            count_query = count_query.bind(v);
        }
        if let Some(v) = &q.action {
            count_query = count_query.bind(v);
        }
        if let Some(v) = &q.target {
            count_query = count_query.bind(v);
        }
        if let Some(v) = q.start {
            count_query = count_query.bind(v);
        }
        if let Some(v) = q.end {
            count_query = count_query.bind(v);
        }
        let (total,) = count_query.fetch_one(self.pool()).await.map_err(map_db_err)?;

        let rows_sql = format!(
            "SELECT id, actor_id, actor_name, action, target, detail, client_ip, user_agent, \
             created_at FROM audit_events{where_sql} ORDER BY id DESC LIMIT ? OFFSET ?"
        );
        let mut rows_query = sqlx::query_as::<_, AuditEvent>(&rows_sql);
        if let Some(v) = q.actor_id {
            rows_query = rows_query.bind(v);
        }
        if let Some(v) = &q.action {
            rows_query = rows_query.bind(v);
        }
        if let Some(v) = &q.target {
            rows_query = rows_query.bind(v);
        }
        if let Some(v) = q.start {
            rows_query = rows_query.bind(v);
        }
        if let Some(v) = q.end {
            rows_query = rows_query.bind(v);
        }
        let rows = rows_query
            .bind(page_size)
            .bind((page - 1) * page_size)
            .fetch_all(self.pool())
            .await
            .map_err(map_db_err)?;

        Ok((rows, total))
    }

    pub async fn create_alert(
        &self,
        kind: &str,
        observed: f64,
        threshold: f64,
        message: &str,
    ) -> Result<i64> {
        let id = sqlx::query(
            "INSERT INTO alerts (kind, observed, threshold, message, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(kind)
        .bind(observed)
        .bind(threshold)
        .bind(message)
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(map_db_err)?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn list_alerts(&self, limit: i64) -> Result<Vec<AlertRecord>> {
        sqlx::query_as::<_, AlertRecord>(
            "SELECT id, kind, observed, threshold, message, created_at FROM alerts \
             ORDER BY id DESC LIMIT ?",
        )
        .bind(limit.clamp(1, 1000))
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)
    }
}
