pub mod auth;
pub mod certs;
pub mod inbounds;
pub mod logs;
pub mod settings;
pub mod system;
pub mod traffic;
pub mod users;

/// Distinguishes "field absent" (keep) from "field null" (clear) in partial
/// update bodies.
pub(crate) mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, T, D>(d: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Deserialize::deserialize(d).map(Some)
    }
}

use axum::http::HeaderMap;
use xpanel_store::NewAuditEvent;

use crate::AppState;
use crate::middleware::{AuthUser, ClientIp};

/// Fire-and-forget audit record; failures are logged, never surfaced.
pub(crate) async fn audit(
    state: &AppState,
    actor: Option<&AuthUser>,
    ip: ClientIp,
    headers: &HeaderMap,
    action: &str,
    target: String,
    detail: String,
) {
    let event = NewAuditEvent {
        actor_id: actor.map(|a| a.id).unwrap_or(0),
        actor_name: actor.map(|a| a.username.clone()).unwrap_or_default(),
        action: action.to_string(),
        target,
        detail,
        client_ip: ip.to_string(),
        user_agent: headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string(),
    };
    if let Err(e) = state.store.create_audit_event(event).await {
        tracing::error!(error = %e, action, "audit write failed");
    }
}
