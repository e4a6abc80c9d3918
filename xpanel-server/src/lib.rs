//! Management API server.
//!
//! A single HTTP server mounting the versioned JSON surface under `/api`.
//! Cross-cutting order: structured access logging, panic recovery, CORS,
//! per-IP rate limiting, then bearer-token auth on everything that is not
//! the login route. Handlers return the `{success, data}` envelope on
//! success and `{code, message}` with a mapped status on failure.

pub mod error;
mod handlers;
pub mod middleware;
mod monitor;
pub mod share;

pub use middleware::{AdminUser, AuthUser, ClientIp, IpRateLimiter, build_limiter};
pub use monitor::{SystemMonitor, SystemStats};

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::http::{Method, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use tokio::sync::watch;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use xpanel_auth::AuthService;
use xpanel_cert::CertManager;
use xpanel_config::SettingsHandle;
use xpanel_core::Result;
use xpanel_engine::XrayManager;
use xpanel_notify::NotificationQueue;
use xpanel_store::Store;
use xpanel_traffic::ReconcileTx;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub settings: SettingsHandle,
    pub auth: AuthService,
    pub queue: NotificationQueue,
    pub certs: Arc<CertManager>,
    pub engine: Arc<XrayManager>,
    pub monitor: Arc<SystemMonitor>,
    pub limiter: Arc<IpRateLimiter>,
    reconcile: ReconcileTx,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        settings: SettingsHandle,
        auth: AuthService,
        queue: NotificationQueue,
        certs: Arc<CertManager>,
        engine: Arc<XrayManager>,
        reconcile: ReconcileTx,
        limiter: Arc<IpRateLimiter>,
    ) -> Self {
        let monitor =
            Arc::new(SystemMonitor::new(settings.clone(), store.clone(), queue.clone()));
        Self { store, settings, auth, queue, certs, engine, monitor, limiter, reconcile }
    }

    /// Ask the listener manager for a config regeneration + restart.
    pub fn request_reconcile(&self) {
        if self.reconcile.try_send(()).is_err() {
            tracing::debug!("reconcile already pending");
        }
    }
}

fn panic_handler(err: Box<dyn std::any::Any + Send + 'static>) -> axum::response::Response {
    let detail = err
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| err.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic of unknown type".to_string());
    tracing::error!(detail, "handler panicked");
    (
        axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        axum::Json(serde_json::json!({"code": 50000, "message": "internal error"})),
    )
        .into_response()
}

/// Assemble the full application router.
pub fn router(state: AppState) -> Router {
    use handlers::{auth, certs, inbounds, logs, settings, system, traffic, users};

    let public = Router::new().route("/auth/login", post(auth::login));

    let session = Router::new()
        .route("/auth/logout", post(auth::logout))
        .route("/auth/change-password", post(auth::change_password))
        .route("/system/info", get(system::info))
        .route("/system/stats", get(system::stats))
        .route("/system/alerts", get(system::alerts))
        .route("/system/alerts/test", post(system::alerts_test))
        .route("/users", get(users::list).post(users::create))
        .route("/users/{id}", get(users::get).put(users::update).delete(users::delete))
        .route("/users/{id}/reset-password", post(users::reset_password))
        .route("/inbounds", get(inbounds::list).post(inbounds::create))
        .route(
            "/inbounds/{id}",
            get(inbounds::get).put(inbounds::update).delete(inbounds::delete),
        )
        .route("/inbounds/{id}/link", get(inbounds::link))
        .route("/inbounds/{id}/qrcode", get(inbounds::qrcode))
        .route("/traffic/stats", get(traffic::stats))
        .route("/traffic/user/{id}", get(traffic::user_stats))
        .route("/traffic/daily", get(traffic::daily))
        .route("/traffic/limits", get(traffic::limits))
        .route("/traffic/limits/user/{id}", post(traffic::set_limit))
        .route("/certificates", get(certs::list).post(certs::create))
        .route("/certificates/{domain}", get(certs::get).delete(certs::delete))
        .route("/certificates/{domain}/renew", post(certs::renew))
        .route("/settings", get(settings::get).put(settings::put))
        .route(
            "/settings/sections/{section}",
            get(settings::get_section).put(settings::put_section),
        )
        .route("/settings/backup", post(settings::backup))
        .route("/settings/restore", post(settings::restore))
        .route("/logs", get(logs::query))
        .route("/logs/export", post(logs::export))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_session,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .nest("/api", public.merge(session))
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(10)))
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::rate_limit))
        .layer(cors)
        .layer(CatchPanicLayer::custom(panic_handler))
        .layer(axum::middleware::from_fn(middleware::access_log))
        .with_state(state)
}

/// Bind and serve until the shutdown signal flips.
pub async fn serve(
    state: AppState,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| xpanel_core::Error::internal(format!("bind {addr}: {e}")))?;
    tracing::info!(%addr, "management api listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| xpanel_core::Error::internal(format!("serve: {e}")))?;
    Ok(())
}
