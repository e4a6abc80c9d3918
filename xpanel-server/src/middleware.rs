//! Cross-cutting request behavior, applied in order: access logging, panic
//! recovery (tower-http), CORS (tower-http), rate limiting, bearer auth.

use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use xpanel_core::{Error, UserId};

use crate::AppState;
use crate::error::ApiError;

/// Client address, derived once per request from `X-Real-IP`, the first
/// `X-Forwarded-For` entry, or the socket peer.
#[derive(Debug, Clone, Copy)]
pub struct ClientIp(pub IpAddr);

impl std::fmt::Display for ClientIp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity injected by the auth middleware.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: UserId,
    pub username: String,
    pub is_admin: bool,
}

pub type IpRateLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

pub fn build_limiter(per_second: u32, burst: u32) -> Arc<IpRateLimiter> {
    let quota = Quota::per_second(NonZeroU32::new(per_second.max(1)).expect("nonzero"))
        .allow_burst(NonZeroU32::new(burst.max(1)).expect("nonzero"));
    Arc::new(RateLimiter::keyed(quota))
}

fn derive_client_ip(req: &Request, fallback: Option<SocketAddr>) -> IpAddr {
    let headers = req.headers();
    if let Some(real) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if let Ok(ip) = real.trim().parse() {
            return ip;
        }
    }
    if let Some(fwd) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = fwd.split(',').next() {
            if let Ok(ip) = first.trim().parse() {
                return ip;
            }
        }
    }
    fallback.map(|a| a.ip()).unwrap_or(IpAddr::from([127, 0, 0, 1]))
}

/// Structured access log. Login paths record whether the request bore a
/// password and whether the response bore a token, never the values.
pub async fn access_log(mut req: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let connect_info = req.extensions().get::<ConnectInfo<SocketAddr>>().copied();
    let client_ip = ClientIp(derive_client_ip(&req, connect_info.map(|c| c.0)));
    req.extensions_mut().insert(client_ip);

    let is_login = path.ends_with("/auth/login");
    let had_body = req.headers().get(header::CONTENT_LENGTH).is_some();

    let response = next.run(req).await;

    let latency = started.elapsed();
    let status = response.status().as_u16();
    if is_login {
        tracing::info!(
            %method,
            path,
            status,
            latency_ms = latency.as_millis() as u64,
            client = %client_ip,
            user_agent,
            bore_password = had_body,
            bore_token = status == 200,
            "access"
        );
    } else {
        tracing::info!(
            %method,
            path,
            status,
            latency_ms = latency.as_millis() as u64,
            client = %client_ip,
            user_agent,
            "access"
        );
    }
    response
}

/// Token-bucket rate limit keyed per client IP; excess answers 429.
pub async fn rate_limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let ip = req
        .extensions()
        .get::<ClientIp>()
        .map(|c| c.0)
        .unwrap_or(IpAddr::from([127, 0, 0, 1]));
    if state.limiter.check_key(&ip).is_err() {
        tracing::warn!(client = %ip, "rate limit exceeded");
        return (
            axum::http::StatusCode::TOO_MANY_REQUESTS,
            axum::Json(serde_json::json!({"code": 42900, "message": "too many requests"})),
        )
            .into_response();
    }
    next.run(req).await
}

/// Bearer-token auth for everything mounted behind it. Valid claims become
/// an [`AuthUser`] extension; anything else is 401.
pub async fn require_session(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        return ApiError(Error::unauthorized("missing bearer token")).into_response();
    };
    match state.auth.validate(token) {
        Ok(claims) => {
            req.extensions_mut().insert(AuthUser {
                id: claims.sub,
                username: claims.name,
                is_admin: claims.admin,
            });
            next.run(req).await
        }
        Err(e) => ApiError(e).into_response(),
    }
}

/// Extractor for handlers that only need a valid session.
impl<S> axum::extract::FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or_else(|| ApiError(Error::unauthorized("missing bearer token")))
    }
}

/// Extractor for admin-only handlers; non-admin sessions get 403.
pub struct AdminUser(pub AuthUser);

impl<S> axum::extract::FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        if !user.is_admin {
            return Err(ApiError(Error::forbidden("administrator role required")));
        }
        Ok(AdminUser(user))
    }
}

impl<S> axum::extract::FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<ClientIp>()
            .copied()
            .unwrap_or(ClientIp(IpAddr::from([127, 0, 0, 1]))))
    }
}
