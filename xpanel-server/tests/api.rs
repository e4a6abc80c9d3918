//! Management API behavior through the full middleware stack.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tower::ServiceExt;
use xpanel_auth::{AuthService, TokenSigner};
use xpanel_cert::CertManager;
use xpanel_config::{Settings, SettingsHandle};
use xpanel_engine::{EngineOptions, XrayManager};
use xpanel_notify::NotificationQueue;
use xpanel_server::{AppState, build_limiter, router};
use xpanel_store::{NewUser, Store};

struct TestApp {
    app: Router,
    store: Store,
    queue: NotificationQueue,
    _dir: tempfile::TempDir,
}

async fn test_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_in_memory().await.unwrap();

    let mut settings = Settings::default();
    settings.ssl.cert_dir = dir.path().join("certs").display().to_string();
    let settings = SettingsHandle::ephemeral(settings);

    let queue = NotificationQueue::new(32);
    let auth = AuthService::new(store.clone(), TokenSigner::ephemeral());
    let certs = CertManager::load(store.clone(), settings.clone(), queue.clone()).await.unwrap();
    let engine = XrayManager::new(
        store.clone(),
        EngineOptions {
            base_dir: dir.path().join("xray"),
            log_dir: dir.path().join("logs"),
            ..Default::default()
        },
    );
    let (reconcile_tx, _reconcile_rx) = tokio::sync::mpsc::channel(1);

    let state = AppState::new(
        store.clone(),
        settings,
        auth,
        queue.clone(),
        certs,
        engine,
        reconcile_tx,
        // Generous bucket so tests exercise handlers, not the limiter.
        build_limiter(10_000, 10_000),
    );
    TestApp { app: router(state), store, queue, _dir: dir }
}

async fn seed_admin(store: &Store) {
    let (hash, salt) = AuthService::new_credential("admin").unwrap();
    store
        .create_user(NewUser {
            username: "admin".into(),
            email: "admin@example.com".into(),
            password_hash: hash,
            password_salt: salt,
            is_admin: true,
            quota_bytes: 0,
            expires_at: None,
        })
        .await
        .unwrap();
}

async fn seed_member(store: &Store, name: &str) -> i64 {
    let (hash, salt) = AuthService::new_credential("member").unwrap();
    store
        .create_user(NewUser {
            username: name.into(),
            email: format!("{name}@example.com"),
            password_hash: hash,
            password_salt: salt,
            is_admin: false,
            quota_bytes: 0,
            expires_at: None,
        })
        .await
        .unwrap()
        .id
}

async fn request(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).to_string(),
        ))
    };
    (status, body)
}

fn post_json(path: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get_req(path: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(path);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

async fn login(app: &Router, username: &str, password: &str) -> String {
    let (status, body) = request(
        app,
        post_json("/api/auth/login", None, json!({"username": username, "password": password})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "login failed: {body}");
    body["data"]["token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn login_returns_token_then_lockout_after_five_failures() {
    let t = test_app().await;
    seed_admin(&t.store).await;

    // Correct credentials mint a token.
    let (status, body) = request(
        &t.app,
        post_json("/api/auth/login", None, json!({"username": "admin", "password": "admin"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(body["data"]["token"].as_str().is_some());

    // Five wrong passwords: 401 each time.
    for _ in 0..5 {
        let (status, _) = request(
            &t.app,
            post_json("/api/auth/login", None, json!({"username": "admin", "password": "wrong"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    // Sixth attempt with the CORRECT password: locked out.
    let (status, body) = request(
        &t.app,
        post_json("/api/auth/login", None, json!({"username": "admin", "password": "admin"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["message"].as_str().unwrap().contains("locked"));
}

#[tokio::test]
async fn missing_and_bad_tokens_are_unauthorized() {
    let t = test_app().await;
    let (status, _) = request(&t.app, get_req("/api/system/info", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = request(&t.app, get_req("/api/system/info", Some("not-a-token"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn inbound_crud_with_port_conflict() {
    let t = test_app().await;
    seed_admin(&t.store).await;
    let token = login(&t.app, "admin", "admin").await;

    let create = json!({
        "name": "t1",
        "protocol": "trojan",
        "port": 10443,
        "settings": {"password": "p", "sni": "e.com"},
        "enabled": true
    });
    let (status, body) =
        request(&t.app, post_json("/api/inbounds", Some(&token), create.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["id"], 1);
    assert_eq!(body["data"]["protocol"], "trojan");

    // Same port again: conflict.
    let (status, body) = request(&t.app, post_json("/api/inbounds", Some(&token), create)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], 40900);

    // Update and read back.
    let update = Request::builder()
        .method("PUT")
        .uri("/api/inbounds/1")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::from(json!({"name": "renamed"}).to_string()))
        .unwrap();
    let (status, body) = request(&t.app, update).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["name"], "renamed");

    // Delete, then 404 on read.
    let delete = Request::builder()
        .method("DELETE")
        .uri("/api/inbounds/1")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = request(&t.app, delete).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = request(&t.app, get_req("/api/inbounds/1", Some(&token))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn non_admin_cannot_write_inbounds_or_read_settings() {
    let t = test_app().await;
    seed_admin(&t.store).await;
    seed_member(&t.store, "bob").await;
    let token = login(&t.app, "bob", "member").await;

    let (status, body) = request(
        &t.app,
        post_json(
            "/api/inbounds",
            Some(&token),
            json!({"name": "x", "protocol": "socks", "port": 1080}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], 40300);

    let (status, _) = request(&t.app, get_req("/api/settings", Some(&token))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn share_link_matches_canonical_trojan_form() {
    let t = test_app().await;
    seed_admin(&t.store).await;
    let token = login(&t.app, "admin", "admin").await;

    let create = json!({
        "name": "vip",
        "protocol": "trojan",
        "port": 443,
        "settings": {"password": "pw ord", "sni": "ex.com", "allowInsecure": false},
    });
    let (status, _) = request(&t.app, post_json("/api/inbounds", Some(&token), create)).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = request(&t.app, get_req("/api/inbounds/1/link", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["data"]["link"],
        "trojan://pw+ord@ex.com:443?security=tls&sni=ex.com&allowInsecure=false#vip"
    );

    let (status, body) = request(&t.app, get_req("/api/inbounds/1/qrcode", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_str().unwrap().contains("svg"));
}

#[tokio::test]
async fn owner_gating_on_inbound_reads() {
    let t = test_app().await;
    seed_admin(&t.store).await;
    let bob = seed_member(&t.store, "bob").await;
    seed_member(&t.store, "eve").await;
    let admin_token = login(&t.app, "admin", "admin").await;

    let create = json!({
        "user_id": bob,
        "name": "bobs",
        "protocol": "trojan",
        "port": 2443,
        "settings": {"password": "p", "sni": "b.com"},
    });
    let (status, _) = request(&t.app, post_json("/api/inbounds", Some(&admin_token), create)).await;
    assert_eq!(status, StatusCode::CREATED);

    let bob_token = login(&t.app, "bob", "member").await;
    let (status, _) = request(&t.app, get_req("/api/inbounds/1", Some(&bob_token))).await;
    assert_eq!(status, StatusCode::OK);

    let eve_token = login(&t.app, "eve", "member").await;
    let (status, _) = request(&t.app, get_req("/api/inbounds/1", Some(&eve_token))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn settings_section_round_trip() {
    let t = test_app().await;
    seed_admin(&t.store).await;
    let token = login(&t.app, "admin", "admin").await;

    let (status, body) =
        request(&t.app, get_req("/api/settings/sections/traffic", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["retention_days"], 30);

    let put = Request::builder()
        .method("PUT")
        .uri("/api/settings/sections/traffic")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::from(json!({"retention_days": 7}).to_string()))
        .unwrap();
    let (status, body) = request(&t.app, put).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["retention_days"], 7);

    // Unknown section.
    let (status, _) = request(&t.app, get_req("/api/settings/sections/nope", Some(&token))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn traffic_limits_and_user_stats_gating() {
    let t = test_app().await;
    seed_admin(&t.store).await;
    let bob = seed_member(&t.store, "bob").await;
    let admin_token = login(&t.app, "admin", "admin").await;
    let bob_token = login(&t.app, "bob", "member").await;

    // Admin sets bob's quota.
    let (status, _) = request(
        &t.app,
        post_json(
            &format!("/api/traffic/limits/user/{bob}"),
            Some(&admin_token),
            json!({"quota_bytes": 5000}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Bob reads his own stats, sees the quota.
    let (status, body) =
        request(&t.app, get_req(&format!("/api/traffic/user/{bob}"), Some(&bob_token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["quota_bytes"], 5000);

    // Bob cannot read the admin's stats or the limits table.
    let (status, _) = request(&t.app, get_req("/api/traffic/user/1", Some(&bob_token))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = request(&t.app, get_req("/api/traffic/limits", Some(&bob_token))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn audit_log_records_logins_and_filters() {
    let t = test_app().await;
    seed_admin(&t.store).await;
    let token = login(&t.app, "admin", "admin").await;

    // A failed login to have both kinds of events.
    let _ = request(
        &t.app,
        post_json("/api/auth/login", None, json!({"username": "admin", "password": "bad"})),
    )
    .await;

    let (status, body) =
        request(&t.app, get_req("/api/logs?action=auth.login", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total"], 1);

    let (status, body) =
        request(&t.app, get_req("/api/logs?action=auth.login_failed", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total"], 1);

    // CSV export carries a header row.
    let export = post_json("/api/logs/export", Some(&token), json!({}));
    let (status, body) = request(&t.app, export).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_str().unwrap().starts_with("id,actor_id,actor_name"));
}

#[tokio::test]
async fn cors_preflight_short_circuits() {
    let t = test_app().await;
    let req = Request::builder()
        .method("OPTIONS")
        .uri("/api/inbounds")
        .header(header::ORIGIN, "https://ui.example.com")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();
    let response = t.app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
        "*"
    );
}

#[tokio::test]
async fn rate_limit_answers_429() {
    let t = test_app().await;
    seed_admin(&t.store).await;

    // Rebuild the router with a tiny bucket to make the limit observable.
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.ssl.cert_dir = dir.path().join("certs").display().to_string();
    let settings = SettingsHandle::ephemeral(settings);
    let queue = NotificationQueue::new(8);
    let auth = AuthService::new(t.store.clone(), TokenSigner::ephemeral());
    let certs =
        CertManager::load(t.store.clone(), settings.clone(), queue.clone()).await.unwrap();
    let engine = XrayManager::new(
        t.store.clone(),
        EngineOptions { base_dir: dir.path().join("xray"), ..Default::default() },
    );
    let (reconcile_tx, _rx) = tokio::sync::mpsc::channel(1);
    let state = AppState::new(
        t.store.clone(),
        settings,
        auth,
        queue,
        certs,
        engine,
        reconcile_tx,
        build_limiter(1, 2),
    );
    let app = router(state);

    let mut last = StatusCode::OK;
    for _ in 0..4 {
        let (status, _) = request(
            &app,
            post_json("/api/auth/login", None, json!({"username": "x", "password": "y"})),
        )
        .await;
        last = status;
    }
    assert_eq!(last, StatusCode::TOO_MANY_REQUESTS);

    let (_, body) = request(
        &app,
        post_json("/api/auth/login", None, json!({"username": "x", "password": "y"})),
    )
    .await;
    assert_eq!(body["code"], 42900);
}

#[tokio::test]
async fn user_management_and_password_reset() {
    let t = test_app().await;
    seed_admin(&t.store).await;
    let token = login(&t.app, "admin", "admin").await;

    let (status, body) = request(
        &t.app,
        post_json(
            "/api/users",
            Some(&token),
            json!({"username": "carol", "email": "carol@example.com", "password": "secret1"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let carol = body["data"]["id"].as_i64().unwrap();
    // Credentials never serialize.
    assert!(body["data"].get("password_hash").is_none());

    // Duplicate username conflicts.
    let (status, _) = request(
        &t.app,
        post_json(
            "/api/users",
            Some(&token),
            json!({"username": "carol", "email": "other@example.com", "password": "secret1"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Carol can log in, but cannot list users.
    let carol_token = login(&t.app, "carol", "secret1").await;
    let (status, _) = request(&t.app, get_req("/api/users", Some(&carol_token))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Reset mails the generated password and invalidates the old one.
    let (status, _) = request(
        &t.app,
        post_json(&format!("/api/users/{carol}/reset-password"), Some(&token), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let mail = t.queue.try_pop().expect("reset notification queued");
    assert_eq!(mail.to, vec!["carol@example.com".to_string()]);

    let (status, _) = request(
        &t.app,
        post_json("/api/auth/login", None, json!({"username": "carol", "password": "secret1"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn certificate_lifecycle_over_the_api() {
    let t = test_app().await;
    seed_admin(&t.store).await;
    let token = login(&t.app, "admin", "admin").await;

    // ACME is disabled by default, so issuance is self-signed and offline.
    let (status, body) = request(
        &t.app,
        post_json("/api/certificates", Some(&token), json!({"domain": "panel.example.com"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["status"], "valid");
    let cert_path = body["data"]["cert_path"].as_str().unwrap().to_string();
    assert!(std::path::Path::new(&cert_path).exists());

    let (status, body) = request(
        &t.app,
        post_json("/api/certificates/panel.example.com/renew", Some(&token), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "valid");

    let delete = Request::builder()
        .method("DELETE")
        .uri("/api/certificates/panel.example.com")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = request(&t.app, delete).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!std::path::Path::new(&cert_path).exists());
    let (status, _) =
        request(&t.app, get_req("/api/certificates/panel.example.com", Some(&token))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn system_info_reports_engine_down() {
    let t = test_app().await;
    seed_admin(&t.store).await;
    let token = login(&t.app, "admin", "admin").await;

    let (status, body) = request(&t.app, get_req("/api/system/info", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["engine_state"], "down");
    assert!(body["data"]["panel_version"].as_str().is_some());

    let (status, body) = request(&t.app, get_req("/api/system/stats", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["cpu_count"].as_u64().unwrap() > 0);
}
