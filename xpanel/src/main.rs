use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use xpanel_auth::{AuthService, TokenSigner};
use xpanel_cert::CertManager;
use xpanel_config::SettingsHandle;
use xpanel_engine::{EngineOptions, XrayManager, XrayStatsSource};
use xpanel_notify::{NotificationQueue, NotifyWorker, SmtpMailer};
use xpanel_server::{AppState, build_limiter};
use xpanel_store::{NewUser, Store};
use xpanel_traffic::TrafficEngine;

/// How long background tasks get to flush after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "xpanel", version, about = "Multi-tenant proxy panel control plane")]
struct Cli {
    /// Settings document path.
    #[arg(long, default_value = "config/settings.json")]
    config: PathBuf,

    /// Webroot served for HTTP-01 ACME challenges.
    #[arg(long, default_value = "web")]
    webroot: PathBuf,

    /// Management API bind address.
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,
}

fn init_logging(settings: &SettingsHandle) -> tracing_appender::non_blocking::WorkerGuard {
    let log = settings.get().log;
    let file_appender = tracing_appender::rolling::daily("logs", "app.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log.level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();
    guard
}

/// First run on an empty database: create the default administrator.
async fn bootstrap_admin(store: &Store) -> anyhow::Result<()> {
    if store.count_users().await? > 0 {
        return Ok(());
    }
    let (hash, salt) = AuthService::new_credential("admin")?;
    store
        .create_user(NewUser {
            username: "admin".into(),
            email: "admin@localhost".into(),
            password_hash: hash,
            password_salt: salt,
            is_admin: true,
            quota_bytes: 0,
            expires_at: None,
        })
        .await?;
    tracing::warn!("created default administrator 'admin'/'admin', change this password NOW");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings =
        SettingsHandle::load(&cli.config).context("loading settings document")?;
    let _log_guard = init_logging(&settings);
    tracing::info!(config = %cli.config.display(), listen = %cli.listen, "xpanel starting");

    let store = Store::open("data/v.db").await.context("opening database")?;
    bootstrap_admin(&store).await?;

    // Shared infrastructure.
    let queue = NotificationQueue::default();
    let signer = match std::env::var("XPANEL_TOKEN_SECRET") {
        Ok(secret) if !secret.is_empty() => TokenSigner::new(secret.as_bytes()),
        _ => {
            tracing::info!("XPANEL_TOKEN_SECRET not set; sessions will not survive a restart");
            TokenSigner::ephemeral()
        }
    };
    let auth = AuthService::new(store.clone(), signer);

    // Honor the CLI webroot unless the settings file pins its own.
    {
        let mut current = settings.get();
        if current.ssl.webroot == "web" && cli.webroot != PathBuf::from("web") {
            current.ssl.webroot = cli.webroot.display().to_string();
            settings.update(current).context("applying --webroot")?;
        }
    }

    let certs = CertManager::load(store.clone(), settings.clone(), queue.clone())
        .await
        .context("loading certificate manager")?;

    let engine_opts = EngineOptions::default();
    let api_port = engine_opts.api_port;
    let engine = XrayManager::new(store.clone(), engine_opts);
    let (reconcile_tx, reconcile_rx) = tokio::sync::mpsc::channel(1);

    let traffic = TrafficEngine::new(
        store.clone(),
        settings.clone(),
        queue.clone(),
        Arc::new(XrayStatsSource::new(api_port)),
        reconcile_tx.clone(),
    );

    let state = AppState::new(
        store.clone(),
        settings.clone(),
        auth,
        queue.clone(),
        certs.clone(),
        engine.clone(),
        reconcile_tx,
        build_limiter(1, 5),
    );

    // Background tasks, all hanging off one shutdown signal.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    tasks.spawn(
        NotifyWorker::new(queue.clone(), settings.clone(), store.clone(), Arc::new(SmtpMailer))
            .run(shutdown_rx.clone()),
    );
    tasks.spawn(certs.clone().run_check_loop(shutdown_rx.clone()));
    tasks.spawn(certs.clone().run_renew_loop(shutdown_rx.clone()));
    tasks.spawn(traffic.clone().run_sample_loop(shutdown_rx.clone()));
    tasks.spawn(traffic.clone().run_rollup_loop(shutdown_rx.clone()));
    tasks.spawn(engine.clone().run_reconcile_loop(reconcile_rx, shutdown_rx.clone()));
    tasks.spawn(engine.clone().run_monitor_loop(shutdown_rx.clone()));
    tasks.spawn(state.monitor.clone().run(shutdown_rx.clone()));

    // Bring the data plane up; a failure is logged, not fatal, so the admin
    // can fix the engine installation through the panel.
    if let Err(e) = engine.start().await {
        tracing::error!(error = %e, "engine did not start; data plane is down");
    }

    let server = tokio::spawn(xpanel_server::serve(state, cli.listen, shutdown_rx));

    // Run until SIGINT/SIGTERM.
    wait_for_signal().await;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = server.await;
        while tasks.join_next().await.is_some() {}
    })
    .await
    {
        Ok(()) => tracing::info!("all tasks flushed, bye"),
        Err(_) => tracing::warn!("grace period expired, abandoning remaining tasks"),
    }

    let _ = engine.stop().await;
    store.close().await;
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
