use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, watch};
use xpanel_core::{Error, Result};
use xpanel_store::Store;

use crate::events::{EventBus, EventStatus, XrayEvent, XrayEventType};
use crate::{EngineOptions, config, download};

const STOP_GRACE: Duration = Duration::from_secs(5);
const MONITOR_INTERVAL: Duration = Duration::from_millis(1000);

/// Unexpected-exit restart policy.
#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    pub restart_after_secs: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Down,
    Starting,
    Running,
    Stopping,
    Restarting,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Down => "down",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
            EngineState::Restarting => "restarting",
        }
    }
}

struct Inner {
    state: EngineState,
    child: Option<Child>,
    active_version: String,
    watchdog_retries: u32,
}

/// Serializes every lifecycle operation (start, stop, reconcile, version
/// switch) behind one mutex, per the shared-resource policy.
pub struct XrayManager {
    opts: EngineOptions,
    store: Store,
    bus: EventBus,
    inner: Mutex<Inner>,
}

impl XrayManager {
    pub fn new(store: Store, opts: EngineOptions) -> Arc<Self> {
        let active_version = opts.version.clone();
        Arc::new(Self {
            opts,
            store,
            bus: EventBus::new(),
            inner: Mutex::new(Inner {
                state: EngineState::Down,
                child: None,
                active_version,
                watchdog_retries: 0,
            }),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub async fn state(&self) -> EngineState {
        self.inner.lock().await.state
    }

    pub async fn active_version(&self) -> String {
        self.inner.lock().await.active_version.clone()
    }

    fn config_path(&self) -> PathBuf {
        self.opts
            .custom_config
            .clone()
            .unwrap_or_else(|| self.opts.base_dir.join("config.json"))
    }

    /// Write the current declared state as the engine config. Custom configs
    /// are left untouched but validated.
    async fn prepare_config(&self) -> Result<PathBuf> {
        let path = self.config_path();
        match &self.opts.custom_config {
            Some(custom) => config::validate_custom_config(custom).await?,
            None => {
                let inbounds = self.store.list_enabled_inbounds().await?;
                let generated = config::generate(&inbounds, &self.opts)?;
                config::write_config(&generated, &path).await?;
                tracing::info!(inbounds = inbounds.len(), path = %path.display(), "engine config written");
            }
        }
        Ok(path)
    }

    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.start_locked(&mut inner).await?;
        inner.watchdog_retries = 0;
        Ok(())
    }

    async fn start_locked(&self, inner: &mut Inner) -> Result<()> {
        if inner.state == EngineState::Running {
            return Ok(());
        }
        inner.state = EngineState::Starting;

        let version = inner.active_version.clone();
        download::ensure_installed(&self.opts, &version, &self.bus).await?;
        let config_path = self.prepare_config().await?;
        let binary = download::binary_path(&self.opts, &version);

        tokio::fs::create_dir_all(&self.opts.log_dir).await?;
        let stdout = log_file(&self.opts.log_dir.join("xray_stdout.log"))?;
        let stderr = log_file(&self.opts.log_dir.join("xray_stderr.log"))?;

        let child = Command::new(&binary)
            .arg("run")
            .arg("-c")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| {
                inner.state = EngineState::Down;
                Error::upstream(format!("engine {} failed to start: {e}", binary.display()))
            })?;

        tracing::info!(version, pid = child.id(), "engine started");
        inner.child = Some(child);
        inner.state = EngineState::Running;
        self.bus.publish(XrayEvent::new(
            XrayEventType::State,
            EventStatus::Completed,
            100,
            format!("engine {version} running"),
        ));
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.stop_locked(&mut inner).await
    }

    async fn stop_locked(&self, inner: &mut Inner) -> Result<()> {
        let Some(mut child) = inner.child.take() else {
            inner.state = EngineState::Down;
            return Ok(());
        };
        inner.state = EngineState::Stopping;
        terminate(&mut child).await;
        inner.state = EngineState::Down;
        tracing::info!("engine stopped");
        self.bus.publish(XrayEvent::new(XrayEventType::State, EventStatus::Completed, 100, "engine down"));
        Ok(())
    }

    /// Regenerate the config from the declared inbound set and bounce the
    /// engine if it is running.
    pub async fn reconcile(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != EngineState::Running {
            // Nothing live to reconfigure; the next start picks up the state.
            self.prepare_config().await?;
            return Ok(());
        }
        inner.state = EngineState::Restarting;
        self.stop_locked(&mut inner).await?;
        self.start_locked(&mut inner).await
    }

    /// Swap the active binary. If the new version fails to start, the
    /// previous one is reinstated and restarted.
    pub async fn switch_version(&self, new_version: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let old_version = inner.active_version.clone();
        if old_version == new_version {
            return Ok(());
        }
        let was_running = inner.state == EngineState::Running;

        self.bus.publish(XrayEvent::new(
            XrayEventType::Switch,
            EventStatus::Start,
            0,
            format!("switching engine {old_version} -> {new_version}"),
        ));

        download::ensure_installed(&self.opts, new_version, &self.bus).await?;
        if was_running {
            self.stop_locked(&mut inner).await?;
        }
        inner.active_version = new_version.to_string();

        if was_running {
            if let Err(e) = self.start_locked(&mut inner).await {
                tracing::error!(error = %e, "new engine version failed, reverting");
                inner.active_version = old_version.clone();
                let revert = self.start_locked(&mut inner).await;
                self.bus.publish(
                    XrayEvent::new(
                        XrayEventType::Switch,
                        EventStatus::Reverted,
                        0,
                        format!("switch to {new_version} failed, reverted to {old_version}"),
                    )
                    .with_details(serde_json::json!({"error": e.to_string()})),
                );
                revert?;
                return Err(e);
            }
        }

        self.bus.publish(XrayEvent::new(
            XrayEventType::Switch,
            EventStatus::Completed,
            100,
            format!("engine now at {new_version}"),
        ));
        Ok(())
    }

    /// Drains reconcile requests (from the traffic engine and the API) until
    /// shutdown.
    pub async fn run_reconcile_loop(
        self: Arc<Self>,
        mut requests: mpsc::Receiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                request = requests.recv() => {
                    if request.is_none() {
                        break;
                    }
                    if let Err(e) = self.reconcile().await {
                        tracing::error!(error = %e, "reconcile failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("reconcile loop stopped");
    }

    /// Watches for unexpected child exit. Without a watchdog the engine stays
    /// down until the operator starts it again.
    pub async fn run_monitor_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(MONITOR_INTERVAL) => {}
                _ = shutdown.changed() => break,
            }

            let exited = {
                let mut inner = self.inner.lock().await;
                match inner.child.as_mut().map(|c| c.try_wait()) {
                    Some(Ok(Some(status))) => {
                        tracing::error!(code = status.code(), "engine exited unexpectedly");
                        inner.child = None;
                        inner.state = EngineState::Down;
                        self.bus.publish(
                            XrayEvent::new(
                                XrayEventType::State,
                                EventStatus::Error,
                                0,
                                "engine exited unexpectedly",
                            )
                            .with_details(serde_json::json!({"exit_code": status.code()})),
                        );
                        true
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "engine wait failed");
                        false
                    }
                    _ => false,
                }
            };

            if exited {
                if let Some(watchdog) = self.opts.watchdog {
                    let retries = {
                        let inner = self.inner.lock().await;
                        inner.watchdog_retries
                    };
                    if retries >= watchdog.max_retries {
                        tracing::error!(retries, "watchdog retry budget exhausted, staying down");
                        continue;
                    }
                    tokio::time::sleep(Duration::from_secs(watchdog.restart_after_secs)).await;
                    let mut inner = self.inner.lock().await;
                    inner.watchdog_retries += 1;
                    let attempt = inner.watchdog_retries;
                    match self.start_locked(&mut inner).await {
                        Ok(()) => tracing::info!(attempt, "watchdog restarted engine"),
                        Err(e) => tracing::error!(attempt, error = %e, "watchdog restart failed"),
                    }
                }
            }
        }
        // Bring the child down with the process.
        let mut inner = self.inner.lock().await;
        let _ = self.stop_locked(&mut inner).await;
        tracing::info!("engine monitor stopped");
    }
}

fn log_file(path: &std::path::Path) -> Result<Stdio> {
    let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Stdio::from(file))
}

/// Graceful signal first, kill after the grace period.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!(code = status.code(), "engine exited"),
        Ok(Err(e)) => tracing::warn!(error = %e, "engine wait failed"),
        Err(_) => {
            tracing::warn!("engine ignored the stop signal, killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}
