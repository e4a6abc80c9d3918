//! System monitor: live snapshots for the API plus a background loop that
//! compares cpu/memory/disk usage against configured thresholds and records
//! alerts, at most once per alert interval per kind.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{Disks, Networks, System};
use tokio::sync::watch;
use xpanel_config::SettingsHandle;
use xpanel_notify::{Notification, NotificationKind, NotificationQueue};
use xpanel_store::Store;

/// Transient host snapshot; streamed, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub cpu_percent: f32,
    pub cpu_count: usize,
    pub load: [f64; 3],
    pub memory: MemoryStats,
    pub disk: DiskStats,
    pub network: NetworkStats,
    pub uptime_secs: u64,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub used_percent: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskStats {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub used_percent: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
}

pub struct SystemMonitor {
    settings: SettingsHandle,
    store: Store,
    queue: NotificationQueue,
    sys: Mutex<System>,
    last_alert: Mutex<HashMap<&'static str, DateTime<Utc>>>,
}

impl SystemMonitor {
    pub fn new(settings: SettingsHandle, store: Store, queue: NotificationQueue) -> Self {
        Self {
            settings,
            store,
            queue,
            sys: Mutex::new(System::new()),
            last_alert: Mutex::new(HashMap::new()),
        }
    }

    pub fn snapshot(&self) -> SystemStats {
        let mut sys = self.sys.lock().expect("sysinfo lock poisoned");
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let cpu_percent = sys.global_cpu_usage();
        let cpu_count = sys.cpus().len();
        let total_mem = sys.total_memory();
        let used_mem = sys.used_memory();
        drop(sys);

        let disks = Disks::new_with_refreshed_list();
        let (disk_total, disk_free) = disks
            .list()
            .iter()
            .fold((0u64, 0u64), |(t, f), d| (t + d.total_space(), f + d.available_space()));

        let networks = Networks::new_with_refreshed_list();
        let network = networks.list().values().fold(
            NetworkStats { bytes_sent: 0, bytes_received: 0, packets_sent: 0, packets_received: 0 },
            |acc, data| NetworkStats {
                bytes_sent: acc.bytes_sent + data.total_transmitted(),
                bytes_received: acc.bytes_received + data.total_received(),
                packets_sent: acc.packets_sent + data.total_packets_transmitted(),
                packets_received: acc.packets_received + data.total_packets_received(),
            },
        );

        let load = System::load_average();
        SystemStats {
            cpu_percent,
            cpu_count,
            load: [load.one, load.five, load.fifteen],
            memory: MemoryStats {
                total: total_mem,
                used: used_mem,
                free: total_mem.saturating_sub(used_mem),
                used_percent: percent(used_mem, total_mem),
            },
            disk: DiskStats {
                total: disk_total,
                used: disk_total.saturating_sub(disk_free),
                free: disk_free,
                used_percent: percent(disk_total.saturating_sub(disk_free), disk_total),
            },
            network,
            uptime_secs: System::uptime(),
            taken_at: Utc::now(),
        }
    }

    /// One monitoring pass over the current thresholds.
    pub async fn check_once(&self) {
        let monitor = self.settings.get().monitor;
        let stats = self.snapshot();

        let checks: [(&'static str, bool, f32, f32); 3] = [
            ("cpu", monitor.cpu_enabled, stats.cpu_percent, monitor.cpu_threshold),
            ("memory", monitor.memory_enabled, stats.memory.used_percent, monitor.memory_threshold),
            ("disk", monitor.disk_enabled, stats.disk.used_percent, monitor.disk_threshold),
        ];

        for (kind, enabled, observed, threshold) in checks {
            if !enabled || observed < threshold {
                continue;
            }
            if !self.should_alert(kind, monitor.alert_interval_mins) {
                continue;
            }
            let message = format!("{kind} usage {observed:.1}% exceeds threshold {threshold:.1}%");
            tracing::warn!(kind, observed, threshold, "system threshold exceeded");
            if let Err(e) = self
                .store
                .create_alert(kind, observed as f64, threshold as f64, &message)
                .await
            {
                tracing::error!(error = %e, "alert record failed");
            }

            let settings = self.settings.get();
            if settings.admin.notify_on_system && !settings.admin.email.is_empty() {
                self.queue.enqueue(Notification::new(
                    NotificationKind::SystemAlert,
                    vec![settings.admin.email],
                    format!("System alert: {kind} at {observed:.1}%"),
                    format!("<p>{message}</p>"),
                ));
            }
        }
    }

    fn should_alert(&self, kind: &'static str, interval_mins: u64) -> bool {
        let now = Utc::now();
        let mut last = self.last_alert.lock().expect("alert map poisoned");
        match last.get(kind) {
            Some(&t) if now - t < chrono::Duration::minutes(interval_mins.max(1) as i64) => false,
            _ => {
                last.insert(kind, now);
                true
            }
        }
    }

    pub async fn run(self: std::sync::Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("system monitor started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(60)) => self.check_once().await,
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("system monitor stopped");
    }
}

fn percent(used: u64, total: u64) -> f32 {
    if total == 0 { 0.0 } else { (used as f64 * 100.0 / total as f64) as f32 }
}
