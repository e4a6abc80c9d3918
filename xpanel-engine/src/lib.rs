//! Listener lifecycle manager.
//!
//! Owns the single long-lived child proxy-engine process and the inbound
//! declarations that determine its configuration. Reconciling the declared
//! set against the live process means: regenerate the engine config, rename
//! it over the live path, and restart the child. Binary acquisition, version
//! switching with revert, and the in-process event bus live here too.

pub mod config;
pub mod download;
mod events;
mod manager;
mod stats;

pub use events::{EVENT_BUS_CAPACITY, EventBus, EventStatus, XrayEvent, XrayEventType};
pub use manager::{EngineState, Watchdog, XrayManager};
pub use stats::XrayStatsSource;

use std::path::PathBuf;

/// Process-level engine options, fixed at startup.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Root of the engine tree: `bin/<version>/`, `downloads/`, `config.json`.
    pub base_dir: PathBuf,
    pub version: String,
    /// Mirror hosts tried before the direct release URL.
    pub mirrors: Vec<String>,
    /// Loopback port of the stats API inbound.
    pub api_port: u16,
    /// When set, this file is handed to the engine verbatim instead of the
    /// generated config. Validated as well-formed JSON before every restart.
    pub custom_config: Option<PathBuf>,
    pub route_cn_direct: bool,
    pub log_dir: PathBuf,
    /// Unexpected-exit restart policy. `None` (the default) leaves restarts
    /// to the operator.
    pub watchdog: Option<Watchdog>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("xray"),
            version: "v1.8.24".to_string(),
            mirrors: Vec::new(),
            api_port: 62789,
            custom_config: None,
            route_cn_direct: false,
            log_dir: PathBuf::from("logs"),
            watchdog: None,
        }
    }
}
