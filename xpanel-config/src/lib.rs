//! Settings document for the panel.
//!
//! A single typed JSON document loaded at startup and kept behind a
//! readers-writer lock. Mutation is atomic end to end: candidate validated,
//! written to a temp file, renamed over the live file, then swapped under the
//! write lock. Subscribers get a change notification through a watch channel
//! and reconfigure without a restart.

mod document;
mod handle;

pub use document::{
    AdminSettings, ChallengeKind, LogRotation, LogSettings, MonitorSettings,
    NotificationSettings, Settings, SiteSettings, SslSettings, TrafficSettings,
};
pub use handle::SettingsHandle;
