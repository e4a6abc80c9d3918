use serde::{Deserialize, Serialize};
use xpanel_core::{Error, Result};

/// The whole settings document. Unknown sections are rejected; missing
/// sections and fields fall back to defaults so a minimal file stays valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Settings {
    pub site: SiteSettings,
    pub admin: AdminSettings,
    pub ssl: SslSettings,
    pub notification: NotificationSettings,
    pub monitor: MonitorSettings,
    pub traffic: TrafficSettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteSettings {
    pub name: String,
    pub listen: String,
    pub port: u16,
    pub base_path: String,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            name: "xpanel".to_string(),
            listen: "0.0.0.0".to_string(),
            port: 8080,
            base_path: "/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminSettings {
    pub email: String,
    /// Notify the admin when a user's quota is enforced, not only the user.
    pub notify_on_quota: bool,
    pub notify_on_cert: bool,
    pub notify_on_system: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChallengeKind {
    Http01,
    TlsAlpn01,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SslSettings {
    pub cert_dir: String,
    pub acme_directory: String,
    pub acme_enabled: bool,
    pub webroot: String,
    pub challenge: ChallengeKind,
    pub renew_before_days: i64,
    pub expiry_warning_days: i64,
    pub check_interval_secs: u64,
    pub renew_interval_secs: u64,
}

impl Default for SslSettings {
    fn default() -> Self {
        Self {
            cert_dir: "certs".to_string(),
            acme_directory: "https://acme-v02.api.letsencrypt.org/directory".to_string(),
            acme_enabled: false,
            webroot: "web".to_string(),
            challenge: ChallengeKind::Http01,
            renew_before_days: 30,
            expiry_warning_days: 30,
            check_interval_secs: 6 * 3600,
            renew_interval_secs: 12 * 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub enabled: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_password: String,
    pub from_address: String,
    pub from_name: String,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: String::new(),
            smtp_port: 587,
            smtp_user: String::new(),
            smtp_password: String::new(),
            from_address: String::new(),
            from_name: "xpanel".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub cpu_enabled: bool,
    pub memory_enabled: bool,
    pub disk_enabled: bool,
    pub cpu_threshold: f32,
    pub memory_threshold: f32,
    pub disk_threshold: f32,
    pub alert_interval_mins: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            cpu_enabled: true,
            memory_enabled: true,
            disk_enabled: true,
            cpu_threshold: 90.0,
            memory_threshold: 90.0,
            disk_threshold: 90.0,
            alert_interval_mins: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficSettings {
    pub default_quota_bytes: u64,
    pub default_validity_days: i64,
    pub sampling_interval_secs: u64,
    pub rollup_interval_secs: u64,
    pub retention_days: i64,
    pub warning_ratio: f64,
    pub warning_interval_secs: u64,
}

impl Default for TrafficSettings {
    fn default() -> Self {
        Self {
            default_quota_bytes: 0,
            default_validity_days: 0,
            sampling_interval_secs: 1,
            rollup_interval_secs: 60,
            retention_days: 30,
            warning_ratio: xpanel_core::DEFAULT_WARNING_RATIO,
            warning_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogRotation {
    pub max_size_mb: u64,
    pub max_age_days: u64,
    pub max_backups: usize,
    pub compress: bool,
}

impl Default for LogRotation {
    fn default() -> Self {
        Self { max_size_mb: 50, max_age_days: 14, max_backups: 7, compress: false }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub rotation: LogRotation,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self { level: "info".to_string(), rotation: LogRotation::default() }
    }
}

impl Settings {
    /// Validate a candidate document before it replaces the live one.
    pub fn validate(&self) -> Result<()> {
        if self.site.port == 0 {
            return Err(Error::bad_request("site.port must be in [1, 65535]"));
        }
        if self.site.name.trim().is_empty() {
            return Err(Error::bad_request("site.name must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.traffic.warning_ratio) {
            return Err(Error::bad_request("traffic.warning_ratio must be in [0, 1]"));
        }
        if self.traffic.sampling_interval_secs == 0 {
            return Err(Error::bad_request("traffic.sampling_interval_secs must be > 0"));
        }
        if self.traffic.rollup_interval_secs == 0 {
            return Err(Error::bad_request("traffic.rollup_interval_secs must be > 0"));
        }
        if self.traffic.retention_days < 1 {
            return Err(Error::bad_request("traffic.retention_days must be >= 1"));
        }
        if self.ssl.expiry_warning_days < 1 {
            return Err(Error::bad_request("ssl.expiry_warning_days must be >= 1"));
        }
        if self.ssl.check_interval_secs == 0 || self.ssl.renew_interval_secs == 0 {
            return Err(Error::bad_request("ssl check/renew intervals must be > 0"));
        }
        if self.notification.enabled {
            if self.notification.smtp_host.is_empty() {
                return Err(Error::bad_request("notification.smtp_host required when enabled"));
            }
            if self.notification.from_address.is_empty() {
                return Err(Error::bad_request("notification.from_address required when enabled"));
            }
        }
        for (name, t) in [
            ("cpu", self.monitor.cpu_threshold),
            ("memory", self.monitor.memory_threshold),
            ("disk", self.monitor.disk_threshold),
        ] {
            if !(0.0..=100.0).contains(&t) {
                return Err(Error::bad_request(format!(
                    "monitor.{name}_threshold must be in [0, 100]"
                )));
            }
        }
        match self.log.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(Error::bad_request(format!("log.level '{other}' not recognized")));
            }
        }
        Ok(())
    }

    pub const SECTIONS: [&'static str; 7] =
        ["site", "admin", "ssl", "notification", "monitor", "traffic", "log"];

    /// One section of the document as a JSON value, addressed by name.
    pub fn section(&self, name: &str) -> Result<serde_json::Value> {
        let v = match name {
            "site" => serde_json::to_value(&self.site),
            "admin" => serde_json::to_value(&self.admin),
            "ssl" => serde_json::to_value(&self.ssl),
            "notification" => serde_json::to_value(&self.notification),
            "monitor" => serde_json::to_value(&self.monitor),
            "traffic" => serde_json::to_value(&self.traffic),
            "log" => serde_json::to_value(&self.log),
            _ => return Err(Error::not_found("settings section")),
        };
        v.map_err(|e| Error::internal(e.to_string()))
    }

    /// Replace one section from a JSON value, returning the updated document.
    pub fn with_section(&self, name: &str, value: serde_json::Value) -> Result<Settings> {
        let mut next = self.clone();
        match name {
            "site" => next.site = serde_json::from_value(value)?,
            "admin" => next.admin = serde_json::from_value(value)?,
            "ssl" => next.ssl = serde_json::from_value(value)?,
            "notification" => next.notification = serde_json::from_value(value)?,
            "monitor" => next.monitor = serde_json::from_value(value)?,
            "traffic" => next.traffic = serde_json::from_value(value)?,
            "log" => next.log = serde_json::from_value(value)?,
            _ => return Err(Error::not_found("settings section")),
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_valid_defaults() {
        let s: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(s, Settings::default());
        s.validate().unwrap();
        assert_eq!(s.traffic.warning_ratio, 0.8);
        assert_eq!(s.traffic.retention_days, 30);
        assert_eq!(s.site.port, 8080);
    }

    #[test]
    fn unknown_section_rejected() {
        let r: std::result::Result<Settings, _> = serde_json::from_str(r#"{"sitee": {}}"#);
        assert!(r.is_err());
    }

    #[test]
    fn validate_rejects_bad_ratio() {
        let mut s = Settings::default();
        s.traffic.warning_ratio = 1.5;
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_requires_smtp_host_when_enabled() {
        let mut s = Settings::default();
        s.notification.enabled = true;
        assert!(s.validate().is_err());
        s.notification.smtp_host = "mail.example.com".into();
        s.notification.from_address = "panel@example.com".into();
        s.validate().unwrap();
    }

    #[test]
    fn challenge_kind_kebab_case() {
        let s = serde_json::to_string(&ChallengeKind::TlsAlpn01).unwrap();
        assert_eq!(s, "\"tls-alpn-01\"");
        let c: ChallengeKind = serde_json::from_str("\"http-01\"").unwrap();
        assert_eq!(c, ChallengeKind::Http01);
    }

    #[test]
    fn section_round_trip() {
        let s = Settings::default();
        let site = s.section("site").unwrap();
        let next = s.with_section("site", site).unwrap();
        assert_eq!(next, s);
    }

    #[test]
    fn unknown_section_is_not_found() {
        let s = Settings::default();
        assert_eq!(s.section("nope").unwrap_err().status(), 404);
        assert_eq!(s.with_section("nope", serde_json::json!({})).unwrap_err().status(), 404);
    }
}
