use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::sync::watch;
use xpanel_core::{Error, Result};

use crate::Settings;

/// Shared handle to the live settings document.
///
/// Readers clone the document out from under a brief read lock; a reader
/// therefore sees the pre-swap or post-swap document in full, never a mix.
/// `subscribe` hands out a watch receiver that fires after every swap.
#[derive(Clone)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Settings>>,
    path: Arc<PathBuf>,
    tx: watch::Sender<Settings>,
}

impl SettingsHandle {
    /// Load the document from `path`, or start from defaults (and create the
    /// file) when it does not exist yet.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let s: Settings = serde_json::from_str(&raw)
                .map_err(|e| Error::bad_request(format!("settings file: {e}")))?;
            s.validate()?;
            s
        } else {
            let s = Settings::default();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            write_atomic(&path, &s)?;
            tracing::info!(path = %path.display(), "settings file created with defaults");
            s
        };

        let (tx, _rx) = watch::channel(settings.clone());
        Ok(Self { inner: Arc::new(RwLock::new(settings)), path: Arc::new(path), tx })
    }

    /// In-memory handle for tests; swaps still notify but nothing is persisted.
    pub fn ephemeral(settings: Settings) -> Self {
        let (tx, _rx) = watch::channel(settings.clone());
        Self {
            inner: Arc::new(RwLock::new(settings)),
            path: Arc::new(PathBuf::new()),
            tx,
        }
    }

    /// Snapshot of the current document.
    pub fn get(&self) -> Settings {
        self.inner.read().expect("settings lock poisoned").clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Receiver that observes every swapped-in document.
    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }

    /// Validate and atomically install a candidate document.
    pub fn update(&self, candidate: Settings) -> Result<()> {
        candidate.validate()?;
        if !self.path.as_os_str().is_empty() {
            write_atomic(&self.path, &candidate)?;
        }
        {
            let mut live = self.inner.write().expect("settings lock poisoned");
            *live = candidate.clone();
        }
        // Receivers may have all gone away; that is fine.
        let _ = self.tx.send(candidate);
        Ok(())
    }

    /// Replace a single section; the rest of the document is untouched.
    pub fn update_section(&self, name: &str, value: serde_json::Value) -> Result<()> {
        let next = self.get().with_section(name, value)?;
        self.update(next)
    }

    /// Snapshot the live file next to itself with a UTC timestamp suffix.
    /// Returns the snapshot path.
    pub fn backup(&self) -> Result<PathBuf> {
        if self.path.as_os_str().is_empty() {
            return Err(Error::internal("ephemeral settings cannot be backed up"));
        }
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("settings");
        let backup = self.path.with_file_name(format!("{stem}-{stamp}.json"));
        fs::copy(self.path.as_ref(), &backup)?;
        tracing::info!(path = %backup.display(), "settings backed up");
        Ok(backup)
    }

    /// Validate a snapshot file and install it as the live document.
    pub fn restore(&self, snapshot: &Path) -> Result<()> {
        let raw = fs::read_to_string(snapshot)
            .map_err(|_| Error::not_found("settings snapshot"))?;
        let candidate: Settings = serde_json::from_str(&raw)
            .map_err(|e| Error::bad_request(format!("snapshot: {e}")))?;
        self.update(candidate)?;
        tracing::info!(path = %snapshot.display(), "settings restored from snapshot");
        Ok(())
    }
}

/// Serialize to a temp file in the target directory, then rename over the
/// live path so concurrent readers of the file never see a torn write.
fn write_atomic(path: &Path, settings: &Settings) -> Result<()> {
    let serialized = serde_json::to_string_pretty(settings)
        .map_err(|e| Error::internal(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serialized)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SiteSettings;

    #[test]
    fn load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config/settings.json");
        let handle = SettingsHandle::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(handle.get(), Settings::default());
    }

    #[test]
    fn update_persists_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let handle = SettingsHandle::load(&path).unwrap();
        let mut rx = handle.subscribe();

        let mut next = handle.get();
        next.site.name = "renamed".into();
        handle.update(next).unwrap();

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().site.name, "renamed");

        let reloaded = SettingsHandle::load(&path).unwrap();
        assert_eq!(reloaded.get().site.name, "renamed");
    }

    #[test]
    fn invalid_candidate_leaves_live_document() {
        let handle = SettingsHandle::ephemeral(Settings::default());
        let mut bad = handle.get();
        bad.traffic.warning_ratio = 2.0;
        assert!(handle.update(bad).is_err());
        assert_eq!(handle.get().traffic.warning_ratio, 0.8);
    }

    #[test]
    fn backup_then_restore_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let handle = SettingsHandle::load(&path).unwrap();

        let mut changed = handle.get();
        changed.site.name = "before-backup".into();
        handle.update(changed).unwrap();

        let snapshot = handle.backup().unwrap();

        let mut drifted = handle.get();
        drifted.site.name = "after-backup".into();
        handle.update(drifted).unwrap();

        handle.restore(&snapshot).unwrap();
        assert_eq!(handle.get().site.name, "before-backup");
    }

    #[test]
    fn restore_missing_snapshot_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let handle = SettingsHandle::load(dir.path().join("s.json")).unwrap();
        let err = handle.restore(&dir.path().join("absent.json")).unwrap_err();
        assert_eq!(err.status(), 404);
    }

    #[test]
    fn update_section_only_touches_that_section() {
        let handle = SettingsHandle::ephemeral(Settings::default());
        handle
            .update_section("traffic", serde_json::json!({"retention_days": 7}))
            .unwrap();
        let live = handle.get();
        assert_eq!(live.traffic.retention_days, 7);
        // Unspecified fields of the section fall back to defaults.
        assert_eq!(live.traffic.warning_ratio, 0.8);
        assert_eq!(live.site, SiteSettings::default());
    }
}
