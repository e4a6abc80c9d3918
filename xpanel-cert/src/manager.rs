use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::watch;
use xpanel_config::SettingsHandle;
use xpanel_core::{Error, Result};
use xpanel_notify::{Notification, NotificationKind, NotificationQueue};
use xpanel_store::{CertStatus, Certificate, NewCertificate, Store};

use crate::{AcmeBackend, CertBackend, IssuedCert, SelfSignedBackend};

pub struct CertManager {
    store: Store,
    settings: SettingsHandle,
    queue: NotificationQueue,
    certs: RwLock<HashMap<String, Certificate>>,
    check_guard: tokio::sync::Mutex<()>,
    renew_guard: tokio::sync::Mutex<()>,
    backend_override: Option<Arc<dyn CertBackend>>,
}

impl CertManager {
    /// Load the known certificates from the store and build the manager.
    pub async fn load(
        store: Store,
        settings: SettingsHandle,
        queue: NotificationQueue,
    ) -> Result<Arc<Self>> {
        let mut map = HashMap::new();
        for cert in store.list_certificates().await? {
            map.insert(cert.domain.clone(), cert);
        }
        tracing::info!(certificates = map.len(), "certificate manager loaded");
        Ok(Arc::new(Self {
            store,
            settings,
            queue,
            certs: RwLock::new(map),
            check_guard: tokio::sync::Mutex::new(()),
            renew_guard: tokio::sync::Mutex::new(()),
            backend_override: None,
        }))
    }

    /// Pin the issuing backend, bypassing settings. Test hook.
    pub fn with_backend(mut manager: Arc<Self>, backend: Arc<dyn CertBackend>) -> Arc<Self> {
        Arc::get_mut(&mut manager)
            .expect("with_backend must run before the manager is shared")
            .backend_override = Some(backend);
        manager
    }

    fn backend(&self) -> Arc<dyn CertBackend> {
        if let Some(backend) = &self.backend_override {
            return backend.clone();
        }
        let ssl = self.settings.get().ssl;
        if ssl.acme_enabled {
            Arc::new(AcmeBackend::new(
                ssl.acme_directory.clone(),
                ssl.challenge,
                ssl.webroot.clone(),
                Path::new(&ssl.cert_dir).join("acme-account.json"),
            ))
        } else {
            Arc::new(SelfSignedBackend)
        }
    }

    pub fn list(&self) -> Vec<Certificate> {
        let mut certs: Vec<_> =
            self.certs.read().expect("cert map poisoned").values().cloned().collect();
        certs.sort_by(|a, b| a.domain.cmp(&b.domain));
        certs
    }

    pub fn get(&self, domain: &str) -> Result<Certificate> {
        self.certs
            .read()
            .expect("cert map poisoned")
            .get(domain)
            .cloned()
            .ok_or_else(|| Error::not_found("certificate"))
    }

    /// Register a domain and obtain its first certificate.
    pub async fn create(&self, domain: &str) -> Result<Certificate> {
        let domain = normalize_domain(domain)?;
        let cert_dir = PathBuf::from(self.settings.get().ssl.cert_dir);
        tokio::fs::create_dir_all(&cert_dir).await?;

        let entity = self
            .store
            .create_certificate(NewCertificate {
                domain: domain.clone(),
                cert_path: cert_dir.join(format!("{domain}.crt")).display().to_string(),
                key_path: cert_dir.join(format!("{domain}.key")).display().to_string(),
            })
            .await?;
        self.certs.write().expect("cert map poisoned").insert(domain.clone(), entity);

        match self.obtain_and_install(&domain).await {
            Ok(cert) => Ok(cert),
            Err(e) => {
                // Keep the entity so the renew loop retries; report the failure.
                self.set_status(&domain, CertStatus::Error, None).await?;
                Err(e)
            }
        }
    }

    /// Force an immediate renewal, regardless of current status.
    pub async fn renew(&self, domain: &str) -> Result<Certificate> {
        // Ensure the domain is known before going to the backend.
        self.get(domain)?;
        self.obtain_and_install(domain).await
    }

    /// Remove PEM files best-effort, then the entity.
    pub async fn delete(&self, domain: &str) -> Result<()> {
        let cert = self.get(domain)?;
        for path in [&cert.cert_path, &cert.key_path] {
            if let Err(e) = tokio::fs::remove_file(path).await {
                tracing::debug!(path, error = %e, "certificate file removal skipped");
            }
        }
        self.store.delete_certificate(domain).await?;
        self.certs.write().expect("cert map poisoned").remove(domain);
        tracing::info!(domain, "certificate deleted");
        Ok(())
    }

    async fn obtain_and_install(&self, domain: &str) -> Result<Certificate> {
        let cert = self.get(domain)?;
        let issued = match self.backend().obtain(domain).await {
            Ok(issued) => issued,
            Err(e) => {
                self.notify(
                    NotificationKind::CertRenewFailure,
                    format!("Certificate renewal failed for {domain}"),
                    format!("<p>Renewing <b>{domain}</b> failed: {e}</p>"),
                );
                return Err(e);
            }
        };

        write_pair(Path::new(&cert.cert_path), Path::new(&cert.key_path), &issued).await?;
        let expires_at = parse_leaf_expiry(issued.cert_pem.as_bytes())?;
        let now = Utc::now();
        self.store
            .update_certificate_status(domain, CertStatus::Valid, Some(now), Some(now), Some(expires_at))
            .await?;

        let updated = self.store.certificate_by_domain(domain).await?;
        self.certs
            .write()
            .expect("cert map poisoned")
            .insert(domain.to_string(), updated.clone());
        tracing::info!(domain, expires = %expires_at, "certificate installed");
        Ok(updated)
    }

    async fn set_status(&self, domain: &str, status: CertStatus, checked: Option<DateTime<Utc>>) -> Result<()> {
        self.store
            .update_certificate_status(domain, status, checked, None, None)
            .await?;
        if let Some(cert) = self.certs.write().expect("cert map poisoned").get_mut(domain) {
            cert.status = status;
            if checked.is_some() {
                cert.last_checked = checked;
            }
        }
        Ok(())
    }

    /// One pass of the check loop: classify every known certificate by its
    /// on-disk leaf and emit a notification on transition into
    /// expiring/expired.
    pub async fn check_once(&self) -> Result<()> {
        self.check_once_at(Utc::now()).await
    }

    pub async fn check_once_at(&self, now: DateTime<Utc>) -> Result<()> {
        let Ok(_guard) = self.check_guard.try_lock() else {
            tracing::debug!("certificate check already running, tick skipped");
            return Ok(());
        };
        let warning_days = self.settings.get().ssl.expiry_warning_days;

        for cert in self.list() {
            let (status, expiry) = classify(Path::new(&cert.cert_path), now, warning_days);
            if let Err(e) = self
                .store
                .update_certificate_status(&cert.domain, status, Some(now), None, expiry)
                .await
            {
                tracing::error!(domain = cert.domain, error = %e, "status update failed");
                continue;
            }
            if let Some(live) = self.certs.write().expect("cert map poisoned").get_mut(&cert.domain)
            {
                live.status = status;
                live.last_checked = Some(now);
                if expiry.is_some() {
                    live.expires_at = expiry;
                }
            }

            let transitioned = cert.status != status;
            if transitioned && matches!(status, CertStatus::ExpiringSoon | CertStatus::Expired) {
                let word = match status {
                    CertStatus::Expired => "expired",
                    _ => "expiring soon",
                };
                tracing::warn!(domain = cert.domain, status = status.as_str(), "certificate state change");
                self.notify(
                    NotificationKind::CertExpiry,
                    format!("Certificate for {} is {word}", cert.domain),
                    format!(
                        "<p>The certificate for <b>{}</b> is {word}{}.</p>",
                        cert.domain,
                        expiry
                            .map(|e| format!(" (not valid after {e})"))
                            .unwrap_or_default()
                    ),
                );
            }
        }
        Ok(())
    }

    /// One pass of the renew loop: re-obtain every certificate whose status
    /// is expired or expiring soon. Failures keep the old pair in place.
    pub async fn renew_due_once(&self) -> Result<()> {
        let Ok(_guard) = self.renew_guard.try_lock() else {
            tracing::debug!("certificate renewal already running, tick skipped");
            return Ok(());
        };

        for cert in self.list() {
            if !matches!(cert.status, CertStatus::Expired | CertStatus::ExpiringSoon) {
                continue;
            }
            match self.obtain_and_install(&cert.domain).await {
                Ok(_) => tracing::info!(domain = cert.domain, "certificate renewed"),
                Err(e) => {
                    tracing::error!(domain = cert.domain, error = %e, "renewal failed, keeping old pair");
                }
            }
        }
        Ok(())
    }

    /// Periodic check loop; interval re-read each tick so settings changes
    /// apply without a restart.
    pub async fn run_check_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let interval = self.settings.get().ssl.check_interval_secs.max(1);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(interval)) => {
                    if let Err(e) = self.check_once().await {
                        tracing::error!(error = %e, "certificate check pass failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("certificate check loop stopped");
    }

    pub async fn run_renew_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let interval = self.settings.get().ssl.renew_interval_secs.max(1);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(interval)) => {
                    if let Err(e) = self.renew_due_once().await {
                        tracing::error!(error = %e, "certificate renew pass failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("certificate renew loop stopped");
    }

    fn notify(&self, kind: NotificationKind, subject: String, body: String) {
        let settings = self.settings.get();
        if !settings.admin.notify_on_cert || settings.admin.email.is_empty() {
            return;
        }
        self.queue
            .enqueue(Notification::new(kind, vec![settings.admin.email], subject, body));
    }
}

fn normalize_domain(domain: &str) -> Result<String> {
    let domain = domain.trim().to_ascii_lowercase();
    if domain.is_empty()
        || domain.contains('/')
        || domain.contains(' ')
        || domain.contains("..")
    {
        return Err(Error::bad_request("invalid domain"));
    }
    Ok(domain)
}

/// Read the PEM pair into a status. A missing or unparseable file is an
/// error status, not a panel failure; the renew loop decides what to do.
fn classify(cert_path: &Path, now: DateTime<Utc>, warning_days: i64) -> (CertStatus, Option<DateTime<Utc>>) {
    let bytes = match std::fs::read(cert_path) {
        Ok(b) => b,
        Err(_) => return (CertStatus::Error, None),
    };
    let expiry = match parse_leaf_expiry(&bytes) {
        Ok(e) => e,
        Err(_) => return (CertStatus::Error, None),
    };
    let status = if expiry <= now {
        CertStatus::Expired
    } else if expiry <= now + chrono::Duration::days(warning_days) {
        CertStatus::ExpiringSoon
    } else {
        CertStatus::Valid
    };
    (status, Some(expiry))
}

/// NotAfter of the leaf (first) certificate in a PEM bundle.
fn parse_leaf_expiry(pem_bytes: &[u8]) -> Result<DateTime<Utc>> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem_bytes)
        .map_err(|e| Error::internal(format!("pem parse: {e}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| Error::internal(format!("x509 parse: {e}")))?;
    let ts = cert.validity().not_after.timestamp();
    Utc.timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| Error::internal("certificate expiry out of range"))
}

/// Replace the PEM pair atomically: both files staged as temp siblings, then
/// renamed consecutively, cert first, then permission bits fixed to
/// 0644 cert / 0600 key.
async fn write_pair(cert_path: &Path, key_path: &Path, issued: &IssuedCert) -> Result<()> {
    if let Some(parent) = cert_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let cert_tmp = cert_path.with_extension("crt.tmp");
    let key_tmp = key_path.with_extension("key.tmp");
    tokio::fs::write(&cert_tmp, issued.cert_pem.as_bytes()).await?;
    tokio::fs::write(&key_tmp, issued.key_pem.as_bytes()).await?;

    tokio::fs::rename(&cert_tmp, cert_path).await?;
    tokio::fs::rename(&key_tmp, key_path).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(cert_path, std::fs::Permissions::from_mode(0o644)).await?;
        tokio::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use xpanel_config::Settings;

    struct CountingBackend {
        obtained: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl CertBackend for CountingBackend {
        async fn obtain(&self, domain: &str) -> Result<IssuedCert> {
            self.obtained.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::upstream("directory unreachable"));
            }
            crate::selfsigned::generate(domain)
        }
    }

    async fn manager_in(
        dir: &Path,
        fail: bool,
    ) -> (Arc<CertManager>, Arc<CountingBackend>, NotificationQueue, Store) {
        let mut settings = Settings::default();
        settings.ssl.cert_dir = dir.display().to_string();
        settings.admin.email = "admin@example.com".into();
        settings.admin.notify_on_cert = true;
        let store = Store::open_in_memory().await.unwrap();
        let queue = NotificationQueue::new(16);
        let backend = Arc::new(CountingBackend { obtained: AtomicU32::new(0), fail });
        let manager = CertManager::load(
            store.clone(),
            SettingsHandle::ephemeral(settings),
            queue.clone(),
        )
        .await
        .unwrap();
        let manager = CertManager::with_backend(manager, backend.clone());
        (manager, backend, queue, store)
    }

    #[tokio::test]
    async fn create_installs_pair_with_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, backend, _queue, _store) = manager_in(dir.path(), false).await;

        let cert = manager.create("example.com").await.unwrap();
        assert_eq!(cert.status, CertStatus::Valid);
        assert_eq!(backend.obtained.load(Ordering::SeqCst), 1);
        assert!(cert.expires_at.is_some());

        let cert_meta = std::fs::metadata(&cert.cert_path).unwrap();
        let key_meta = std::fs::metadata(&cert.key_path).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(cert_meta.permissions().mode() & 0o777, 0o644);
            assert_eq!(key_meta.permissions().mode() & 0o777, 0o600);
        }
        let _ = (cert_meta, key_meta);
    }

    #[tokio::test]
    async fn check_transitions_and_notifies_once() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _backend, queue, _store) = manager_in(dir.path(), false).await;
        manager.create("soon.example.com").await.unwrap();

        // Drain any creation-time noise.
        while queue.try_pop().is_some() {}

        // Jump to 360 days out: inside the 30-day warning window of the
        // one-year self-signed pair.
        let later = Utc::now() + chrono::Duration::days(360);
        manager.check_once_at(later).await.unwrap();
        assert_eq!(manager.get("soon.example.com").unwrap().status, CertStatus::ExpiringSoon);

        let n = queue.try_pop().expect("expiry notification expected");
        assert_eq!(n.kind, NotificationKind::CertExpiry);

        // Second check with the same outcome does not re-notify.
        manager.check_once_at(later).await.unwrap();
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn renew_pass_replaces_expiring_pair() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, backend, _queue, _store) = manager_in(dir.path(), false).await;
        manager.create("renew.example.com").await.unwrap();
        let old_pem = std::fs::read_to_string(
            manager.get("renew.example.com").unwrap().cert_path,
        )
        .unwrap();

        let later = Utc::now() + chrono::Duration::days(360);
        manager.check_once_at(later).await.unwrap();
        manager.renew_due_once().await.unwrap();

        let cert = manager.get("renew.example.com").unwrap();
        assert_eq!(cert.status, CertStatus::Valid);
        assert_eq!(backend.obtained.load(Ordering::SeqCst), 2);
        let new_pem = std::fs::read_to_string(&cert.cert_path).unwrap();
        assert_ne!(old_pem, new_pem);

        // The installed pair is self-consistent: the cert on disk parses and
        // matches the recorded expiry.
        let expiry = parse_leaf_expiry(new_pem.as_bytes()).unwrap();
        assert_eq!(expiry.timestamp(), cert.expires_at.unwrap().timestamp());
    }

    #[tokio::test]
    async fn failed_renew_keeps_old_pair_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _ok_backend, queue, store) = manager_in(dir.path(), false).await;
        manager.create("keep.example.com").await.unwrap();
        while queue.try_pop().is_some() {}

        // Swap in a failing backend underneath the same store and files.
        let settings = manager.settings.clone();
        let failing = CertManager::load(store, settings, queue.clone()).await.unwrap();
        let failing = CertManager::with_backend(
            failing,
            Arc::new(CountingBackend { obtained: AtomicU32::new(0), fail: true }),
        );

        let before = std::fs::read_to_string(failing.get("keep.example.com").unwrap().cert_path).unwrap();
        let err = failing.renew("keep.example.com").await.unwrap_err();
        assert_eq!(err.status(), 502);
        let after = std::fs::read_to_string(failing.get("keep.example.com").unwrap().cert_path).unwrap();
        assert_eq!(before, after);

        let n = queue.try_pop().expect("renewal failure notification expected");
        assert_eq!(n.kind, NotificationKind::CertRenewFailure);
    }

    #[tokio::test]
    async fn delete_removes_files_and_entity() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _backend, _queue, _store) = manager_in(dir.path(), false).await;
        let cert = manager.create("gone.example.com").await.unwrap();
        assert!(Path::new(&cert.cert_path).exists());

        manager.delete("gone.example.com").await.unwrap();
        assert!(!Path::new(&cert.cert_path).exists());
        assert!(!Path::new(&cert.key_path).exists());
        assert_eq!(manager.get("gone.example.com").unwrap_err().status(), 404);
    }

    #[tokio::test]
    async fn invalid_domain_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _backend, _queue, _store) = manager_in(dir.path(), false).await;
        assert_eq!(manager.create("").await.unwrap_err().status(), 400);
        assert_eq!(manager.create("a/../b").await.unwrap_err().status(), 400);
    }
}
