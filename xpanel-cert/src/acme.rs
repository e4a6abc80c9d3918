//! ACME (RFC 8555) certificate issuance.
//!
//! Account keys are created lazily with terms agreed and cached on disk, so
//! repeated renewals reuse one registration. Challenges come from settings:
//! HTTP-01 writes the key authorization under the configured webroot,
//! TLS-ALPN-01 binds a transient responder that answers `acme-tls/1`
//! handshakes with the special self-signed challenge certificate.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, CustomExtension, KeyPair};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use xpanel_config::ChallengeKind;
use xpanel_core::{Error, Result};

use crate::{CertBackend, IssuedCert};

const ACME_TLS_ALPN: &[u8] = b"acme-tls/1";
const TLS_ALPN_PORT: u16 = 443;
const POLL_ATTEMPTS: u32 = 10;

pub struct AcmeBackend {
    directory_url: String,
    challenge: ChallengeKind,
    webroot: PathBuf,
    account_cache: PathBuf,
}

impl AcmeBackend {
    pub fn new(
        directory_url: impl Into<String>,
        challenge: ChallengeKind,
        webroot: impl Into<PathBuf>,
        account_cache: impl Into<PathBuf>,
    ) -> Self {
        Self {
            directory_url: directory_url.into(),
            challenge,
            webroot: webroot.into(),
            account_cache: account_cache.into(),
        }
    }

    /// Load the cached registration or register a fresh account.
    async fn account(&self) -> Result<Account> {
        if self.account_cache.exists() {
            let raw = tokio::fs::read(&self.account_cache).await?;
            let credentials: AccountCredentials = serde_json::from_slice(&raw)
                .map_err(|e| Error::internal(format!("acme account cache: {e}")))?;
            return Account::from_credentials(credentials)
                .await
                .map_err(|e| Error::upstream(format!("acme account restore: {e}")));
        }

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await
        .map_err(|e| Error::upstream(format!("acme registration: {e}")))?;

        if let Some(parent) = self.account_cache.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_vec(&credentials)
            .map_err(|e| Error::internal(format!("acme account serialize: {e}")))?;
        tokio::fs::write(&self.account_cache, raw).await?;
        tracing::info!(cache = %self.account_cache.display(), "acme account registered");
        Ok(account)
    }

    async fn satisfy_challenges(&self, order: &mut Order, domain: &str) -> Result<Vec<PathBuf>> {
        let wanted = match self.challenge {
            ChallengeKind::Http01 => ChallengeType::Http01,
            ChallengeKind::TlsAlpn01 => ChallengeType::TlsAlpn01,
        };

        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| Error::upstream(format!("acme authorizations: {e}")))?;

        let mut staged_files = Vec::new();
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Valid => continue,
                AuthorizationStatus::Pending => {}
                other => {
                    return Err(Error::upstream(format!(
                        "authorization for {domain} in unexpected state {other:?}"
                    )));
                }
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == wanted)
                .ok_or_else(|| {
                    Error::upstream(format!("server offered no {wanted:?} challenge for {domain}"))
                })?;
            let key_auth = order.key_authorization(challenge);

            match self.challenge {
                ChallengeKind::Http01 => {
                    let dir = self.webroot.join(".well-known/acme-challenge");
                    tokio::fs::create_dir_all(&dir).await?;
                    let path = dir.join(&challenge.token);
                    tokio::fs::write(&path, key_auth.as_str()).await?;
                    staged_files.push(path);
                }
                ChallengeKind::TlsAlpn01 => {
                    let digest = Sha256::digest(key_auth.as_str().as_bytes());
                    spawn_alpn_responder(domain, &digest).await?;
                }
            }

            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(|e| Error::upstream(format!("acme challenge ready: {e}")))?;
        }
        Ok(staged_files)
    }
}

#[async_trait]
impl CertBackend for AcmeBackend {
    async fn obtain(&self, domain: &str) -> Result<IssuedCert> {
        tracing::info!(domain, directory = %self.directory_url, "starting acme order");
        let account = self.account().await?;

        let identifier = Identifier::Dns(domain.to_string());
        let mut order = account
            .new_order(&NewOrder { identifiers: &[identifier] })
            .await
            .map_err(|e| Error::upstream(format!("acme new order: {e}")))?;

        let staged = self.satisfy_challenges(&mut order, domain).await?;
        let outcome = finalize_order(&mut order, domain).await;

        // Challenge artifacts are removed regardless of the outcome.
        for path in staged {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::debug!(path = %path.display(), error = %e, "challenge file cleanup failed");
            }
        }
        outcome
    }
}

/// Poll until the order leaves pending, then finalize with a fresh CSR and
/// collect the issued bundle.
async fn finalize_order(order: &mut Order, domain: &str) -> Result<IssuedCert> {
    let mut delay = Duration::from_millis(500);
    let mut attempts = 0;
    // Only the status is kept: the order is borrowed again for finalization.
    let status = loop {
        let state = order
            .refresh()
            .await
            .map_err(|e| Error::upstream(format!("acme order refresh: {e}")))?;
        match state.status {
            OrderStatus::Ready | OrderStatus::Valid => break state.status,
            OrderStatus::Invalid => {
                return Err(Error::upstream(format!("acme order for {domain} became invalid")));
            }
            _ => {
                attempts += 1;
                if attempts > POLL_ATTEMPTS {
                    return Err(Error::upstream(format!(
                        "acme order for {domain} still pending after {POLL_ATTEMPTS} polls"
                    )));
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(8));
            }
        }
    };

    let key_pair =
        KeyPair::generate().map_err(|e| Error::internal(format!("csr key: {e}")))?;
    if status == OrderStatus::Ready {
        let params = CertificateParams::new(vec![domain.to_string()])
            .map_err(|e| Error::internal(format!("csr params: {e}")))?;
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| Error::internal(format!("csr serialize: {e}")))?;
        order
            .finalize(csr.der())
            .await
            .map_err(|e| Error::upstream(format!("acme finalize: {e}")))?;
    }

    let mut attempts = 0;
    let cert_pem = loop {
        match order
            .certificate()
            .await
            .map_err(|e| Error::upstream(format!("acme certificate fetch: {e}")))?
        {
            Some(pem) => break pem,
            None => {
                attempts += 1;
                if attempts > POLL_ATTEMPTS {
                    return Err(Error::upstream(format!(
                        "issued certificate for {domain} never became available"
                    )));
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    };

    tracing::info!(domain, "acme order complete");
    Ok(IssuedCert { cert_pem, key_pem: key_pair.serialize_pem() })
}

/// Transient TLS-ALPN-01 responder: a listener that answers `acme-tls/1`
/// handshakes with the challenge certificate until dropped. Validation
/// happens within the order poll window, after which the task is abandoned
/// and the socket closes with it.
async fn spawn_alpn_responder(domain: &str, key_auth_digest: &[u8]) -> Result<()> {
    let mut params = CertificateParams::new(vec![domain.to_string()])
        .map_err(|e| Error::internal(format!("alpn cert params: {e}")))?;
    params.custom_extensions = vec![CustomExtension::new_acme_identifier(key_auth_digest)];
    let key_pair =
        KeyPair::generate().map_err(|e| Error::internal(format!("alpn key: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::internal(format!("alpn cert: {e}")))?;

    let cert_der = cert.der().clone();
    let key_der = rustls::pki_types::PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| Error::internal(format!("alpn key der: {e}")))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .map_err(|e| Error::internal(format!("alpn tls config: {e}")))?;
    config.alpn_protocols = vec![ACME_TLS_ALPN.to_vec()];

    let listener = TcpListener::bind(("0.0.0.0", TLS_ALPN_PORT))
        .await
        .map_err(|e| Error::upstream(format!("tls-alpn-01 bind on {TLS_ALPN_PORT}: {e}")))?;
    let acceptor = TlsAcceptor::from(Arc::new(config));

    tokio::spawn(async move {
        while let Ok((stream, peer)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                match acceptor.accept(stream).await {
                    Ok(mut tls) => {
                        tracing::debug!(%peer, "answered acme-tls/1 handshake");
                        let _ = tls.shutdown().await;
                    }
                    Err(e) => tracing::debug!(%peer, error = %e, "alpn handshake failed"),
                }
            });
        }
    });
    Ok(())
}
