//! Self-signed certificate generation.
//!
//! Fallback backend for local testing and for deployments where ACME is
//! disabled: a one-year certificate signed by its own key, CN = domain, SAN
//! covering the domain (as an IP when it parses as one) plus `www.<domain>`
//! for non-www bare hostnames.

use async_trait::async_trait;
use rcgen::{CertificateParams, DnType, KeyPair};
use xpanel_core::{Error, Result};

use crate::{CertBackend, IssuedCert};

const VALIDITY_DAYS: i64 = 365;

pub struct SelfSignedBackend;

/// SANs to cover for a requested hostname. IPs get themselves only; bare
/// hostnames that do not already start with `www.` also cover the www form.
pub(crate) fn san_names(domain: &str) -> Vec<String> {
    let mut names = vec![domain.to_string()];
    let is_ip = domain.parse::<std::net::IpAddr>().is_ok();
    if !is_ip && !domain.starts_with("www.") {
        names.push(format!("www.{domain}"));
    }
    names
}

pub(crate) fn generate(domain: &str) -> Result<IssuedCert> {
    let mut params = CertificateParams::new(san_names(domain))
        .map_err(|e| Error::internal(format!("certificate params: {e}")))?;
    params.distinguished_name.push(DnType::CommonName, domain);

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(VALIDITY_DAYS);

    let key_pair =
        KeyPair::generate().map_err(|e| Error::internal(format!("key generation: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::internal(format!("self-sign: {e}")))?;

    Ok(IssuedCert { cert_pem: cert.pem(), key_pem: key_pair.serialize_pem() })
}

#[async_trait]
impl CertBackend for SelfSignedBackend {
    async fn obtain(&self, domain: &str) -> Result<IssuedCert> {
        tracing::info!(domain, "issuing self-signed certificate");
        generate(domain)
    }
}
