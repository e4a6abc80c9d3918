//! Certificate lifecycle management.
//!
//! One manager owns the `domain → Certificate` map, loaded from the store at
//! startup. Two independent periodic loops run against it, each protected
//! against overlapping ticks: the check loop parses leaf PEMs and tracks
//! expiry status, the renew loop re-obtains anything expiring or expired.
//! The issuing backend (ACME or self-signed) is selected by configuration.

mod acme;
mod manager;
mod selfsigned;

pub use acme::AcmeBackend;
pub use manager::CertManager;
pub use selfsigned::SelfSignedBackend;

use async_trait::async_trait;
use xpanel_core::Result;

/// A freshly issued certificate bundle and its private key, PEM-encoded.
#[derive(Debug, Clone)]
pub struct IssuedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Issuing backend seam. The manager never cares how the PEMs came to be.
#[async_trait]
pub trait CertBackend: Send + Sync {
    async fn obtain(&self, domain: &str) -> Result<IssuedCert>;
}
