//! SNI-based certificate selection during the TLS handshake.
//!
//! Each HTTPS listener owns a selector: the certificate store is consulted
//! by the requested hostname, and hosts without a certificate of their own
//! fall back to the listener's default bundle.

use super::store::{CertBundle, CertStore};
use async_trait::async_trait;
use openssl::ssl::SslRef;
use pingora_core::listeners::TlsAccept;
use std::sync::Arc;

pub struct SniCertSelector {
    store: Arc<CertStore>,
    default_bundle: Arc<CertBundle>,
}

impl SniCertSelector {
    pub fn new(store: Arc<CertStore>, default_bundle: Arc<CertBundle>) -> Self {
        Self {
            store,
            default_bundle,
        }
    }

    fn bundle_for(&self, sni: Option<&str>) -> Arc<CertBundle> {
        sni.and_then(|hostname| self.store.bundle_for(hostname))
            .unwrap_or_else(|| self.default_bundle.clone())
    }
}

impl std::fmt::Debug for SniCertSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniCertSelector").finish()
    }
}

#[async_trait]
impl TlsAccept for SniCertSelector {
    async fn certificate_callback(&self, ssl: &mut SslRef) {
        let sni = ssl
            .servername(openssl::ssl::NameType::HOST_NAME)
            .map(str::to_string);

        tracing::debug!(hostname = ?sni, "SNI certificate lookup");

        let bundle = self.bundle_for(sni.as_deref());
        if let Err(e) = bundle.apply(ssl) {
            tracing::error!(hostname = ?sni, "Failed to install certificate: {}", e);
        }
    }
}
