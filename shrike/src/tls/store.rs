//! In-memory certificate store indexed by hostname for SNI lookup.

use dashmap::DashMap;
use openssl::pkey::{PKey, Private};
use openssl::ssl::SslRef;
use openssl::x509::X509;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Errors that can occur while loading or installing certificates
#[derive(Debug, Error)]
pub enum CertError {
    #[error("Failed to read {0}: {1}")]
    Read(String, std::io::Error),

    #[error("No certificate found in PEM data")]
    EmptyPem,

    #[error("OpenSSL error: {0}")]
    Openssl(#[from] openssl::error::ErrorStack),
}

/// A parsed certificate: leaf, private key, and chain. The chain carries
/// any intermediate certificates plus a CA bundle passthrough, split into
/// individual certificates.
pub struct CertBundle {
    cert: X509,
    key: PKey<Private>,
    chain: Vec<X509>,
}

impl CertBundle {
    /// Build from PEM data. `cert_pem` may contain the full chain; the
    /// first certificate is the leaf. An optional CA bundle is appended to
    /// the chain.
    pub fn from_pem(
        cert_pem: &[u8],
        key_pem: &[u8],
        ca_pem: Option<&[u8]>,
    ) -> Result<Self, CertError> {
        let mut certs = X509::stack_from_pem(cert_pem)?;
        if certs.is_empty() {
            return Err(CertError::EmptyPem);
        }
        let cert = certs.remove(0);
        let key = PKey::private_key_from_pem(key_pem)?;

        let mut chain = certs;
        if let Some(ca) = ca_pem {
            chain.extend(X509::stack_from_pem(ca)?);
        }

        Ok(Self { cert, key, chain })
    }

    pub fn from_files(
        cert_path: &Path,
        key_path: &Path,
        ca_path: Option<&Path>,
    ) -> Result<Self, CertError> {
        let read = |p: &Path| {
            std::fs::read(p).map_err(|e| CertError::Read(p.display().to_string(), e))
        };
        let cert_pem = read(cert_path)?;
        let key_pem = read(key_path)?;
        let ca_pem = ca_path.map(read).transpose()?;
        Self::from_pem(&cert_pem, &key_pem, ca_pem.as_deref())
    }

    /// Install leaf, key, and chain on a handshake in progress.
    pub fn apply(&self, ssl: &mut SslRef) -> Result<(), openssl::error::ErrorStack> {
        ssl.set_certificate(&self.cert)?;
        ssl.set_private_key(&self.key)?;
        for cert in &self.chain {
            ssl.add_chain_cert(cert.clone())?;
        }
        Ok(())
    }

    /// Leaf expiry, used to compute the renewal timer.
    pub fn expires_at(&self) -> Option<SystemTime> {
        use x509_parser::prelude::*;

        let der = self.cert.to_der().ok()?;
        let (_, parsed) = parse_x509_certificate(&der).ok()?;
        let timestamp = parsed.validity().not_after.timestamp();
        if timestamp < 0 {
            return None;
        }
        UNIX_EPOCH.checked_add(Duration::from_secs(timestamp as u64))
    }

    pub fn chain_len(&self) -> usize {
        self.chain.len()
    }
}

impl std::fmt::Debug for CertBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertBundle")
            .field("chain", &self.chain.len())
            .finish()
    }
}

struct CertEntry {
    /// `None` is the "use the listener default" sentinel.
    bundle: Option<Arc<CertBundle>>,
    renewal: Option<JoinHandle<()>>,
}

/// Hostname → certificate entries, consulted by the SNI callback. Renewal
/// timers ride along with their entry and are aborted when it goes away.
#[derive(Default)]
pub struct CertStore {
    entries: DashMap<String, CertEntry>,
}

impl CertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a bundle, replacing any previous one atomically. A pending
    /// renewal timer is kept.
    pub fn install(&self, hostname: &str, bundle: Arc<CertBundle>) {
        self.entries
            .entry(hostname.to_ascii_lowercase())
            .and_modify(|e| e.bundle = Some(bundle.clone()))
            .or_insert(CertEntry {
                bundle: Some(bundle),
                renewal: None,
            });
    }

    /// Record that this hostname terminates TLS on the listener default
    /// certificate.
    pub fn install_default(&self, hostname: &str) {
        self.entries
            .entry(hostname.to_ascii_lowercase())
            .or_insert(CertEntry {
                bundle: None,
                renewal: None,
            });
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.entries.contains_key(&hostname.to_ascii_lowercase())
    }

    /// The bundle for a hostname; `None` for unknown hosts and for hosts on
    /// the listener default.
    pub fn bundle_for(&self, hostname: &str) -> Option<Arc<CertBundle>> {
        self.entries
            .get(&hostname.to_ascii_lowercase())
            .and_then(|e| e.bundle.clone())
    }

    /// Attach a renewal timer to a hostname's entry, aborting any previous
    /// one. The entry is created when missing so a timer can never be
    /// orphaned.
    pub fn set_renewal(&self, hostname: &str, handle: JoinHandle<()>) {
        let mut entry = self
            .entries
            .entry(hostname.to_ascii_lowercase())
            .or_insert(CertEntry {
                bundle: None,
                renewal: None,
            });
        if let Some(old) = entry.renewal.replace(handle) {
            old.abort();
        }
    }

    /// Drop a hostname's entry and abort its renewal timer.
    pub fn remove(&self, hostname: &str) {
        if let Some((_, entry)) = self.entries.remove(&hostname.to_ascii_lowercase())
            && let Some(handle) = entry.renewal
        {
            handle.abort();
        }
    }

    /// Abort every renewal timer. Used on shutdown.
    pub fn abort_renewals(&self) {
        for mut entry in self.entries.iter_mut() {
            if let Some(handle) = entry.renewal.take() {
                handle.abort();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}

impl std::fmt::Debug for CertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertStore")
            .field("entries", &self.entries.len())
            .finish()
    }
}
