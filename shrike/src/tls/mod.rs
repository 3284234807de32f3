//! TLS termination: the certificate store, SNI selection, and the ACME
//! service.

pub mod acme;
pub mod sni;
pub mod store;

pub use acme::{AcmeError, AcmeOptions, AcmeService, CHALLENGE_PREFIX};
pub use sni::SniCertSelector;
pub use store::{CertBundle, CertError, CertStore};
