//! TLS configuration for the server.
//!
//! The server demands a client certificate on every connection and
//! verifies it against the configured CA; authentication beyond chain
//! validation (fingerprint lookup, CRL) happens in [`crate::auth`].

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::config::SecurityConfig;
use crate::error::ConfigError;

/// Build the rustls server configuration with mandatory client
/// certificate verification rooted at the configured CA.
pub fn server_tls_config(security: &SecurityConfig) -> Result<Arc<rustls::ServerConfig>, ConfigError> {
    let ca_certs = load_certs(&security.ca_certificate)?;
    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots
            .add(cert)
            .map_err(|e| ConfigError::Certificate(format!("bad CA certificate: {e}")))?;
    }

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| ConfigError::Certificate(format!("client verifier: {e}")))?;

    let certs = load_certs(&security.server_certificate)?;
    let key = load_private_key(&security.server_private_key)?;

    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| ConfigError::Certificate(format!("server certificate: {e}")))?;

    info!(
        ca = %security.ca_certificate.display(),
        "TLS configured with mandatory client certificates"
    );

    Ok(Arc::new(config))
}

/// Load all certificates from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let file = std::fs::File::open(path).map_err(|e| {
        ConfigError::Certificate(format!("cannot open {}: {e}", path.display()))
    })?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Certificate(format!("cannot parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(ConfigError::Certificate(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load a private key from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let file = std::fs::File::open(path).map_err(|e| {
        ConfigError::Certificate(format!("cannot open {}: {e}", path.display()))
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ConfigError::Certificate(format!("cannot parse {}: {e}", path.display())))?
        .ok_or_else(|| {
            ConfigError::Certificate(format!("no private key found in {}", path.display()))
        })
}

/// Parse the first certificate out of an inline PEM string.
///
/// Used for the client records in the configuration, whose certificates
/// are stored inline rather than as file paths.
pub fn first_cert_from_pem(pem: &str) -> Result<CertificateDer<'static>, ConfigError> {
    let mut reader = BufReader::new(pem.as_bytes());
    let cert = rustls_pemfile::certs(&mut reader)
        .next()
        .transpose()
        .map_err(|e| ConfigError::Certificate(format!("cannot parse inline certificate: {e}")))?
        .ok_or_else(|| ConfigError::Certificate("no certificate in inline PEM".into()));
    cert
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_pem_parses() {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["test.local".into()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        let der = first_cert_from_pem(&cert.pem()).unwrap();
        assert!(!der.as_ref().is_empty());
    }

    #[test]
    fn empty_pem_is_an_error() {
        assert!(first_cert_from_pem("not a certificate").is_err());
    }
}
