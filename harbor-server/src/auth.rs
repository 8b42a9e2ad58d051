//! Client authentication.
//!
//! The TLS layer has already verified the peer's certificate chain
//! against the CA by the time a connection reaches the handler. This
//! module maps the presented certificate to a client identity: the
//! SHA-256 fingerprint of the DER certificate, checked against the
//! configured client set and the revocation list.

use harbor_types::{ClientId, ErrorKind};
use rustls::pki_types::CertificateDer;
use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::config::ServerConfig;
use crate::error::{ConfigError, ServerError, ServerResult};
use crate::tls::first_cert_from_pem;

/// A resolved client record.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub id: ClientId,
    pub name: String,
    pub revoked: bool,
}

/// Validates peer certificates and resolves client identities.
///
/// Immutable after startup; lock-free reads.
pub struct Authenticator {
    clients: HashMap<ClientId, ClientRecord>,
    crl: HashSet<ClientId>,
}

impl Authenticator {
    /// Build the authenticator from the configuration, fingerprinting
    /// every configured client certificate.
    pub fn from_config(config: &ServerConfig) -> Result<Self, ConfigError> {
        let mut clients = HashMap::new();
        for entry in &config.clients {
            let der = first_cert_from_pem(&entry.certificate).map_err(|e| {
                ConfigError::Certificate(format!("client {}: {e}", entry.name))
            })?;
            let id = ClientId::from_der(der.as_ref());
            let record = ClientRecord {
                id: id.clone(),
                name: entry.name.clone(),
                revoked: entry.revoked,
            };
            if clients.insert(id, record).is_some() {
                return Err(ConfigError::Invalid(format!(
                    "duplicate client certificate for {}",
                    entry.name
                )));
            }
        }

        let crl = config
            .security
            .crl
            .iter()
            .map(|fp| ClientId::from_fingerprint(fp.clone()))
            .collect();

        Ok(Self { clients, crl })
    }

    /// Authenticate a peer certificate, returning the resolved record.
    ///
    /// Rejection order mirrors the handshake contract: CRL first, then
    /// the configured client set, then the per-record revocation flag.
    pub fn authenticate(&self, peer_cert: &CertificateDer<'_>) -> ServerResult<&ClientRecord> {
        let id = ClientId::from_der(peer_cert.as_ref());

        if self.crl.contains(&id) {
            warn!(client = %id, "rejected: certificate is in the CRL");
            return Err(ServerError::op(
                ErrorKind::RevokedCertificate,
                "certificate has been revoked",
            ));
        }

        let record = self.clients.get(&id).ok_or_else(|| {
            warn!(client = %id, "rejected: unknown certificate");
            ServerError::op(ErrorKind::UnknownClient, "unknown client certificate")
        })?;

        if record.revoked {
            warn!(client = %id, name = %record.name, "rejected: client is revoked");
            return Err(ServerError::op(
                ErrorKind::RevokedCertificate,
                "certificate has been revoked",
            ));
        }

        Ok(record)
    }

    /// Display name for a known client, for logging.
    pub fn client_name(&self, id: &ClientId) -> &str {
        self.clients.get(id).map(|r| r.name.as_str()).unwrap_or("unknown")
    }

    /// Number of configured clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, LibraryConfig, NetworkConfig, SecurityConfig};
    use std::collections::HashMap;

    fn make_cert() -> (String, CertificateDer<'static>) {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["client.test".into()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        (cert.pem(), cert.der().clone())
    }

    fn config_with(clients: Vec<ClientConfig>, crl: Vec<String>) -> ServerConfig {
        ServerConfig {
            network: NetworkConfig {
                host: "127.0.0.1".into(),
                port: 8443,
                max_connections: 10,
                idle_timeout_secs: 300,
                read_timeout_secs: 60,
                chunk_size: 65536,
            },
            security: SecurityConfig {
                ca_certificate: "/ca.pem".into(),
                server_certificate: "/s.pem".into(),
                server_private_key: "/s.key".into(),
                crl,
            },
            libraries: HashMap::from([(
                "lib".to_string(),
                LibraryConfig {
                    name: "Lib".into(),
                    root: "/tmp".into(),
                    authorized_clients: vec![],
                    rate_cap: 0,
                    idle_timeout_secs: None,
                    exclusive_writer: true,
                },
            )]),
            clients,
            limits: Default::default(),
        }
    }

    #[test]
    fn known_certificate_authenticates() {
        let (pem, der) = make_cert();
        let auth = Authenticator::from_config(&config_with(
            vec![ClientConfig {
                name: "laptop".into(),
                certificate: pem,
                revoked: false,
            }],
            vec![],
        ))
        .unwrap();

        let record = auth.authenticate(&der).unwrap();
        assert_eq!(record.name, "laptop");
        assert_eq!(record.id, ClientId::from_der(der.as_ref()));
    }

    #[test]
    fn unknown_certificate_is_rejected() {
        let (pem, _) = make_cert();
        let (_, stranger) = make_cert();
        let auth = Authenticator::from_config(&config_with(
            vec![ClientConfig {
                name: "laptop".into(),
                certificate: pem,
                revoked: false,
            }],
            vec![],
        ))
        .unwrap();

        let err = auth.authenticate(&stranger).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownClient);
    }

    #[test]
    fn revoked_flag_rejects() {
        let (pem, der) = make_cert();
        let auth = Authenticator::from_config(&config_with(
            vec![ClientConfig {
                name: "laptop".into(),
                certificate: pem,
                revoked: true,
            }],
            vec![],
        ))
        .unwrap();

        let err = auth.authenticate(&der).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RevokedCertificate);
    }

    #[test]
    fn crl_membership_rejects_even_known_clients() {
        let (pem, der) = make_cert();
        let fp = ClientId::from_der(der.as_ref()).as_str().to_string();
        let auth = Authenticator::from_config(&config_with(
            vec![ClientConfig {
                name: "laptop".into(),
                certificate: pem,
                revoked: false,
            }],
            vec![fp],
        ))
        .unwrap();

        let err = auth.authenticate(&der).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RevokedCertificate);
    }

    #[test]
    fn duplicate_certificates_fail_startup() {
        let (pem, _) = make_cert();
        let result = Authenticator::from_config(&config_with(
            vec![
                ClientConfig {
                    name: "one".into(),
                    certificate: pem.clone(),
                    revoked: false,
                },
                ClientConfig {
                    name: "two".into(),
                    certificate: pem,
                    revoked: false,
                },
            ],
            vec![],
        ));
        assert!(result.is_err());
    }
}
