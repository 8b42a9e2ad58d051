//! Client configuration.
//!
//! Loaded from a TOML file produced by the server-side configuration
//! tooling. Certificates are referenced by path.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{ClientError, ClientResult};

/// Root client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub server: ServerEndpoint,
    pub identity: Identity,
    #[serde(default)]
    pub transfer: TransferConfig,
}

/// Where the server lives and how to trust it.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEndpoint {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to the CA certificate the server certificate chains to.
    pub ca_certificate: PathBuf,
    /// Name to verify on the server certificate; defaults to `host`.
    pub server_name: Option<String>,
}

/// This client's certificate, key, and target library.
#[derive(Debug, Clone, Deserialize)]
pub struct Identity {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
    pub library_id: String,
}

/// Transfer tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    /// Chunk size in bytes (default: 8 MiB). The server's handshake hint
    /// wins when smaller.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    /// Attempts per operation, including the first (default: 3).
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// TCP connect timeout in seconds (default: 30).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_port() -> u16 {
    8443
}

fn default_chunk_size() -> u32 {
    8 * 1024 * 1024
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_connect_timeout() -> u64 {
    30
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            retry_attempts: default_retry_attempts(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl ClientConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: &Path) -> ClientResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ClientError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ClientResult<()> {
        if self.server.host.is_empty() {
            return Err(ClientError::Config("server.host is required".into()));
        }
        if self.identity.library_id.is_empty() {
            return Err(ClientError::Config("identity.library_id is required".into()));
        }
        if self.transfer.chunk_size < 1024 {
            return Err(ClientError::Config(format!(
                "transfer.chunk_size must be at least 1024 bytes, got {}",
                self.transfer.chunk_size
            )));
        }
        if self.transfer.retry_attempts == 0 {
            return Err(ClientError::Config("transfer.retry_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// The name used for server certificate verification.
    pub fn server_name(&self) -> &str {
        self.server.server_name.as_deref().unwrap_or(&self.server.host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> &'static str {
        r#"
[server]
host = "harbor.example.net"
ca_certificate = "/etc/harbor/ca.pem"

[identity]
certificate = "/etc/harbor/client.pem"
private_key = "/etc/harbor/client.key"
library_id = "photos"
"#
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: ClientConfig = toml::from_str(minimal()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 8443);
        assert_eq!(config.transfer.chunk_size, 8 * 1024 * 1024);
        assert_eq!(config.transfer.retry_attempts, 3);
        assert_eq!(config.server_name(), "harbor.example.net");
    }

    #[test]
    fn server_name_override_wins() {
        let toml = minimal().replace(
            "ca_certificate",
            "server_name = \"alias.example.net\"\nca_certificate",
        );
        let config: ClientConfig = toml::from_str(&toml).unwrap();
        assert_eq!(config.server_name(), "alias.example.net");
    }

    #[test]
    fn zero_retries_is_invalid() {
        let toml = format!("{}\n[transfer]\nretry_attempts = 0\n", minimal());
        let config: ClientConfig = toml::from_str(&toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn tiny_chunk_size_is_invalid() {
        let toml = format!("{}\n[transfer]\nchunk_size = 16\n", minimal());
        let config: ClientConfig = toml::from_str(&toml).unwrap();
        assert!(config.validate().is_err());
    }
}
