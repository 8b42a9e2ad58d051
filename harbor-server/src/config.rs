//! Server configuration.
//!
//! Loaded from a TOML file (default: `harbor.toml`). The core consumes
//! the validated structure; editing and encryption at rest belong to the
//! external configuration tooling.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Root server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub security: SecurityConfig,
    /// Libraries keyed by their id.
    pub libraries: HashMap<String, LibraryConfig>,
    /// Known client certificates.
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Bind host (default: 0.0.0.0).
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port (default: 8443).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum concurrent connections (default: 100).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Default session idle timeout in seconds (default: 300).
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Per-read socket timeout in seconds, to detect half-open peers
    /// (default: 60).
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Chunk size hint handed to clients at handshake (default: 8 MiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
}

/// Certificates and revocation.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// Path to the PEM CA certificate used to verify client certificates.
    pub ca_certificate: PathBuf,
    /// Path to the PEM server certificate presented to clients.
    pub server_certificate: PathBuf,
    /// Path to the PEM server private key.
    pub server_private_key: PathBuf,
    /// Revoked certificate fingerprints (SHA-256 of DER, lowercase hex).
    #[serde(default)]
    pub crl: Vec<String>,
}

/// One library: a named storage area rooted at an absolute directory.
#[derive(Debug, Clone, Deserialize)]
pub struct LibraryConfig {
    /// Human-readable name.
    pub name: String,
    /// Absolute root directory; must exist at startup.
    pub root: PathBuf,
    /// Certificate fingerprints of the clients permitted here.
    #[serde(default)]
    pub authorized_clients: Vec<String>,
    /// Bandwidth cap in bytes/second; 0 = unbounded (default).
    #[serde(default)]
    pub rate_cap: u64,
    /// Idle timeout override for sessions bound to this library.
    pub idle_timeout_secs: Option<u64>,
    /// Serialize write workloads: one session at a time may hold any
    /// exclusive-write lock in this library (default: on).
    #[serde(default = "default_exclusive_writer")]
    pub exclusive_writer: bool,
}

/// One known client certificate.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Display name, used in logs only.
    pub name: String,
    /// PEM-encoded certificate.
    pub certificate: String,
    /// Revoked clients are rejected at handshake.
    #[serde(default)]
    pub revoked: bool,
}

/// Flood-control limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Handshake attempts allowed per client per minute (default: 60).
    #[serde(default = "default_handshakes_per_minute")]
    pub handshakes_per_minute: u32,
    /// Reaper scan interval in seconds (default: 30).
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8443
}

fn default_max_connections() -> usize {
    100
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_read_timeout() -> u64 {
    60
}

fn default_chunk_size() -> u32 {
    8 * 1024 * 1024
}

fn default_exclusive_writer() -> bool {
    true
}

fn default_handshakes_per_minute() -> u32 {
    60
}

fn default_reaper_interval() -> u64 {
    30
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            handshakes_per_minute: default_handshakes_per_minute(),
            reaper_interval_secs: default_reaper_interval(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// structure fails validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation that needs no filesystem access.
    ///
    /// Library roots are checked for existence separately at startup by
    /// the library manager.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.port == 0 {
            return Err(ConfigError::Invalid("network.port must be non-zero".into()));
        }
        if self.network.chunk_size < 1024 {
            return Err(ConfigError::Invalid(format!(
                "network.chunk_size must be at least 1024 bytes, got {}",
                self.network.chunk_size
            )));
        }
        if self.libraries.is_empty() {
            return Err(ConfigError::Invalid("at least one library is required".into()));
        }
        for (id, lib) in &self.libraries {
            if lib.name.is_empty() {
                return Err(ConfigError::Invalid(format!("library {id} is missing a name")));
            }
            if !lib.root.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "library {id} root must be absolute: {}",
                    lib.root.display()
                )));
            }
            for fp in &lib.authorized_clients {
                if !is_fingerprint(fp) {
                    return Err(ConfigError::Invalid(format!(
                        "library {id} authorized client is not a sha256 fingerprint: {fp}"
                    )));
                }
            }
        }
        for fp in &self.security.crl {
            if !is_fingerprint(fp) {
                return Err(ConfigError::Invalid(format!(
                    "crl entry is not a sha256 fingerprint: {fp}"
                )));
            }
        }
        for client in &self.clients {
            if client.certificate.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "client {} is missing a certificate",
                    client.name
                )));
            }
        }
        Ok(())
    }
}

fn is_fingerprint(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()) && !s.bytes().any(|b| b.is_ascii_uppercase())
}
