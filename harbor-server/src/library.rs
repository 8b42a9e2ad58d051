//! The library set.
//!
//! Libraries are read-only for the server's lifetime: the manager
//! validates every root at startup and afterwards serves lock-free
//! lookups for resolution, authorization, and rate policy.

use harbor_types::{ClientId, ErrorKind, LibraryId};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::{ConfigError, ServerError, ServerResult};
use crate::resolver;

/// A validated library.
#[derive(Debug, Clone)]
pub struct Library {
    pub id: LibraryId,
    pub name: String,
    pub root: PathBuf,
    pub authorized: HashSet<ClientId>,
    /// Bytes/second; 0 = unbounded.
    pub rate_cap: u64,
    pub idle_timeout: Duration,
    pub exclusive_writer: bool,
}

/// Owns the library set.
pub struct LibraryManager {
    libraries: HashMap<LibraryId, Library>,
}

impl LibraryManager {
    /// Build the manager, verifying every root exists and is a directory.
    pub fn from_config(config: &ServerConfig) -> Result<Self, ConfigError> {
        let default_idle = Duration::from_secs(config.network.idle_timeout_secs);
        let mut libraries = HashMap::new();

        for (id, lib) in &config.libraries {
            let meta = std::fs::metadata(&lib.root).map_err(|e| {
                ConfigError::Invalid(format!(
                    "library {id} root {}: {e}",
                    lib.root.display()
                ))
            })?;
            if !meta.is_dir() {
                return Err(ConfigError::Invalid(format!(
                    "library {id} root is not a directory: {}",
                    lib.root.display()
                )));
            }

            let library = Library {
                id: LibraryId::new(id.clone()),
                name: lib.name.clone(),
                root: lib.root.clone(),
                authorized: lib
                    .authorized_clients
                    .iter()
                    .map(|fp| ClientId::from_fingerprint(fp.clone()))
                    .collect(),
                rate_cap: lib.rate_cap,
                idle_timeout: lib
                    .idle_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(default_idle),
                exclusive_writer: lib.exclusive_writer,
            };
            info!(
                library = %library.id,
                name = %library.name,
                root = %library.root.display(),
                clients = library.authorized.len(),
                "library registered"
            );
            libraries.insert(library.id.clone(), library);
        }

        Ok(Self { libraries })
    }

    /// Look up a library by id.
    pub fn lookup(&self, id: &LibraryId) -> ServerResult<&Library> {
        self.libraries.get(id).ok_or_else(|| {
            ServerError::op(ErrorKind::Forbidden, format!("library not found: {id}"))
        })
    }

    /// Whether the client is permitted for the library.
    pub fn is_authorized(&self, id: &LibraryId, client: &ClientId) -> bool {
        self.libraries
            .get(id)
            .map(|lib| lib.authorized.contains(client))
            .unwrap_or(false)
    }

    /// Resolve a client-supplied relative path inside the library root.
    pub fn resolve(&self, id: &LibraryId, rel_path: &str) -> ServerResult<PathBuf> {
        let library = self.lookup(id)?;
        resolver::resolve(&library.root, rel_path)
    }

    /// The library's rate cap in bytes/second (0 = unbounded).
    pub fn rate_cap(&self, id: &LibraryId) -> u64 {
        self.libraries.get(id).map(|lib| lib.rate_cap).unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Library> {
        self.libraries.values()
    }

    pub fn len(&self) -> usize {
        self.libraries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.libraries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LibraryConfig, NetworkConfig, SecurityConfig};

    fn config_with_root(root: PathBuf) -> ServerConfig {
        ServerConfig {
            network: NetworkConfig {
                host: "127.0.0.1".into(),
                port: 8443,
                max_connections: 10,
                idle_timeout_secs: 120,
                read_timeout_secs: 60,
                chunk_size: 65536,
            },
            security: SecurityConfig {
                ca_certificate: "/ca.pem".into(),
                server_certificate: "/s.pem".into(),
                server_private_key: "/s.key".into(),
                crl: vec![],
            },
            libraries: HashMap::from([(
                "docs".to_string(),
                LibraryConfig {
                    name: "Documents".into(),
                    root,
                    authorized_clients: vec!["a".repeat(64)],
                    rate_cap: 2048,
                    idle_timeout_secs: Some(45),
                    exclusive_writer: true,
                },
            )]),
            clients: vec![],
            limits: Default::default(),
        }
    }

    #[test]
    fn valid_root_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LibraryManager::from_config(&config_with_root(dir.path().into())).unwrap();

        let id = LibraryId::new("docs");
        let lib = manager.lookup(&id).unwrap();
        assert_eq!(lib.name, "Documents");
        assert_eq!(lib.rate_cap, 2048);
        assert_eq!(lib.idle_timeout, Duration::from_secs(45));
        assert_eq!(manager.rate_cap(&id), 2048);
    }

    #[test]
    fn missing_root_fails_startup() {
        let result = LibraryManager::from_config(&config_with_root("/does/not/exist".into()));
        assert!(result.is_err());
    }

    #[test]
    fn file_root_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        let result = LibraryManager::from_config(&config_with_root(file));
        assert!(result.is_err());
    }

    #[test]
    fn authorization_checks_membership() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LibraryManager::from_config(&config_with_root(dir.path().into())).unwrap();

        let id = LibraryId::new("docs");
        let permitted = ClientId::from_fingerprint("a".repeat(64));
        let stranger = ClientId::from_fingerprint("b".repeat(64));
        assert!(manager.is_authorized(&id, &permitted));
        assert!(!manager.is_authorized(&id, &stranger));
        assert!(!manager.is_authorized(&LibraryId::new("nope"), &permitted));
    }

    #[test]
    fn unknown_library_lookup_is_forbidden_kind() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LibraryManager::from_config(&config_with_root(dir.path().into())).unwrap();
        let err = manager.lookup(&LibraryId::new("ghost")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }
}
