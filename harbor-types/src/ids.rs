//! Identity types for libraries, clients, and sessions.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identifier of a library (a named, path-rooted storage area).
///
/// Opaque string chosen by the server operator; unique across the
/// configuration.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LibraryId(String);

impl LibraryId {
    /// Create a library id from a configuration key.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LibraryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for LibraryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LibraryId({})", self.0)
    }
}

impl From<&str> for LibraryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of a client, derived deterministically from its certificate.
///
/// The id is the SHA-256 fingerprint of the DER-encoded certificate,
/// rendered as lowercase hex. The same derivation is used for
/// configuration lookup, CRL membership, and rate-limiter keying.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Derive a client id from a DER-encoded certificate.
    pub fn from_der(cert_der: &[u8]) -> Self {
        let digest = Sha256::digest(cert_der);
        Self(hex::encode(digest))
    }

    /// Construct from an already-computed fingerprint string.
    ///
    /// Accepts any lowercase-hexable string; configuration validation
    /// enforces the 64-character form.
    pub fn from_fingerprint(fp: impl Into<String>) -> Self {
        Self(fp.into().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Fingerprints are long; show a prefix like we would a git sha.
        let short = if self.0.len() > 12 { &self.0[..12] } else { &self.0 };
        write!(f, "ClientId({short})")
    }
}

/// Identifier of a live session, unique per server lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    /// Generate a fresh session id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", &self.0.to_string()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_is_deterministic() {
        let a = ClientId::from_der(b"certificate bytes");
        let b = ClientId::from_der(b"certificate bytes");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn client_id_differs_per_certificate() {
        let a = ClientId::from_der(b"cert one");
        let b = ClientId::from_der(b"cert two");
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_is_lowercased() {
        let id = ClientId::from_fingerprint("ABCDEF0123");
        assert_eq!(id.as_str(), "abcdef0123");
    }

    #[test]
    fn session_ids_are_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn library_id_roundtrips_serde() {
        let id = LibraryId::new("photos");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"photos\"");
        let back: LibraryId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
