//! Server error types.
//!
//! Every failure carries an [`ErrorKind`] from the closed set; the
//! connection handler is the single place where errors become wire status
//! codes.

use harbor_types::{ErrorKind, FrameError};
use std::io;
use std::path::PathBuf;

/// Main error type for server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// A failure with a kind from the closed set and a peer-safe message.
    #[error("{kind}: {message}")]
    Op {
        kind: ErrorKind,
        message: String,
    },

    /// Configuration error (startup only).
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Framing error on the connection.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// I/O failure outside a classified operation.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ServerError {
    /// Build an operation error.
    pub fn op(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Op {
            kind,
            message: message.into(),
        }
    }

    /// The error kind used for status mapping and client retry policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Op { kind, .. } => *kind,
            Self::Config(_) => ErrorKind::Internal,
            Self::Frame(e) => frame_error_kind(e),
            Self::Io(e) => io_error_kind(e),
        }
    }

    /// Message safe to echo to the peer. Internal errors are masked; the
    /// full detail goes to the log instead.
    pub fn peer_message(&self) -> String {
        match self.kind() {
            ErrorKind::Internal => "internal error".to_string(),
            _ => self.to_string(),
        }
    }
}

fn frame_error_kind(err: &FrameError) -> ErrorKind {
    match err {
        FrameError::Io(e) => io_error_kind(e),
        FrameError::DigestMismatch => ErrorKind::FrameDigestMismatch,
        FrameError::BadMagic
        | FrameError::UnknownKind(_)
        | FrameError::BadCommand
        | FrameError::Json(_) => ErrorKind::MalformedFrame,
        FrameError::PayloadTooLarge { .. } | FrameError::BodyTooLarge { .. } => {
            ErrorKind::SizeTooLarge
        }
    }
}

fn io_error_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
            ErrorKind::ConnectionClosed
        }
        io::ErrorKind::TimedOut => ErrorKind::Timeout,
        _ if err.raw_os_error() == Some(28) => ErrorKind::DiskFull, // ENOSPC
        _ => ErrorKind::Internal,
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: io::Error,
    },

    /// Failed to parse the configuration file.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// The configuration is structurally valid but semantically wrong.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// A referenced certificate or key could not be loaded.
    #[error("certificate error: {0}")]
    Certificate(String),
}

/// Result alias for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enospc_maps_to_disk_full() {
        let err = ServerError::Io(io::Error::from_raw_os_error(28));
        assert_eq!(err.kind(), ErrorKind::DiskFull);
    }

    #[test]
    fn not_found_io_maps_through() {
        let err = ServerError::Io(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn internal_detail_is_masked_for_peer() {
        let err = ServerError::op(ErrorKind::Internal, "db table corrupted at offset 12");
        assert_eq!(err.peer_message(), "internal error");

        let err = ServerError::op(ErrorKind::NotFound, "not-found: no such file");
        assert!(err.peer_message().contains("no such file"));
    }

    #[test]
    fn frame_digest_mismatch_is_fatal_kind() {
        let err = ServerError::Frame(FrameError::DigestMismatch);
        assert!(err.kind().is_fatal());
    }
}
