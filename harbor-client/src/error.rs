//! Client error types.

use harbor_types::{ErrorKind, FrameError};
use std::io;
use std::path::PathBuf;

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// I/O failure on the transport or local disk.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Framing error on the wire.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The server answered with an error response.
    #[error("server error ({kind}): {message}")]
    Server { kind: ErrorKind, message: String },

    /// The server answered with something the protocol does not allow
    /// at this point.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An operation was attempted before the handshake.
    #[error("not connected")]
    NotConnected,

    /// A downloaded file failed local digest verification. The partial
    /// file has been deleted.
    #[error("checksum mismatch for {path}: expected {expected}, computed {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Connect attempt timed out.
    #[error("connection timed out")]
    ConnectTimeout,
}

impl ClientError {
    /// The error kind, for retry classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(e) => match e.kind() {
                io::ErrorKind::NotFound => ErrorKind::NotFound,
                io::ErrorKind::TimedOut => ErrorKind::Timeout,
                _ => ErrorKind::ConnectionClosed,
            },
            Self::Frame(FrameError::Io(_)) => ErrorKind::ConnectionClosed,
            Self::Frame(FrameError::DigestMismatch) => ErrorKind::FrameDigestMismatch,
            Self::Frame(_) => ErrorKind::MalformedFrame,
            Self::Server { kind, .. } => *kind,
            Self::Protocol(_) => ErrorKind::MalformedFrame,
            Self::NotConnected => ErrorKind::ConnectionClosed,
            Self::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Self::Config(_) => ErrorKind::InvalidArgument,
            Self::ConnectTimeout => ErrorKind::Timeout,
        }
    }

    /// Whether the whole operation should be retried with backoff.
    ///
    /// Local I/O failures are not retried; a vanished local file will
    /// not reappear. Transport drops and retryable server kinds are.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::TimedOut
            ),
            Self::Frame(FrameError::Io(_)) => true,
            Self::Server { kind, .. } => kind.is_transient(),
            Self::ConnectTimeout => true,
            _ => false,
        }
    }
}

/// Result alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_locked_is_transient() {
        let err = ClientError::Server {
            kind: ErrorKind::Locked,
            message: "busy".into(),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn permanent_server_kinds_are_not_retried() {
        for kind in [
            ErrorKind::Forbidden,
            ErrorKind::NotFound,
            ErrorKind::ChecksumMismatch,
            ErrorKind::PathTraversal,
        ] {
            let err = ClientError::Server {
                kind,
                message: String::new(),
            };
            assert!(!err.is_transient(), "{kind} must be permanent");
        }
    }

    #[test]
    fn dropped_connection_is_transient() {
        let err = ClientError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(err.is_transient());
    }

    #[test]
    fn local_checksum_mismatch_is_permanent() {
        let err = ClientError::ChecksumMismatch {
            path: "/tmp/x".into(),
            expected: "a".into(),
            actual: "b".into(),
        };
        assert!(!err.is_transient());
        assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);
    }
}
