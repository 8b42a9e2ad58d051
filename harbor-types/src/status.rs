//! Status codes and the closed error-kind set.
//!
//! Every wire response carries a status code; every failure carries an
//! [`ErrorKind`]. The two map onto each other one-to-one so a client can
//! recover the kind from the status alone if the error payload is lost.

use serde::{Deserialize, Serialize};

/// HTTP-style status codes carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// Command succeeded.
    Ok,
    /// Malformed or invalid request.
    BadRequest,
    /// Authentication failed (certificate rejected).
    Unauthorized,
    /// Authenticated client is not permitted for the library.
    Forbidden,
    /// Target does not exist.
    NotFound,
    /// Target already exists.
    Conflict,
    /// Uploaded content did not match the advertised digest.
    ChecksumMismatch,
    /// Target is locked by another session.
    Locked,
    /// Rate limit exceeded.
    RateLimited,
    /// Unexpected server-side failure.
    Internal,
    /// Server disk is full.
    InsufficientStorage,
    /// Client and server protocol versions are incompatible.
    VersionMismatch,
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::ChecksumMismatch => 422,
            Self::Locked => 423,
            Self::RateLimited => 429,
            Self::Internal => 500,
            Self::InsufficientStorage => 507,
            Self::VersionMismatch => 505,
        }
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            200 => Some(Self::Ok),
            400 => Some(Self::BadRequest),
            401 => Some(Self::Unauthorized),
            403 => Some(Self::Forbidden),
            404 => Some(Self::NotFound),
            409 => Some(Self::Conflict),
            422 => Some(Self::ChecksumMismatch),
            423 => Some(Self::Locked),
            429 => Some(Self::RateLimited),
            500 => Some(Self::Internal),
            507 => Some(Self::InsufficientStorage),
            505 => Some(Self::VersionMismatch),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// The closed set of error kinds.
///
/// Kinds group into families: transport and protocol errors terminate the
/// connection; everything else is answered with a status code and the
/// session continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    // Transport
    ConnectionClosed,
    TlsFailure,
    Timeout,

    // Protocol
    MalformedFrame,
    FrameDigestMismatch,
    UnknownCommand,
    VersionMismatch,
    UnexpectedCommand,

    // Authentication
    BadCertificate,
    RevokedCertificate,
    UnknownClient,

    // Authorization
    Forbidden,

    // Resource
    NotFound,
    AlreadyExists,
    Locked,
    RateLimited,
    DiskFull,

    // Integrity
    ChecksumMismatch,

    // Input
    PathTraversal,
    InvalidArgument,
    SizeTooLarge,

    // Internal
    Internal,
}

impl ErrorKind {
    /// The wire status this kind is reported with.
    pub fn status(self) -> StatusCode {
        match self {
            Self::ConnectionClosed | Self::TlsFailure | Self::Timeout => StatusCode::Internal,
            Self::MalformedFrame
            | Self::FrameDigestMismatch
            | Self::UnknownCommand
            | Self::UnexpectedCommand => StatusCode::BadRequest,
            Self::VersionMismatch => StatusCode::VersionMismatch,
            Self::BadCertificate | Self::RevokedCertificate | Self::UnknownClient => {
                StatusCode::Unauthorized
            }
            Self::Forbidden => StatusCode::Forbidden,
            Self::NotFound => StatusCode::NotFound,
            Self::AlreadyExists => StatusCode::Conflict,
            Self::Locked => StatusCode::Locked,
            Self::RateLimited => StatusCode::RateLimited,
            Self::DiskFull => StatusCode::InsufficientStorage,
            Self::ChecksumMismatch => StatusCode::ChecksumMismatch,
            Self::PathTraversal | Self::InvalidArgument => StatusCode::BadRequest,
            Self::SizeTooLarge => StatusCode::BadRequest,
            Self::Internal => StatusCode::Internal,
        }
    }

    /// Whether a client should retry the whole operation after backoff.
    ///
    /// Transient kinds are network failures, idle kicks, lock contention,
    /// and rate limiting; everything else is permanent.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed | Self::TlsFailure | Self::Timeout | Self::Locked | Self::RateLimited
        )
    }

    /// Whether this kind terminates the connection rather than the command.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed
                | Self::TlsFailure
                | Self::Timeout
                | Self::MalformedFrame
                | Self::FrameDigestMismatch
                | Self::UnknownCommand
                | Self::VersionMismatch
                | Self::UnexpectedCommand
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // kebab-case, matching the serde representation on the wire
        let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        f.write_str(s.trim_matches('"'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_roundtrip() {
        for code in [
            StatusCode::Ok,
            StatusCode::BadRequest,
            StatusCode::Unauthorized,
            StatusCode::Forbidden,
            StatusCode::NotFound,
            StatusCode::Conflict,
            StatusCode::ChecksumMismatch,
            StatusCode::Locked,
            StatusCode::RateLimited,
            StatusCode::Internal,
            StatusCode::InsufficientStorage,
            StatusCode::VersionMismatch,
        ] {
            assert_eq!(StatusCode::from_u16(code.as_u16()), Some(code));
        }
        assert_eq!(StatusCode::from_u16(999), None);
    }

    #[test]
    fn locked_maps_to_423() {
        assert_eq!(ErrorKind::Locked.status().as_u16(), 423);
    }

    #[test]
    fn traversal_is_not_reported_as_not_found() {
        assert_ne!(ErrorKind::PathTraversal.status(), StatusCode::NotFound);
    }

    #[test]
    fn transient_classification() {
        assert!(ErrorKind::ConnectionClosed.is_transient());
        assert!(ErrorKind::Locked.is_transient());
        assert!(ErrorKind::RateLimited.is_transient());
        assert!(!ErrorKind::ChecksumMismatch.is_transient());
        assert!(!ErrorKind::NotFound.is_transient());
        assert!(!ErrorKind::Forbidden.is_transient());
        assert!(!ErrorKind::PathTraversal.is_transient());
    }

    #[test]
    fn protocol_errors_are_fatal() {
        assert!(ErrorKind::FrameDigestMismatch.is_fatal());
        assert!(ErrorKind::VersionMismatch.is_fatal());
        assert!(!ErrorKind::NotFound.is_fatal());
        assert!(!ErrorKind::Locked.is_fatal());
    }

    #[test]
    fn kind_serializes_kebab_case() {
        let json = serde_json::to_string(&ErrorKind::ChecksumMismatch).unwrap();
        assert_eq!(json, "\"checksum-mismatch\"");
        assert_eq!(ErrorKind::ChecksumMismatch.to_string(), "checksum-mismatch");
    }
}
