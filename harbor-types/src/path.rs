//! Relative-path validation.
//!
//! Pure screening of client-supplied paths, shared by the server's
//! resolver and the client's argument checks. The filesystem-aware half of
//! resolution (symlink-resolved descendant check) lives in the server.

use std::path::PathBuf;
use thiserror::Error;

use crate::status::ErrorKind;

/// Maximum number of path components.
pub const MAX_PATH_DEPTH: usize = 100;

/// Maximum encoded path length in bytes.
pub const MAX_PATH_LEN: usize = 4096;

/// Windows-reserved device names, rejected on every platform so a library
/// written on Linux stays readable everywhere.
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Why a path was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path traversal attempt: {0}")]
    Traversal(String),

    #[error("path contains a NUL byte")]
    NulByte,

    #[error("path component is a reserved name: {0}")]
    ReservedName(String),

    #[error("path length {0} exceeds maximum {MAX_PATH_LEN}")]
    TooLong(usize),

    #[error("path depth {0} exceeds maximum {MAX_PATH_DEPTH}")]
    TooDeep(usize),

    #[error("empty path component")]
    EmptyComponent,
}

impl PathError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Traversal(_) | Self::NulByte => ErrorKind::PathTraversal,
            Self::ReservedName(_) | Self::TooLong(_) | Self::TooDeep(_) | Self::EmptyComponent => {
                ErrorKind::InvalidArgument
            }
        }
    }
}

/// Validate a client-supplied relative path.
///
/// Accepts `/`-separated relative paths; `\`-separators are normalized
/// to `/`. Rejects absolute paths in any form (leading `/` or `\`,
/// drive letters), `.` and `..` components, NUL bytes, reserved names,
/// and paths beyond the depth and length limits. Returns the normalized
/// relative path; an empty result means the library root.
pub fn validate_relative(path: &str) -> Result<PathBuf, PathError> {
    if path.len() > MAX_PATH_LEN {
        return Err(PathError::TooLong(path.len()));
    }
    if path.contains('\0') {
        return Err(PathError::NulByte);
    }

    // Absolute forms are traversal attempts, not "not found".
    if path.starts_with('/') || path.starts_with('\\') || path.chars().nth(1) == Some(':') {
        return Err(PathError::Traversal(path.to_string()));
    }

    let normalized = path.replace('\\', "/");
    let mut out = PathBuf::new();
    let mut depth = 0usize;

    for component in normalized.split('/') {
        if component.is_empty() {
            // Collapse duplicate separators; a trailing slash is harmless.
            continue;
        }
        if component == "." || component == ".." {
            return Err(PathError::Traversal(path.to_string()));
        }
        let stem = component.split('.').next().unwrap_or(component);
        if RESERVED_NAMES.contains(&stem.to_ascii_uppercase().as_str()) {
            return Err(PathError::ReservedName(component.to_string()));
        }
        depth += 1;
        if depth > MAX_PATH_DEPTH {
            return Err(PathError::TooDeep(depth));
        }
        out.push(component);
    }

    Ok(out)
}
