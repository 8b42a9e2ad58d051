//! Protocol commands and responses.
//!
//! Requests and responses are tagged serde enums carried as the JSON
//! payload of a frame. Chunk bytes never travel inside the JSON; they ride
//! in the frame's binary body (`PUT_CHUNK` requests, `GET_CHUNK`
//! responses).

use serde::{Deserialize, Serialize};

use crate::ids::{LibraryId, SessionId};
use crate::status::ErrorKind;

/// Client-to-server commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Request {
    /// First frame on every connection: bind to a library.
    Handshake {
        library_id: LibraryId,
        protocol_version: u16,
    },
    /// Keep-alive; also refreshes the idle timer.
    Ping,
    /// Graceful disconnect.
    Disconnect,
    /// Begin (or resume) an upload.
    PutStart {
        path: String,
        size: u64,
        digest: String,
    },
    /// One upload chunk; the frame body carries the bytes.
    PutChunk { path: String, offset: u64 },
    /// Finalize an upload: verify digest, promote staging to final.
    PutCommit {
        path: String,
        /// Source mtime (seconds since epoch) to restore on the final file.
        mtime: Option<u64>,
    },
    /// Begin (or resume) a download.
    GetStart { path: String, offset: u64 },
    /// Request up to `max_len` bytes starting at `offset`.
    GetChunk {
        path: String,
        offset: u64,
        max_len: u32,
    },
    Delete { path: String },
    Rename { from: String, to: String },
    List { path: String, recursive: bool },
    Mkdir { path: String },
    Rmdir { path: String, recursive: bool },
    /// Recursive listing with per-file digests.
    Manifest { path: String },
    Checksum { path: String },
    Stat { path: String },
    Exists { path: String },
}

impl Request {
    /// Wire command name, mirrored into the frame header.
    pub fn command_name(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "HANDSHAKE",
            Self::Ping => "PING",
            Self::Disconnect => "DISCONNECT",
            Self::PutStart { .. } => "PUT_START",
            Self::PutChunk { .. } => "PUT_CHUNK",
            Self::PutCommit { .. } => "PUT_COMMIT",
            Self::GetStart { .. } => "GET_START",
            Self::GetChunk { .. } => "GET_CHUNK",
            Self::Delete { .. } => "DELETE",
            Self::Rename { .. } => "RENAME",
            Self::List { .. } => "LIST",
            Self::Mkdir { .. } => "MKDIR",
            Self::Rmdir { .. } => "RMDIR",
            Self::Manifest { .. } => "MANIFEST",
            Self::Checksum { .. } => "CHECKSUM",
            Self::Stat { .. } => "STAT",
            Self::Exists { .. } => "EXISTS",
        }
    }
}

/// Server-to-client responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply")]
pub enum Response {
    /// Generic success with no data (DELETE, RENAME, MKDIR, ...).
    Ok,
    Handshake {
        session_id: SessionId,
        protocol_version: u16,
        chunk_size: u32,
        resumable: bool,
    },
    Pong,
    PutStart {
        /// Bytes already committed to staging; the client resumes here.
        resume_offset: u64,
    },
    PutChunk {
        /// Total bytes committed to staging after this chunk.
        committed: u64,
    },
    PutCommit {
        /// Digest of the finalized file.
        digest: String,
    },
    GetStart {
        size: u64,
        digest: String,
        /// Offset at which streaming will begin (== the requested offset).
        offset: u64,
    },
    /// One download chunk; the frame body carries the bytes.
    GetChunk { len: u32, eof: bool },
    List { entries: Vec<EntryInfo> },
    Manifest { entries: Vec<EntryInfo> },
    Checksum { digest: String },
    Stat { entry: EntryInfo },
    Exists { exists: bool },
    Error { kind: ErrorKind, message: String },
}

/// One entry in a listing, manifest, or stat response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryInfo {
    /// Path relative to the library root, `/`-separated.
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    /// Modification time, seconds since the Unix epoch.
    pub mtime: u64,
    /// Full-file digest; present in manifest and stat responses only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}
