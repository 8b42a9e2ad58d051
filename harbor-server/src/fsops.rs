//! Primitive file operations.
//!
//! Every function receives a pre-resolved absolute path; resolution and
//! authorization have already happened in the connection handler. Uploads
//! write only to a staging file beside the final target and are promoted
//! by an atomic rename at commit, which is the sole finalization point.

use harbor_types::message::{EntryInfo, EntryKind};
use harbor_types::ErrorKind;
use sha2::{Digest, Sha256};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::error::{ServerError, ServerResult};

/// Suffix appended to the final name while an upload is in flight.
pub const STAGING_SUFFIX: &str = ".partial";

/// Buffer size for streamed checksums and chunk reads.
const IO_BUFFER: usize = 64 * 1024;

/// The staging path for an upload target.
pub fn staging_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(STAGING_SUFFIX);
    target.with_file_name(name)
}

/// Begin (or resume) an upload.
///
/// Returns the staging path and the number of bytes already committed to
/// it; the client resumes from that offset. A staging file longer than
/// the advertised size is stale and restarts from zero.
pub async fn start_upload(target: &Path, total_size: u64) -> ServerResult<(PathBuf, u64)> {
    if target.is_dir() {
        return Err(ServerError::op(
            ErrorKind::InvalidArgument,
            "target is a directory",
        ));
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }

    let staging = staging_path(target);
    let resume_offset = match fs::metadata(&staging).await {
        Ok(meta) => {
            let len = meta.len();
            if len <= total_size {
                len
            } else {
                fs::File::create(&staging).await?;
                0
            }
        }
        Err(_) => {
            fs::File::create(&staging).await?;
            0
        }
    };

    debug!(staging = %staging.display(), resume_offset, "upload staged");
    Ok((staging, resume_offset))
}

/// Write one chunk at `offset`.
///
/// Writes must be contiguous: `offset` has to equal the staging file's
/// current length, so an interrupted stream can never leave a gap.
/// Returns the new committed length.
pub async fn write_chunk(staging: &Path, offset: u64, data: &[u8]) -> ServerResult<u64> {
    let current = fs::metadata(staging)
        .await
        .map_err(|_| ServerError::op(ErrorKind::InvalidArgument, "no active upload staging"))?
        .len();
    if offset != current {
        return Err(ServerError::op(
            ErrorKind::InvalidArgument,
            format!("non-contiguous write: offset {offset}, committed {current}"),
        ));
    }

    let mut file = fs::OpenOptions::new().write(true).open(staging).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(offset + data.len() as u64)
}

/// Finalize an upload: verify the digest, atomically promote staging to
/// the final path, and restore the advertised mtime when supplied.
///
/// On digest mismatch the staging file is deleted and nothing else
/// changes.
pub async fn commit_upload(
    staging: &Path,
    target: &Path,
    expected_digest: &str,
    mtime: Option<u64>,
) -> ServerResult<String> {
    let actual = file_digest(staging).await?;
    if !actual.eq_ignore_ascii_case(expected_digest) {
        let _ = fs::remove_file(staging).await;
        return Err(ServerError::op(
            ErrorKind::ChecksumMismatch,
            format!("expected {expected_digest}, computed {actual}"),
        ));
    }

    fs::rename(staging, target).await?;

    if let Some(secs) = mtime {
        // set_modified has no tokio::fs counterpart; keep the syscall
        // pair off the runtime threads.
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let file = std::fs::OpenOptions::new().write(true).open(&target)?;
            file.set_modified(UNIX_EPOCH + Duration::from_secs(secs))
        })
        .await
        .map_err(|e| ServerError::op(ErrorKind::Internal, format!("mtime restore: {e}")))??;
    }

    debug!(target = %target.display(), "upload committed");
    Ok(actual)
}

/// Stat a file for download: size and full digest.
pub async fn start_download(target: &Path, offset: u64) -> ServerResult<(u64, String)> {
    let meta = metadata_of(target).await?;
    if !meta.is_file() {
        return Err(ServerError::op(ErrorKind::InvalidArgument, "not a file"));
    }
    let size = meta.len();
    if offset > size {
        return Err(ServerError::op(
            ErrorKind::InvalidArgument,
            format!("offset {offset} beyond file size {size}"),
        ));
    }
    let digest = file_digest(target).await?;
    Ok((size, digest))
}

/// Read up to `max_len` bytes at `offset`. Returns the bytes and whether
/// the end of the file follows them.
pub async fn read_chunk(target: &Path, offset: u64, max_len: u32) -> ServerResult<(Vec<u8>, bool)> {
    let size = metadata_of(target).await?.len();
    if offset >= size {
        return Ok((Vec::new(), true));
    }

    let want = ((size - offset).min(max_len as u64)) as usize;
    let mut file = fs::File::open(target).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; want];
    file.read_exact(&mut buf).await?;

    let eof = offset + want as u64 >= size;
    Ok((buf, eof))
}

/// Delete a file. Deleting a missing file is an error, never a silent
/// success.
pub async fn delete(target: &Path) -> ServerResult<()> {
    let meta = metadata_of(target).await?;
    if meta.is_dir() {
        return Err(ServerError::op(
            ErrorKind::InvalidArgument,
            "target is a directory; use RMDIR",
        ));
    }
    fs::remove_file(target).await?;
    Ok(())
}

/// Rename a file within the library. The destination must not exist.
pub async fn rename(from: &Path, to: &Path) -> ServerResult<()> {
    metadata_of(from).await?;
    if fs::metadata(to).await.is_ok() {
        return Err(ServerError::op(
            ErrorKind::AlreadyExists,
            "destination already exists",
        ));
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::rename(from, to).await?;
    Ok(())
}

/// Create a directory and any missing parents. Idempotent.
pub async fn mkdir(target: &Path) -> ServerResult<()> {
    if let Ok(meta) = fs::metadata(target).await {
        if meta.is_dir() {
            return Ok(());
        }
        return Err(ServerError::op(
            ErrorKind::AlreadyExists,
            "a file exists at this path",
        ));
    }
    fs::create_dir_all(target).await?;
    Ok(())
}

/// Remove a directory; refuses a non-empty one unless `recursive`.
pub async fn rmdir(target: &Path, recursive: bool) -> ServerResult<()> {
    let meta = metadata_of(target).await?;
    if !meta.is_dir() {
        return Err(ServerError::op(ErrorKind::InvalidArgument, "not a directory"));
    }

    let mut entries = fs::read_dir(target).await?;
    let non_empty = entries.next_entry().await?.is_some();
    if non_empty && !recursive {
        return Err(ServerError::op(
            ErrorKind::InvalidArgument,
            "directory not empty",
        ));
    }

    if non_empty {
        fs::remove_dir_all(target).await?;
    } else {
        fs::remove_dir(target).await?;
    }
    Ok(())
}

/// List a directory. Paths in the result are relative to `root`,
/// `/`-separated; no digests are computed.
pub async fn list(target: &Path, root: &Path, recursive: bool) -> ServerResult<Vec<EntryInfo>> {
    let meta = metadata_of(target).await?;
    if !meta.is_dir() {
        return Err(ServerError::op(ErrorKind::InvalidArgument, "not a directory"));
    }

    let mut out = Vec::new();
    let mut pending = vec![target.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let meta = entry.metadata().await?;
            if is_staging(&path) {
                continue;
            }
            out.push(entry_info(&path, root, &meta, None)?);
            if recursive && meta.is_dir() {
                pending.push(path);
            }
        }
    }

    out.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(out)
}

/// Recursive listing with per-file digests.
pub async fn manifest(target: &Path, root: &Path) -> ServerResult<Vec<EntryInfo>> {
    let mut entries = list(target, root, true).await?;
    for entry in &mut entries {
        if entry.kind == EntryKind::File {
            let abs = root.join(&entry.path);
            entry.digest = Some(file_digest(&abs).await?);
        }
    }
    Ok(entries)
}

/// Size, digest, and mtime of a single path.
pub async fn stat(target: &Path, root: &Path) -> ServerResult<EntryInfo> {
    let meta = metadata_of(target).await?;
    let digest = if meta.is_file() {
        Some(file_digest(target).await?)
    } else {
        None
    };
    entry_info(target, root, &meta, digest)
}

/// Full-file digest, streamed.
pub async fn checksum(target: &Path) -> ServerResult<String> {
    metadata_of(target).await?;
    file_digest(target).await
}

pub async fn exists(target: &Path) -> bool {
    fs::metadata(target).await.is_ok()
}

/// Streamed SHA-256 of a file, lowercase hex.
pub async fn file_digest(path: &Path) -> ServerResult<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; IO_BUFFER];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

async fn metadata_of(path: &Path) -> ServerResult<std::fs::Metadata> {
    fs::metadata(path).await.map_err(|_| {
        ServerError::op(
            ErrorKind::NotFound,
            format!("no such file or directory: {}", path.display()),
        )
    })
}

fn is_staging(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(STAGING_SUFFIX))
        .unwrap_or(false)
}

fn entry_info(
    path: &Path,
    root: &Path,
    meta: &std::fs::Metadata,
    digest: Option<String>,
) -> ServerResult<EntryInfo> {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let rel = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    Ok(EntryInfo {
        path: rel,
        kind: if meta.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        },
        size: if meta.is_dir() { 0 } else { meta.len() },
        mtime,
        digest,
    })
}
