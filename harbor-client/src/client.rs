//! The FileHarbor client engine.
//!
//! [`HarborClient`] is the protocol engine, generic over a transport:
//! handshake, file commands, and the chunked upload/download drivers
//! with resume. [`Harbor`] layers connection management and the retry
//! policy on top for real deployments.

use harbor_types::frame::Frame;
use harbor_types::message::EntryInfo;
use harbor_types::{ErrorKind, LibraryId, Request, Response, SessionId, PROTOCOL_VERSION};
use sha2::{Digest, Sha256};
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::progress::{Operation, ProgressCallback, ProgressTracker};
use crate::retry::RetryPolicy;
use crate::transport::{TlsTransport, Transport};

/// Session metadata returned by the server at handshake.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub protocol_version: u16,
    pub chunk_size: u32,
    pub resumable: bool,
}

/// Protocol engine over one connected transport.
pub struct HarborClient<T: Transport> {
    transport: T,
    configured_chunk: u32,
    session: Option<SessionInfo>,
}

impl<T: Transport> std::fmt::Debug for HarborClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarborClient")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> HarborClient<T> {
    pub fn new(transport: T, chunk_size: u32) -> Self {
        Self {
            transport,
            configured_chunk: chunk_size,
            session: None,
        }
    }

    /// Perform the handshake, binding this connection to a library.
    pub async fn handshake(&mut self, library_id: &LibraryId) -> ClientResult<SessionInfo> {
        let request = Request::Handshake {
            library_id: library_id.clone(),
            protocol_version: PROTOCOL_VERSION,
        };
        let (response, _) = self.request(&request, Vec::new()).await?;
        match response {
            Response::Handshake {
                session_id,
                protocol_version,
                chunk_size,
                resumable,
            } => {
                let info = SessionInfo {
                    session_id,
                    protocol_version,
                    chunk_size,
                    resumable,
                };
                info!(session = %session_id, library = %library_id, "session established");
                self.session = Some(info.clone());
                Ok(info)
            }
            other => Err(unexpected("HANDSHAKE", &other)),
        }
    }

    pub fn session(&self) -> Option<&SessionInfo> {
        self.session.as_ref()
    }

    /// Upload a local file, resuming any interrupted transfer of the
    /// same path.
    pub async fn upload(
        &mut self,
        local: &Path,
        remote: &str,
        callback: Option<ProgressCallback>,
    ) -> ClientResult<()> {
        self.ensure_session()?;

        let meta = fs::metadata(local).await?;
        let size = meta.len();
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs());
        let digest = file_digest(local).await?;

        let mut tracker = ProgressTracker::new(Operation::Upload, remote, size, callback);

        let request = Request::PutStart {
            path: remote.to_string(),
            size,
            digest: digest.clone(),
        };
        let (response, _) = self.request(&request, Vec::new()).await?;
        let resume_offset = match response {
            Response::PutStart { resume_offset } => resume_offset,
            other => return Err(unexpected("PUT_START", &other)),
        };
        tracker.set_position(resume_offset);
        debug!(remote, size, resume_offset, "upload starting");

        let chunk_size = self.chunk_size() as usize;
        let mut file = fs::File::open(local).await?;
        file.seek(SeekFrom::Start(resume_offset)).await?;
        let mut offset = resume_offset;
        let mut buf = vec![0u8; chunk_size];

        while offset < size {
            let want = ((size - offset) as usize).min(chunk_size);
            file.read_exact(&mut buf[..want]).await?;

            let request = Request::PutChunk {
                path: remote.to_string(),
                offset,
            };
            let (response, _) = self.request(&request, buf[..want].to_vec()).await?;
            offset = match response {
                Response::PutChunk { committed } => committed,
                other => return Err(unexpected("PUT_CHUNK", &other)),
            };
            tracker.advance(want as u64);
        }

        let request = Request::PutCommit {
            path: remote.to_string(),
            mtime,
        };
        let (response, _) = self.request(&request, Vec::new()).await?;
        match response {
            Response::PutCommit { .. } => {
                tracker.finish();
                info!(remote, size, "upload complete");
                Ok(())
            }
            other => Err(unexpected("PUT_COMMIT", &other)),
        }
    }

    /// Download a remote file, appending to a local partial file when
    /// one exists. The result is verified against the server's digest;
    /// on mismatch the local file is deleted.
    pub async fn download(
        &mut self,
        remote: &str,
        local: &Path,
        callback: Option<ProgressCallback>,
    ) -> ClientResult<()> {
        self.ensure_session()?;

        let local_len = fs::metadata(local).await.map(|m| m.len()).unwrap_or(0);
        let (size, expected_digest, mut offset) = self.get_start(remote, local_len).await?;

        let mut tracker = ProgressTracker::new(Operation::Download, remote, size, callback);
        tracker.set_position(offset);
        debug!(remote, size, offset, "download starting");

        if let Some(parent) = local.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(local)
            .await?;
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let chunk_size = self.chunk_size();
        loop {
            let request = Request::GetChunk {
                path: remote.to_string(),
                offset,
                max_len: chunk_size,
            };
            let (response, body) = self.request(&request, Vec::new()).await?;
            let (len, eof) = match response {
                Response::GetChunk { len, eof } => (len, eof),
                other => return Err(unexpected("GET_CHUNK", &other)),
            };
            if body.len() != len as usize {
                return Err(ClientError::Protocol(format!(
                    "chunk length {} does not match body {}",
                    len,
                    body.len()
                )));
            }

            file.write_all(&body).await?;
            offset += len as u64;
            tracker.advance(len as u64);
            if eof {
                break;
            }
        }
        file.flush().await?;
        drop(file);

        let actual = file_digest(local).await?;
        if !actual.eq_ignore_ascii_case(&expected_digest) {
            let _ = fs::remove_file(local).await;
            return Err(ClientError::ChecksumMismatch {
                path: local.to_path_buf(),
                expected: expected_digest,
                actual,
            });
        }

        tracker.finish();
        info!(remote, size, "download complete");
        Ok(())
    }

    pub async fn delete(&mut self, remote: &str) -> ClientResult<()> {
        self.simple(Request::Delete {
            path: remote.to_string(),
        })
        .await
    }

    pub async fn rename(&mut self, from: &str, to: &str) -> ClientResult<()> {
        self.simple(Request::Rename {
            from: from.to_string(),
            to: to.to_string(),
        })
        .await
    }

    pub async fn mkdir(&mut self, remote: &str) -> ClientResult<()> {
        self.simple(Request::Mkdir {
            path: remote.to_string(),
        })
        .await
    }

    pub async fn rmdir(&mut self, remote: &str, recursive: bool) -> ClientResult<()> {
        self.simple(Request::Rmdir {
            path: remote.to_string(),
            recursive,
        })
        .await
    }

    pub async fn list(&mut self, remote: &str, recursive: bool) -> ClientResult<Vec<EntryInfo>> {
        self.ensure_session()?;
        let request = Request::List {
            path: remote.to_string(),
            recursive,
        };
        let (response, _) = self.request(&request, Vec::new()).await?;
        match response {
            Response::List { entries } => Ok(entries),
            other => Err(unexpected("LIST", &other)),
        }
    }

    pub async fn manifest(&mut self, remote: &str) -> ClientResult<Vec<EntryInfo>> {
        self.ensure_session()?;
        let request = Request::Manifest {
            path: remote.to_string(),
        };
        let (response, _) = self.request(&request, Vec::new()).await?;
        match response {
            Response::Manifest { entries } => Ok(entries),
            other => Err(unexpected("MANIFEST", &other)),
        }
    }

    pub async fn checksum(&mut self, remote: &str) -> ClientResult<String> {
        self.ensure_session()?;
        let request = Request::Checksum {
            path: remote.to_string(),
        };
        let (response, _) = self.request(&request, Vec::new()).await?;
        match response {
            Response::Checksum { digest } => Ok(digest),
            other => Err(unexpected("CHECKSUM", &other)),
        }
    }

    pub async fn stat(&mut self, remote: &str) -> ClientResult<EntryInfo> {
        self.ensure_session()?;
        let request = Request::Stat {
            path: remote.to_string(),
        };
        let (response, _) = self.request(&request, Vec::new()).await?;
        match response {
            Response::Stat { entry } => Ok(entry),
            other => Err(unexpected("STAT", &other)),
        }
    }

    pub async fn exists(&mut self, remote: &str) -> ClientResult<bool> {
        self.ensure_session()?;
        let request = Request::Exists {
            path: remote.to_string(),
        };
        let (response, _) = self.request(&request, Vec::new()).await?;
        match response {
            Response::Exists { exists } => Ok(exists),
            other => Err(unexpected("EXISTS", &other)),
        }
    }

    pub async fn ping(&mut self) -> ClientResult<()> {
        self.ensure_session()?;
        let (response, _) = self.request(&Request::Ping, Vec::new()).await?;
        match response {
            Response::Pong => Ok(()),
            other => Err(unexpected("PING", &other)),
        }
    }

    /// Graceful disconnect; the transport is closed afterwards.
    pub async fn disconnect(&mut self) -> ClientResult<()> {
        if self.session.is_some() {
            let _ = self.request(&Request::Disconnect, Vec::new()).await;
            self.session = None;
        }
        self.transport.close().await
    }

    async fn get_start(
        &mut self,
        remote: &str,
        local_len: u64,
    ) -> ClientResult<(u64, String, u64)> {
        let request = Request::GetStart {
            path: remote.to_string(),
            offset: local_len,
        };
        match self.request(&request, Vec::new()).await {
            Ok((Response::GetStart { size, digest, offset }, _)) => Ok((size, digest, offset)),
            Ok((other, _)) => Err(unexpected("GET_START", &other)),
            // A local partial longer than the remote file cannot be
            // resumed; restart from zero.
            Err(ClientError::Server {
                kind: ErrorKind::InvalidArgument,
                ..
            }) if local_len > 0 => {
                let request = Request::GetStart {
                    path: remote.to_string(),
                    offset: 0,
                };
                match self.request(&request, Vec::new()).await? {
                    (Response::GetStart { size, digest, offset }, _) => Ok((size, digest, offset)),
                    (other, _) => Err(unexpected("GET_START", &other)),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn simple(&mut self, request: Request) -> ClientResult<()> {
        self.ensure_session()?;
        let command = request.command_name();
        let (response, _) = self.request(&request, Vec::new()).await?;
        match response {
            Response::Ok => Ok(()),
            other => Err(unexpected(command, &other)),
        }
    }

    async fn request(
        &mut self,
        request: &Request,
        body: Vec<u8>,
    ) -> ClientResult<(Response, Vec<u8>)> {
        let frame = Frame::request(request.command_name(), request, body)?;
        self.transport.send(&frame).await?;
        let reply = self.transport.recv().await?;
        let response: Response = reply.parse_payload()?;
        if let Response::Error { kind, message } = response {
            return Err(ClientError::Server { kind, message });
        }
        Ok((response, reply.body))
    }

    fn ensure_session(&self) -> ClientResult<()> {
        if self.session.is_none() {
            return Err(ClientError::NotConnected);
        }
        Ok(())
    }

    /// Effective chunk size: the configured value, capped by the
    /// server's handshake hint.
    fn chunk_size(&self) -> u32 {
        match &self.session {
            Some(info) if info.chunk_size > 0 => self.configured_chunk.min(info.chunk_size),
            _ => self.configured_chunk,
        }
    }
}

fn unexpected(command: &str, response: &Response) -> ClientError {
    ClientError::Protocol(format!("unexpected response to {command}: {response:?}"))
}

/// Streamed SHA-256 of a local file, lowercase hex.
pub async fn file_digest(path: &Path) -> ClientResult<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// High-level client: opens a fresh connection per operation attempt and
/// applies the retry policy, reusing upload/download resume across
/// attempts.
pub struct Harbor {
    config: ClientConfig,
    retry: RetryPolicy,
}

impl Harbor {
    pub fn new(config: ClientConfig) -> Self {
        let retry = RetryPolicy::with_attempts(config.transfer.retry_attempts);
        Self { config, retry }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connect and handshake into the configured library.
    pub async fn connect(&self) -> ClientResult<HarborClient<TlsTransport>> {
        let transport = TlsTransport::connect(&self.config).await?;
        let mut client = HarborClient::new(transport, self.config.transfer.chunk_size);
        client
            .handshake(&LibraryId::new(self.config.identity.library_id.clone()))
            .await?;
        Ok(client)
    }

    /// Upload with retry; each attempt reconnects and resumes.
    pub async fn upload(
        &self,
        local: &Path,
        remote: &str,
        callback: Option<ProgressCallback>,
    ) -> ClientResult<()> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let result = self.upload_once(local, remote, callback.clone()).await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) if self.retry.should_retry(&e, attempts) => {
                    let delay = self.retry.delay_for(attempts - 1);
                    warn!(attempt = attempts, error = %e, ?delay, "upload failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Download with retry; each attempt reconnects and resumes.
    pub async fn download(
        &self,
        remote: &str,
        local: &Path,
        callback: Option<ProgressCallback>,
    ) -> ClientResult<()> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let result = self.download_once(remote, local, callback.clone()).await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) if self.retry.should_retry(&e, attempts) => {
                    let delay = self.retry.delay_for(attempts - 1);
                    warn!(attempt = attempts, error = %e, ?delay, "download failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn upload_once(
        &self,
        local: &Path,
        remote: &str,
        callback: Option<ProgressCallback>,
    ) -> ClientResult<()> {
        let mut client = self.connect().await?;
        let result = client.upload(local, remote, callback).await;
        let _ = client.disconnect().await;
        result
    }

    async fn download_once(
        &self,
        remote: &str,
        local: &Path,
        callback: Option<ProgressCallback>,
    ) -> ClientResult<()> {
        let mut client = self.connect().await?;
        let result = client.download(remote, local, callback).await;
        let _ = client.disconnect().await;
        result
    }
}
