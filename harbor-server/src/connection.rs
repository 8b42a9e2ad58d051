//! Per-connection state machine.
//!
//! Every connection walks `AwaitingHandshake -> Active -> Closing`. The
//! first frame must be HANDSHAKE; after that the handler reads one frame
//! at a time, dispatches it synchronously, and emits the response before
//! touching the next frame, so responses within a session are strictly
//! ordered. This is also the single place where errors become wire
//! status codes.

use harbor_types::frame::{self, Frame};
use harbor_types::{ErrorKind, Request, Response, PROTOCOL_VERSION};
use rustls::pki_types::CertificateDer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ServerError, ServerResult};
use crate::fsops;
use crate::limits::ByteBucket;
use crate::registry::{DownloadState, LockMode, Session, UploadState};
use crate::server::SharedState;

enum HandlerState {
    AwaitingHandshake,
    Active(Box<ActiveSession>),
    /// Carries the session so cleanup still runs after a DISCONNECT.
    Closing(Option<Arc<Session>>),
}

struct ActiveSession {
    session: Arc<Session>,
    /// Canonicalized library root, used to relativize listing entries.
    root: PathBuf,
    exclusive_writer: bool,
    bucket: Arc<ByteBucket>,
}

/// Handles one TLS connection from accept to close.
pub struct ConnectionHandler {
    reader: BufReader<ReadHalf<TlsStream<TcpStream>>>,
    writer: BufWriter<WriteHalf<TlsStream<TcpStream>>>,
    peer: SocketAddr,
    peer_cert: CertificateDer<'static>,
    shared: Arc<SharedState>,
    state: HandlerState,
    read_timeout: Duration,
}

impl ConnectionHandler {
    pub fn new(
        stream: TlsStream<TcpStream>,
        peer: SocketAddr,
        peer_cert: CertificateDer<'static>,
        shared: Arc<SharedState>,
    ) -> Self {
        let read_timeout = Duration::from_secs(shared.config.network.read_timeout_secs);
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            peer,
            peer_cert,
            shared,
            state: HandlerState::AwaitingHandshake,
            read_timeout,
        }
    }

    /// Run the connection to completion.
    pub async fn run(mut self) {
        debug!(peer = %self.peer, "connection handler started");

        loop {
            if matches!(self.state, HandlerState::Closing(_)) {
                break;
            }

            let cancel = self.cancel_token();

            // The idle wait for the next header is bounded by the reaper
            // and shutdown, not the read timeout; once a frame has
            // started, the remainder must arrive promptly or the peer is
            // treated as half-open.
            let read = tokio::select! {
                result = frame::read_header(&mut self.reader) => Some(result),
                _ = cancel.cancelled() => None,
            };
            let header = match read {
                Some(Ok(header)) => header,
                Some(Err(e)) => {
                    self.note_transport_end(&e);
                    break;
                }
                None => {
                    debug!(peer = %self.peer, "connection cancelled");
                    break;
                }
            };

            let frame = match timeout(self.read_timeout, frame::read_rest(&mut self.reader, header)).await {
                Ok(Ok(frame)) => frame,
                Ok(Err(e)) => {
                    warn!(peer = %self.peer, error = %e, "frame error");
                    let err = ServerError::Frame(e);
                    let _ = self.send_error("?", &err).await;
                    break;
                }
                Err(_) => {
                    warn!(peer = %self.peer, "read timeout mid-frame; dropping half-open peer");
                    break;
                }
            };

            let request: Request = match frame.parse_payload() {
                Ok(req) => req,
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "unparseable request payload");
                    let err = ServerError::op(ErrorKind::UnknownCommand, "unrecognized command");
                    let _ = self.send_error(&frame.header.command, &err).await;
                    break;
                }
            };

            let command = request.command_name();
            self.shared.metrics.commands_total.fetch_add(1, Ordering::Relaxed);
            if let HandlerState::Active(active) = &self.state {
                active.session.touch();
            }

            match self.dispatch(request, frame.body).await {
                Ok((response, body)) => {
                    if let Err(e) = self.send_response(command, &response, body).await {
                        warn!(peer = %self.peer, error = %e, "failed to send response");
                        break;
                    }
                }
                Err(err) => {
                    let kind = err.kind();
                    self.shared.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
                    warn!(peer = %self.peer, command, kind = %kind, error = %err, "command failed");
                    // Best-effort error response; protocol errors and any
                    // handshake failure then terminate the connection.
                    let _ = self.send_error(command, &err).await;
                    if kind.is_fatal() || matches!(self.state, HandlerState::AwaitingHandshake) {
                        break;
                    }
                }
            }
        }

        self.close().await;
    }

    fn cancel_token(&self) -> CancellationToken {
        match &self.state {
            HandlerState::Active(active) => active.session.cancel.clone(),
            _ => self.shared.shutdown.clone(),
        }
    }

    fn note_transport_end(&self, err: &harbor_types::FrameError) {
        match err {
            harbor_types::FrameError::Io(e)
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                debug!(peer = %self.peer, "peer disconnected");
            }
            other => {
                warn!(peer = %self.peer, error = %other, "transport error");
            }
        }
    }

    async fn dispatch(
        &mut self,
        request: Request,
        body: Vec<u8>,
    ) -> ServerResult<(Response, Vec<u8>)> {
        let active = match &self.state {
            HandlerState::AwaitingHandshake => {
                return match request {
                    Request::Handshake {
                        library_id,
                        protocol_version,
                    } => {
                        let response = self.handshake(library_id, protocol_version).await?;
                        Ok((response, Vec::new()))
                    }
                    other => Err(ServerError::op(
                        ErrorKind::UnexpectedCommand,
                        format!("{} before HANDSHAKE", other.command_name()),
                    )),
                };
            }
            HandlerState::Closing(_) => {
                return Err(ServerError::op(
                    ErrorKind::UnexpectedCommand,
                    "connection is closing",
                ));
            }
            HandlerState::Active(active) => active.clone_refs(),
        };

        match request {
            Request::Handshake { .. } => Err(ServerError::op(
                ErrorKind::UnexpectedCommand,
                "session is already established",
            )),
            Request::Ping => Ok((Response::Pong, Vec::new())),
            Request::Disconnect => {
                info!(peer = %self.peer, "client disconnecting");
                self.state = HandlerState::Closing(Some(active.session.clone()));
                Ok((Response::Ok, Vec::new()))
            }
            other => self.command(&active, other, body).await,
        }
    }

    async fn handshake(
        &mut self,
        library_id: harbor_types::LibraryId,
        client_version: u16,
    ) -> ServerResult<Response> {
        if client_version != PROTOCOL_VERSION {
            return Err(ServerError::op(
                ErrorKind::VersionMismatch,
                format!("client speaks v{client_version}, server speaks v{PROTOCOL_VERSION}"),
            ));
        }

        let record = match self.shared.auth.authenticate(&self.peer_cert) {
            Ok(record) => record,
            Err(e) => {
                self.shared.metrics.auth_failures.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        if let Err(e) = self.shared.handshake_limits.check(&record.id) {
            self.shared.metrics.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        let library = self.shared.libraries.lookup(&library_id)?;
        if !library.authorized.contains(&record.id) {
            self.shared.metrics.auth_failures.fetch_add(1, Ordering::Relaxed);
            return Err(ServerError::op(
                ErrorKind::Forbidden,
                format!("client is not authorized for library {library_id}"),
            ));
        }

        let root = library.root.canonicalize().map_err(|e| {
            ServerError::op(ErrorKind::Internal, format!("library root vanished: {e}"))
        })?;

        let session = self.shared.registry.create(
            record.id.clone(),
            library.id.clone(),
            self.peer,
            self.shared.shutdown.child_token(),
        );
        let bucket = self.shared.throttles.bucket(&record.id, library.rate_cap);
        self.shared.metrics.sessions_total.fetch_add(1, Ordering::Relaxed);

        info!(
            peer = %self.peer,
            client = %record.name,
            library = %library.id,
            session = %session.id,
            "handshake complete"
        );

        let response = Response::Handshake {
            session_id: session.id,
            protocol_version: PROTOCOL_VERSION,
            chunk_size: self.shared.config.network.chunk_size,
            resumable: true,
        };

        self.state = HandlerState::Active(Box::new(ActiveSession {
            session,
            root,
            exclusive_writer: library.exclusive_writer,
            bucket,
        }));

        Ok(response)
    }

    async fn command(
        &self,
        active: &ActiveSession,
        request: Request,
        body: Vec<u8>,
    ) -> ServerResult<(Response, Vec<u8>)> {
        let registry = &self.shared.registry;
        let session = &active.session;
        let resolve = |path: &str| self.shared.libraries.resolve(&session.library, path);

        match request {
            Request::PutStart { path, size, digest } => {
                let target = resolve(&path)?;
                registry.acquire(
                    session,
                    target.clone(),
                    LockMode::ExclusiveWrite,
                    active.exclusive_writer,
                )?;

                let (staging, resume_offset) = match fsops::start_upload(&target, size).await {
                    Ok(ok) => ok,
                    Err(e) => {
                        registry.release(session, &target);
                        return Err(e);
                    }
                };
                session.begin_upload(
                    target.clone(),
                    UploadState {
                        staging,
                        total_size: size,
                        expected_digest: digest,
                        committed: resume_offset,
                        started: std::time::Instant::now(),
                    },
                );
                info!(session = %session.id, path, size, resume_offset, "upload started");
                Ok((Response::PutStart { resume_offset }, Vec::new()))
            }

            Request::PutChunk { path, offset } => {
                let target = resolve(&path)?;
                let upload = session.upload(&target).ok_or_else(|| {
                    ServerError::op(ErrorKind::InvalidArgument, "no active upload for path")
                })?;
                if offset + body.len() as u64 > upload.total_size {
                    return Err(ServerError::op(
                        ErrorKind::SizeTooLarge,
                        "chunk extends past the advertised size",
                    ));
                }

                active.bucket.consume(body.len() as u64, &session.cancel).await?;
                let committed = fsops::write_chunk(&upload.staging, offset, &body).await?;
                session.advance_upload(&target, committed);
                self.shared
                    .metrics
                    .bytes_in
                    .fetch_add(body.len() as u64, Ordering::Relaxed);
                Ok((Response::PutChunk { committed }, Vec::new()))
            }

            Request::PutCommit { path, mtime } => {
                let target = resolve(&path)?;
                let upload = session.finish_upload(&target).ok_or_else(|| {
                    ServerError::op(ErrorKind::InvalidArgument, "no active upload for path")
                })?;

                let result =
                    fsops::commit_upload(&upload.staging, &target, &upload.expected_digest, mtime)
                        .await;
                registry.release(session, &target);

                let digest = result?;
                info!(session = %session.id, path, "upload committed");
                Ok((Response::PutCommit { digest }, Vec::new()))
            }

            Request::GetStart { path, offset } => {
                let target = resolve(&path)?;
                registry.acquire(session, target.clone(), LockMode::SharedRead, false)?;

                let (size, digest) = match fsops::start_download(&target, offset).await {
                    Ok(ok) => ok,
                    Err(e) => {
                        registry.release(session, &target);
                        return Err(e);
                    }
                };
                session.begin_download(target, DownloadState { size, digest: digest.clone() });
                info!(session = %session.id, path, size, offset, "download started");
                Ok((Response::GetStart { size, digest, offset }, Vec::new()))
            }

            Request::GetChunk { path, offset, max_len } => {
                let target = resolve(&path)?;
                session.download(&target).ok_or_else(|| {
                    ServerError::op(ErrorKind::InvalidArgument, "no active download for path")
                })?;

                let max_len = max_len.min(frame::MAX_BODY_LEN as u32);
                let (bytes, eof) = fsops::read_chunk(&target, offset, max_len).await?;
                active.bucket.consume(bytes.len() as u64, &session.cancel).await?;
                self.shared
                    .metrics
                    .bytes_out
                    .fetch_add(bytes.len() as u64, Ordering::Relaxed);

                if eof {
                    session.finish_download(&target);
                    registry.release(session, &target);
                }
                let response = Response::GetChunk {
                    len: bytes.len() as u32,
                    eof,
                };
                Ok((response, bytes))
            }

            Request::Delete { path } => {
                let target = resolve(&path)?;
                if registry.is_locked(&session.library, &target) {
                    return Err(ServerError::op(ErrorKind::Locked, "path is locked"));
                }
                fsops::delete(&target).await?;
                info!(session = %session.id, path, "deleted");
                Ok((Response::Ok, Vec::new()))
            }

            Request::Rename { from, to } => {
                let source = resolve(&from)?;
                let dest = resolve(&to)?;
                if registry.is_locked(&session.library, &source)
                    || registry.is_locked(&session.library, &dest)
                {
                    return Err(ServerError::op(ErrorKind::Locked, "path is locked"));
                }
                fsops::rename(&source, &dest).await?;
                info!(session = %session.id, from, to, "renamed");
                Ok((Response::Ok, Vec::new()))
            }

            Request::List { path, recursive } => {
                let target = resolve(&path)?;
                let entries = fsops::list(&target, &active.root, recursive).await?;
                Ok((Response::List { entries }, Vec::new()))
            }

            Request::Mkdir { path } => {
                let target = resolve(&path)?;
                fsops::mkdir(&target).await?;
                Ok((Response::Ok, Vec::new()))
            }

            Request::Rmdir { path, recursive } => {
                let target = resolve(&path)?;
                fsops::rmdir(&target, recursive).await?;
                Ok((Response::Ok, Vec::new()))
            }

            Request::Manifest { path } => {
                let target = resolve(&path)?;
                let entries = fsops::manifest(&target, &active.root).await?;
                Ok((Response::Manifest { entries }, Vec::new()))
            }

            Request::Checksum { path } => {
                let target = resolve(&path)?;
                let digest = fsops::checksum(&target).await?;
                Ok((Response::Checksum { digest }, Vec::new()))
            }

            Request::Stat { path } => {
                let target = resolve(&path)?;
                let entry = fsops::stat(&target, &active.root).await?;
                Ok((Response::Stat { entry }, Vec::new()))
            }

            Request::Exists { path } => {
                let target = resolve(&path)?;
                let exists = fsops::exists(&target).await;
                Ok((Response::Exists { exists }, Vec::new()))
            }

            Request::Handshake { .. } | Request::Ping | Request::Disconnect => {
                // Routed in dispatch; unreachable here.
                Err(ServerError::op(ErrorKind::Internal, "misrouted command"))
            }
        }
    }

    async fn send_response(
        &mut self,
        command: &str,
        response: &Response,
        body: Vec<u8>,
    ) -> ServerResult<()> {
        let status = match response {
            Response::Error { kind, .. } => kind.status(),
            _ => harbor_types::StatusCode::Ok,
        };
        let frame = Frame::response(command, status, response, body)?;
        frame::write_frame(&mut self.writer, &frame).await?;
        Ok(())
    }

    async fn send_error(&mut self, command: &str, err: &ServerError) -> ServerResult<()> {
        let response = Response::Error {
            kind: err.kind(),
            message: err.peer_message(),
        };
        self.send_response(command, &response, Vec::new()).await
    }

    async fn close(&mut self) {
        // Locks release here, but staging files stay behind so an
        // interrupted upload can resume on the next connection. Only the
        // idle reaper removes staging.
        match &self.state {
            HandlerState::Active(active) => {
                let _ = self.shared.registry.close(&active.session.id);
            }
            HandlerState::Closing(Some(session)) => {
                let _ = self.shared.registry.close(&session.id);
            }
            _ => {}
        }
        let _ = self.writer.shutdown().await;
        debug!(peer = %self.peer, "connection closed");
    }
}

impl ActiveSession {
    fn clone_refs(&self) -> ActiveSession {
        ActiveSession {
            session: self.session.clone(),
            root: self.root.clone(),
            exclusive_writer: self.exclusive_writer,
            bucket: self.bucket.clone(),
        }
    }
}
