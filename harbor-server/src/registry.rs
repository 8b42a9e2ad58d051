//! Session registry: live sessions, file locks, and in-flight transfers.
//!
//! This is the only mutable shared state in the server. Sessions, the
//! lock table, and the per-library writer slots live in sharded maps;
//! lock records are owned here and referenced from sessions by path, so
//! there are no Session <-> Lock pointer cycles.

use dashmap::DashMap;
use harbor_types::{ClientId, ErrorKind, LibraryId, SessionId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ServerError, ServerResult};

/// Lock mode for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Held by one session for upload; excludes any other lock.
    ExclusiveWrite,
    /// Held by N sessions for concurrent downloads.
    SharedRead,
}

#[derive(Debug)]
struct LockEntry {
    mode: LockMode,
    holders: Vec<SessionId>,
}

#[derive(Debug)]
struct WriterSlot {
    session: SessionId,
    count: usize,
}

/// State of an upload in progress.
#[derive(Debug, Clone)]
pub struct UploadState {
    pub staging: PathBuf,
    pub total_size: u64,
    pub expected_digest: String,
    pub committed: u64,
    pub started: Instant,
}

/// State of a download in progress.
#[derive(Debug, Clone)]
pub struct DownloadState {
    pub size: u64,
    pub digest: String,
}

#[derive(Debug, Default)]
struct Transfers {
    uploads: HashMap<PathBuf, UploadState>,
    downloads: HashMap<PathBuf, DownloadState>,
}

/// A live session: one authenticated connection bound to one library.
pub struct Session {
    pub id: SessionId,
    pub client: ClientId,
    pub library: LibraryId,
    pub peer: SocketAddr,
    pub created_at: Instant,
    /// Fired by the reaper or server shutdown; every suspension point in
    /// the connection task honors it.
    pub cancel: CancellationToken,
    last_activity: Mutex<Instant>,
    held: Mutex<HashMap<PathBuf, LockMode>>,
    transfers: Mutex<Transfers>,
}

impl Session {
    /// Refresh the idle timer.
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// Time since the last processed command.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    pub fn begin_upload(&self, path: PathBuf, state: UploadState) {
        self.transfers.lock().unwrap().uploads.insert(path, state);
    }

    pub fn upload(&self, path: &PathBuf) -> Option<UploadState> {
        self.transfers.lock().unwrap().uploads.get(path).cloned()
    }

    pub fn advance_upload(&self, path: &PathBuf, committed: u64) {
        if let Some(state) = self.transfers.lock().unwrap().uploads.get_mut(path) {
            state.committed = committed;
        }
    }

    pub fn finish_upload(&self, path: &PathBuf) -> Option<UploadState> {
        self.transfers.lock().unwrap().uploads.remove(path)
    }

    pub fn begin_download(&self, path: PathBuf, state: DownloadState) {
        self.transfers.lock().unwrap().downloads.insert(path, state);
    }

    pub fn download(&self, path: &PathBuf) -> Option<DownloadState> {
        self.transfers.lock().unwrap().downloads.get(path).cloned()
    }

    pub fn finish_download(&self, path: &PathBuf) -> Option<DownloadState> {
        self.transfers.lock().unwrap().downloads.remove(path)
    }

    fn drain_held(&self) -> Vec<(PathBuf, LockMode)> {
        self.held.lock().unwrap().drain().collect()
    }

    fn drain_staging(&self) -> Vec<PathBuf> {
        let mut transfers = self.transfers.lock().unwrap();
        transfers.downloads.clear();
        transfers
            .uploads
            .drain()
            .map(|(_, state)| state.staging)
            .collect()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("library", &self.library)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// What a closed session leaves behind for the caller to clean up.
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Staging files of aborted uploads, to be deleted.
    pub staging_files: Vec<PathBuf>,
}

/// Thread-safe store of sessions, locks, and writer slots.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, std::sync::Arc<Session>>,
    locks: DashMap<(LibraryId, PathBuf), LockEntry>,
    writers: DashMap<LibraryId, WriterSlot>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            locks: DashMap::new(),
            writers: DashMap::new(),
        }
    }

    /// Create and register a session. Insertion is race-free: the id is
    /// freshly generated and cannot collide within a server lifetime.
    pub fn create(
        &self,
        client: ClientId,
        library: LibraryId,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> std::sync::Arc<Session> {
        let session = std::sync::Arc::new(Session {
            id: SessionId::generate(),
            client,
            library,
            peer,
            created_at: Instant::now(),
            cancel,
            last_activity: Mutex::new(Instant::now()),
            held: Mutex::new(HashMap::new()),
            transfers: Mutex::new(Transfers::default()),
        });
        self.sessions.insert(session.id, session.clone());
        debug!(session = %session.id, client = %session.client, "session created");
        session
    }

    pub fn get(&self, id: &SessionId) -> Option<std::sync::Arc<Session>> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Acquire a lock on a path for a session.
    ///
    /// Non-blocking: a conflicting holder yields the retryable `Locked`
    /// error immediately. When `exclusive_writer` is set for the library,
    /// at most one session at a time may hold any exclusive-write lock in
    /// it.
    pub fn acquire(
        &self,
        session: &Session,
        path: PathBuf,
        mode: LockMode,
        exclusive_writer: bool,
    ) -> ServerResult<()> {
        // Re-acquiring a lock the session already holds is a no-op;
        // without this, a restarted PUT_START would double-claim the
        // library writer slot.
        if session.held.lock().unwrap().get(&path) == Some(&mode) {
            return Ok(());
        }

        let key = (session.library.clone(), path.clone());

        if mode == LockMode::ExclusiveWrite && exclusive_writer {
            self.claim_writer(session)?;
        }

        let result = match self.locks.entry(key) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(LockEntry {
                    mode,
                    holders: vec![session.id],
                });
                Ok(())
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                match (entry.mode, mode) {
                    (LockMode::SharedRead, LockMode::SharedRead) => {
                        entry.holders.push(session.id);
                        Ok(())
                    }
                    (LockMode::ExclusiveWrite, LockMode::ExclusiveWrite)
                        if entry.holders == [session.id] =>
                    {
                        // Re-acquire by the same session is a no-op.
                        Ok(())
                    }
                    _ => Err(ServerError::op(
                        ErrorKind::Locked,
                        format!("path is locked: {}", path.display()),
                    )),
                }
            }
        };

        match result {
            Ok(()) => {
                session.held.lock().unwrap().insert(path, mode);
                Ok(())
            }
            Err(e) => {
                if mode == LockMode::ExclusiveWrite && exclusive_writer {
                    self.release_writer(session);
                }
                Err(e)
            }
        }
    }

    /// Release a lock held by a session.
    pub fn release(&self, session: &Session, path: &PathBuf) {
        let mode = session.held.lock().unwrap().remove(path);
        let Some(mode) = mode else { return };
        self.release_entry(&session.library, path, session.id);
        if mode == LockMode::ExclusiveWrite {
            self.release_writer(session);
        }
    }

    /// Whether any session holds a lock on the path.
    pub fn is_locked(&self, library: &LibraryId, path: &PathBuf) -> bool {
        self.locks.contains_key(&(library.clone(), path.clone()))
    }

    /// Remove a session, releasing its locks and returning what is left
    /// to clean up on disk.
    pub fn close(&self, id: &SessionId) -> CleanupReport {
        let Some((_, session)) = self.sessions.remove(id) else {
            return CleanupReport::default();
        };

        for (path, mode) in session.drain_held() {
            self.release_entry(&session.library, &path, session.id);
            if mode == LockMode::ExclusiveWrite {
                self.release_writer(&session);
            }
        }
        session.cancel.cancel();

        let report = CleanupReport {
            staging_files: session.drain_staging(),
        };
        info!(
            session = %session.id,
            client = %session.client,
            staging = report.staging_files.len(),
            "session closed"
        );
        report
    }

    /// Sessions whose idle time exceeds their library's timeout.
    pub fn idle_sessions(
        &self,
        timeout_for: impl Fn(&LibraryId) -> Duration,
    ) -> Vec<std::sync::Arc<Session>> {
        self.sessions
            .iter()
            .filter(|entry| entry.idle_for() > timeout_for(&entry.library))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Terminate every session; used at server shutdown.
    pub fn close_all(&self) -> Vec<CleanupReport> {
        let ids: Vec<SessionId> = self.sessions.iter().map(|s| s.id).collect();
        ids.iter().map(|id| self.close(id)).collect()
    }

    fn claim_writer(&self, session: &Session) -> ServerResult<()> {
        match self.writers.entry(session.library.clone()) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(WriterSlot {
                    session: session.id,
                    count: 1,
                });
                Ok(())
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if slot.get().session == session.id {
                    slot.get_mut().count += 1;
                    Ok(())
                } else {
                    Err(ServerError::op(
                        ErrorKind::Locked,
                        "another session is writing to this library",
                    ))
                }
            }
        }
    }

    fn release_writer(&self, session: &Session) {
        if let dashmap::mapref::entry::Entry::Occupied(mut slot) =
            self.writers.entry(session.library.clone())
        {
            if slot.get().session == session.id {
                slot.get_mut().count -= 1;
                if slot.get().count == 0 {
                    slot.remove();
                }
            }
        }
    }

    fn release_entry(&self, library: &LibraryId, path: &PathBuf, holder: SessionId) {
        if let dashmap::mapref::entry::Entry::Occupied(mut slot) =
            self.locks.entry((library.clone(), path.clone()))
        {
            let entry = slot.get_mut();
            if let Some(pos) = entry.holders.iter().position(|h| *h == holder) {
                entry.holders.remove(pos);
            }
            if entry.holders.is_empty() {
                slot.remove();
            }
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn registry() -> SessionRegistry {
        SessionRegistry::new()
    }

    fn session(reg: &SessionRegistry, library: &str) -> Arc<Session> {
        reg.create(
            ClientId::from_fingerprint("c".repeat(64)),
            LibraryId::new(library),
            "127.0.0.1:4000".parse().unwrap(),
            CancellationToken::new(),
        )
    }

    #[test]
    fn exclusive_lock_excludes_second_writer() {
        let reg = registry();
        let s1 = session(&reg, "lib");
        let s2 = session(&reg, "lib");
        let path = PathBuf::from("/lib/a.bin");

        reg.acquire(&s1, path.clone(), LockMode::ExclusiveWrite, false)
            .unwrap();
        let err = reg
            .acquire(&s2, path.clone(), LockMode::ExclusiveWrite, false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Locked);

        // After release the second session succeeds.
        reg.release(&s1, &path);
        reg.acquire(&s2, path, LockMode::ExclusiveWrite, false).unwrap();
    }

    #[test]
    fn shared_locks_coexist() {
        let reg = registry();
        let s1 = session(&reg, "lib");
        let s2 = session(&reg, "lib");
        let path = PathBuf::from("/lib/a.bin");

        reg.acquire(&s1, path.clone(), LockMode::SharedRead, false).unwrap();
        reg.acquire(&s2, path.clone(), LockMode::SharedRead, false).unwrap();

        // A writer is excluded while readers hold the path.
        let s3 = session(&reg, "lib");
        let err = reg
            .acquire(&s3, path.clone(), LockMode::ExclusiveWrite, false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Locked);

        reg.release(&s1, &path);
        reg.release(&s2, &path);
        reg.acquire(&s3, path, LockMode::ExclusiveWrite, false).unwrap();
    }

    #[test]
    fn shared_is_excluded_by_exclusive() {
        let reg = registry();
        let s1 = session(&reg, "lib");
        let s2 = session(&reg, "lib");
        let path = PathBuf::from("/lib/a.bin");

        reg.acquire(&s1, path.clone(), LockMode::ExclusiveWrite, false)
            .unwrap();
        let err = reg
            .acquire(&s2, path, LockMode::SharedRead, false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Locked);
    }

    #[test]
    fn library_write_mutex_serializes_writers_across_paths() {
        let reg = registry();
        let s1 = session(&reg, "lib");
        let s2 = session(&reg, "lib");

        reg.acquire(&s1, PathBuf::from("/lib/a"), LockMode::ExclusiveWrite, true)
            .unwrap();
        // Different path, same library: still locked out.
        let err = reg
            .acquire(&s2, PathBuf::from("/lib/b"), LockMode::ExclusiveWrite, true)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Locked);

        // Same session may take more write locks.
        reg.acquire(&s1, PathBuf::from("/lib/c"), LockMode::ExclusiveWrite, true)
            .unwrap();

        // Releasing every write lock frees the slot.
        reg.release(&s1, &PathBuf::from("/lib/a"));
        reg.release(&s1, &PathBuf::from("/lib/c"));
        reg.acquire(&s2, PathBuf::from("/lib/b"), LockMode::ExclusiveWrite, true)
            .unwrap();
    }

    #[test]
    fn close_releases_locks_and_reports_staging() {
        let reg = registry();
        let s1 = session(&reg, "lib");
        let path = PathBuf::from("/lib/a.bin");

        reg.acquire(&s1, path.clone(), LockMode::ExclusiveWrite, true)
            .unwrap();
        s1.begin_upload(
            path.clone(),
            UploadState {
                staging: PathBuf::from("/lib/a.bin.partial"),
                total_size: 100,
                expected_digest: "d".repeat(64),
                committed: 10,
                started: Instant::now(),
            },
        );

        let report = reg.close(&s1.id);
        assert_eq!(report.staging_files, vec![PathBuf::from("/lib/a.bin.partial")]);
        assert!(reg.is_empty());
        assert!(!reg.is_locked(&LibraryId::new("lib"), &path));
        assert!(s1.cancel.is_cancelled());

        // The path is free for a new session.
        let s2 = session(&reg, "lib");
        reg.acquire(&s2, path, LockMode::ExclusiveWrite, true).unwrap();
    }

    #[test]
    fn idle_scan_selects_only_stale_sessions() {
        let reg = registry();
        let s1 = session(&reg, "lib");
        let _s2 = session(&reg, "lib");

        // Backdate s1's activity.
        *s1.last_activity.lock().unwrap() = Instant::now() - Duration::from_secs(600);

        let idle = reg.idle_sessions(|_| Duration::from_secs(300));
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].id, s1.id);
    }

    #[test]
    fn upload_state_tracks_progress() {
        let reg = registry();
        let s = session(&reg, "lib");
        let path = PathBuf::from("/lib/f");

        s.begin_upload(
            path.clone(),
            UploadState {
                staging: PathBuf::from("/lib/f.partial"),
                total_size: 1000,
                expected_digest: "e".repeat(64),
                committed: 0,
                started: Instant::now(),
            },
        );
        s.advance_upload(&path, 512);
        assert_eq!(s.upload(&path).unwrap().committed, 512);

        let state = s.finish_upload(&path).unwrap();
        assert_eq!(state.committed, 512);
        assert!(s.upload(&path).is_none());
    }

    #[test]
    fn close_all_empties_registry() {
        let reg = registry();
        session(&reg, "lib");
        session(&reg, "lib");
        let reports = reg.close_all();
        assert_eq!(reports.len(), 2);
        assert!(reg.is_empty());
    }
}
