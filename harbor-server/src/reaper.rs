//! Background reaper for idle sessions.
//!
//! Scans the registry on an interval; any session whose idle time
//! exceeds its library's timeout is terminated: its in-flight operation
//! is cancelled, staging files are deleted, locks released, and the
//! connection task observes the cancellation and closes the transport.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::library::LibraryManager;
use crate::registry::SessionRegistry;

/// Spawn the reaper task. It runs until `shutdown` fires.
pub fn spawn_reaper(
    registry: Arc<SessionRegistry>,
    libraries: Arc<LibraryManager>,
    interval_secs: u64,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = interval(Duration::from_secs(interval_secs.max(1)));
        info!(interval_secs, "idle reaper started");

        loop {
            tokio::select! {
                _ = timer.tick() => {}
                _ = shutdown.cancelled() => {
                    debug!("idle reaper stopping");
                    return;
                }
            }

            let idle = registry.idle_sessions(|library_id| {
                libraries
                    .lookup(library_id)
                    .map(|lib| lib.idle_timeout)
                    .unwrap_or(Duration::from_secs(300))
            });

            for session in idle {
                info!(
                    session = %session.id,
                    client = %session.client,
                    idle = ?session.idle_for(),
                    "reaping idle session"
                );
                let report = registry.close(&session.id);
                for staging in report.staging_files {
                    if let Err(e) = tokio::fs::remove_file(&staging).await {
                        warn!(path = %staging.display(), error = %e, "failed to delete staging file");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LibraryConfig, NetworkConfig, SecurityConfig, ServerConfig};
    use harbor_types::{ClientId, LibraryId};
    use std::collections::HashMap;

    fn manager_with_timeout(root: std::path::PathBuf, idle_secs: u64) -> LibraryManager {
        let config = ServerConfig {
            network: NetworkConfig {
                host: "127.0.0.1".into(),
                port: 8443,
                max_connections: 10,
                idle_timeout_secs: idle_secs,
                read_timeout_secs: 60,
                chunk_size: 65536,
            },
            security: SecurityConfig {
                ca_certificate: "/ca.pem".into(),
                server_certificate: "/s.pem".into(),
                server_private_key: "/s.key".into(),
                crl: vec![],
            },
            libraries: HashMap::from([(
                "lib".to_string(),
                LibraryConfig {
                    name: "Lib".into(),
                    root,
                    authorized_clients: vec![],
                    rate_cap: 0,
                    idle_timeout_secs: None,
                    exclusive_writer: true,
                },
            )]),
            clients: vec![],
            limits: Default::default(),
        };
        LibraryManager::from_config(&config).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_removes_idle_session_and_staging() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("up.bin.partial");
        std::fs::write(&staging, b"partial").unwrap();

        // Zero idle timeout: any session with positive idle time is stale.
        let registry = Arc::new(SessionRegistry::new());
        let libraries = Arc::new(manager_with_timeout(dir.path().into(), 0));

        let session = registry.create(
            ClientId::from_fingerprint("a".repeat(64)),
            LibraryId::new("lib"),
            "127.0.0.1:5000".parse().unwrap(),
            CancellationToken::new(),
        );
        session.begin_upload(
            dir.path().join("up.bin"),
            crate::registry::UploadState {
                staging: staging.clone(),
                total_size: 100,
                expected_digest: "d".repeat(64),
                committed: 7,
                started: std::time::Instant::now(),
            },
        );

        let shutdown = CancellationToken::new();
        let handle = spawn_reaper(registry.clone(), libraries, 1, shutdown.clone());

        // The session idles past its timeout; the paused clock advances
        // through several reaper ticks.
        tokio::time::sleep(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert!(registry.is_empty(), "idle session should be reaped");
        assert!(session.cancel.is_cancelled());

        shutdown.cancel();
        handle.await.unwrap();
        assert!(!staging.exists(), "staging file should be deleted");
    }

    #[tokio::test(start_paused = true)]
    async fn active_session_survives_the_reaper() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let libraries = Arc::new(manager_with_timeout(dir.path().into(), 3600));

        let session = registry.create(
            ClientId::from_fingerprint("b".repeat(64)),
            LibraryId::new("lib"),
            "127.0.0.1:5001".parse().unwrap(),
            CancellationToken::new(),
        );

        let shutdown = CancellationToken::new();
        let handle = spawn_reaper(registry.clone(), libraries, 1, shutdown.clone());

        tokio::time::sleep(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;

        assert_eq!(registry.len(), 1);
        assert!(!session.cancel.is_cancelled());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
