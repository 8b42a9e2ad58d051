//! Server runtime: TLS accept loop, worker spawning, graceful shutdown.

use rustls::pki_types::CertificateDer;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::connection::ConnectionHandler;
use crate::error::ServerResult;
use crate::library::LibraryManager;
use crate::limits::{HandshakeLimits, ThrottleMap};
use crate::reaper::spawn_reaper;
use crate::registry::SessionRegistry;
use crate::tls;

/// How long a peer gets to complete the TLS handshake.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Operational counters, monotonically increasing until restart.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    pub connections_total: AtomicU64,
    pub sessions_total: AtomicU64,
    pub commands_total: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub auth_failures: AtomicU64,
    pub rate_limit_hits: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Immutable-after-startup state shared by every connection task.
pub struct SharedState {
    pub config: Arc<ServerConfig>,
    pub auth: Authenticator,
    pub libraries: Arc<LibraryManager>,
    pub registry: Arc<SessionRegistry>,
    pub throttles: ThrottleMap,
    pub handshake_limits: HandshakeLimits,
    pub metrics: ServerMetrics,
    pub shutdown: CancellationToken,
}

/// The FileHarbor server.
pub struct HarborServer {
    shared: Arc<SharedState>,
    tls: Arc<rustls::ServerConfig>,
}

impl HarborServer {
    /// Assemble the server from a validated configuration.
    ///
    /// Fails fast on a bad CA, unparseable client certificates, or a
    /// missing library root.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        let tls = tls::server_tls_config(&config.security)?;
        let auth = Authenticator::from_config(&config)?;
        let libraries = Arc::new(LibraryManager::from_config(&config)?);
        let handshake_limits = HandshakeLimits::new(&config.limits);

        info!(
            libraries = libraries.len(),
            clients = auth.client_count(),
            "server assembled"
        );

        Ok(Self {
            shared: Arc::new(SharedState {
                config: Arc::new(config),
                auth,
                libraries,
                registry: Arc::new(SessionRegistry::new()),
                throttles: ThrottleMap::new(),
                handshake_limits,
                metrics: ServerMetrics::default(),
                shutdown: CancellationToken::new(),
            }),
            tls,
        })
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// Shared state, exposed for inspection in tests.
    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> ServerResult<()> {
        let addr = format!(
            "{}:{}",
            self.shared.config.network.host, self.shared.config.network.port
        );
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "listening");
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    ///
    /// Separated from [`run`] so tests can bind an ephemeral port first.
    pub async fn serve(&self, listener: TcpListener) -> ServerResult<()> {
        let acceptor = TlsAcceptor::from(self.tls.clone());
        let semaphore = Arc::new(Semaphore::new(self.shared.config.network.max_connections));

        let reaper = spawn_reaper(
            self.shared.registry.clone(),
            self.shared.libraries.clone(),
            self.shared.config.limits.reaper_interval_secs,
            self.shared.shutdown.clone(),
        );

        loop {
            let (tcp, peer) = tokio::select! {
                _ = self.shared.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(%peer, "connection limit reached, rejecting");
                    continue;
                }
            };
            self.shared
                .metrics
                .connections_total
                .fetch_add(1, Ordering::Relaxed);

            let acceptor = acceptor.clone();
            let shared = self.shared.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let stream = match timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        warn!(%peer, error = %e, "TLS handshake failed");
                        return;
                    }
                    Err(_) => {
                        warn!(%peer, "TLS handshake timed out");
                        return;
                    }
                };

                let Some(peer_cert) = peer_certificate(&stream) else {
                    // Unreachable with a required-client-auth verifier.
                    warn!(%peer, "no client certificate after handshake");
                    return;
                };

                debug!(%peer, "TLS established");
                ConnectionHandler::new(stream, peer, peer_cert, shared).run().await;
            });
        }

        // Staging files survive shutdown so interrupted uploads resume
        // after a restart; only the idle reaper deletes them.
        info!("shutting down: terminating sessions");
        let _ = self.shared.registry.close_all();
        reaper.await.ok();

        let metrics = &self.shared.metrics;
        info!(
            connections = metrics.connections_total.load(Ordering::Relaxed),
            sessions = metrics.sessions_total.load(Ordering::Relaxed),
            commands = metrics.commands_total.load(Ordering::Relaxed),
            bytes_in = metrics.bytes_in.load(Ordering::Relaxed),
            bytes_out = metrics.bytes_out.load(Ordering::Relaxed),
            errors = metrics.errors_total.load(Ordering::Relaxed),
            "server stopped"
        );
        Ok(())
    }

    /// Serve until a termination signal arrives, then shut down cleanly.
    pub async fn run_until_signalled(&self) -> ServerResult<()> {
        let shutdown = self.shutdown_token();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("termination signal received");
            shutdown.cancel();
        });
        self.run().await
    }
}

fn peer_certificate(
    stream: &tokio_rustls::server::TlsStream<tokio::net::TcpStream>,
) -> Option<CertificateDer<'static>> {
    let (_, connection) = stream.get_ref();
    connection.peer_certificates()?.first().cloned()
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
