//! Mutually authenticated TLS transport.

use async_trait::async_trait;
use harbor_types::frame::{self, Frame};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use std::io::BufReader as StdBufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::transport::Transport;

/// Frame transport over TLS with client authentication.
pub struct TlsTransport {
    reader: BufReader<ReadHalf<TlsStream<TcpStream>>>,
    writer: BufWriter<WriteHalf<TlsStream<TcpStream>>>,
}

impl TlsTransport {
    /// Open a TCP connection, complete the mutual TLS handshake, and
    /// return the connected transport.
    pub async fn connect(config: &ClientConfig) -> ClientResult<Self> {
        let tls_config = build_tls_config(config)?;
        let connector = TlsConnector::from(Arc::new(tls_config));

        let addr = format!("{}:{}", config.server.host, config.server.port);
        let connect_timeout = Duration::from_secs(config.transfer.connect_timeout_secs);
        let tcp = timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ClientError::ConnectTimeout)??;

        let server_name = ServerName::try_from(config.server_name().to_string())
            .map_err(|e| ClientError::Config(format!("invalid server name: {e}")))?;

        let stream = timeout(connect_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| ClientError::ConnectTimeout)??;

        debug!(%addr, "TLS connection established");

        let (reader, writer) = tokio::io::split(stream);
        Ok(Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
        })
    }
}

#[async_trait]
impl Transport for TlsTransport {
    async fn send(&mut self, frame: &Frame) -> ClientResult<()> {
        frame::write_frame(&mut self.writer, frame).await?;
        Ok(())
    }

    async fn recv(&mut self) -> ClientResult<Frame> {
        Ok(frame::read_frame(&mut self.reader).await?)
    }

    async fn close(&mut self) -> ClientResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

fn build_tls_config(config: &ClientConfig) -> ClientResult<rustls::ClientConfig> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(&config.server.ca_certificate)? {
        roots
            .add(cert)
            .map_err(|e| ClientError::Config(format!("bad CA certificate: {e}")))?;
    }

    let certs = load_certs(&config.identity.certificate)?;
    let key = load_private_key(&config.identity.private_key)?;

    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| ClientError::Config(format!("client certificate: {e}")))
}

fn load_certs(path: &Path) -> ClientResult<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| ClientError::Config(format!("cannot open {}: {e}", path.display())))?;
    let mut reader = StdBufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::Config(format!("cannot parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(ClientError::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> ClientResult<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .map_err(|e| ClientError::Config(format!("cannot open {}: {e}", path.display())))?;
    let mut reader = StdBufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ClientError::Config(format!("cannot parse {}: {e}", path.display())))?
        .ok_or_else(|| ClientError::Config(format!("no private key in {}", path.display())))
}
