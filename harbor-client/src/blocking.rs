//! Blocking facade over the async client.
//!
//! Owns a small runtime and exposes the same operations synchronously;
//! the engine underneath is identical.

use harbor_types::message::EntryInfo;
use std::path::Path;

use crate::client::Harbor;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::progress::ProgressCallback;

/// Synchronous FileHarbor client.
pub struct BlockingHarbor {
    runtime: tokio::runtime::Runtime,
    inner: Harbor,
}

impl BlockingHarbor {
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ClientError::Io)?;
        Ok(Self {
            runtime,
            inner: Harbor::new(config),
        })
    }

    /// Upload with retry and resume.
    pub fn upload(
        &self,
        local: &Path,
        remote: &str,
        callback: Option<ProgressCallback>,
    ) -> ClientResult<()> {
        self.runtime.block_on(self.inner.upload(local, remote, callback))
    }

    /// Download with retry and resume.
    pub fn download(
        &self,
        remote: &str,
        local: &Path,
        callback: Option<ProgressCallback>,
    ) -> ClientResult<()> {
        self.runtime.block_on(self.inner.download(remote, local, callback))
    }

    pub fn delete(&self, remote: &str) -> ClientResult<()> {
        self.runtime.block_on(async {
            let mut client = self.inner.connect().await?;
            let result = client.delete(remote).await;
            let _ = client.disconnect().await;
            result
        })
    }

    pub fn list(&self, remote: &str, recursive: bool) -> ClientResult<Vec<EntryInfo>> {
        self.runtime.block_on(async {
            let mut client = self.inner.connect().await?;
            let result = client.list(remote, recursive).await;
            let _ = client.disconnect().await;
            result
        })
    }

    pub fn exists(&self, remote: &str) -> ClientResult<bool> {
        self.runtime.block_on(async {
            let mut client = self.inner.connect().await?;
            let result = client.exists(remote).await;
            let _ = client.disconnect().await;
            result
        })
    }

    pub fn stat(&self, remote: &str) -> ClientResult<EntryInfo> {
        self.runtime.block_on(async {
            let mut client = self.inner.connect().await?;
            let result = client.stat(remote).await;
            let _ = client.disconnect().await;
            result
        })
    }
}
