//! File management commands.

use anyhow::{Context, Result};
use std::path::PathBuf;

use harbor_client::Harbor;
use harbor_types::message::EntryKind;

pub async fn list(config: &PathBuf, remote: &str, recursive: bool) -> Result<()> {
    let mut client = connect(config).await?;
    let entries = client.list(remote, recursive).await?;
    for entry in &entries {
        let marker = match entry.kind {
            EntryKind::Dir => "d",
            EntryKind::File => "-",
        };
        println!("{marker} {:>12}  {}", entry.size, entry.path);
    }
    println!("{} entries", entries.len());
    finish(client).await
}

pub async fn stat(config: &PathBuf, remote: &str) -> Result<()> {
    let mut client = connect(config).await?;
    let entry = client.stat(remote).await?;
    println!("path:   {}", entry.path);
    println!("size:   {}", entry.size);
    println!("mtime:  {}", entry.mtime);
    if let Some(digest) = &entry.digest {
        println!("sha256: {digest}");
    }
    finish(client).await
}

pub async fn exists(config: &PathBuf, remote: &str) -> Result<()> {
    let mut client = connect(config).await?;
    let exists = client.exists(remote).await?;
    println!("{exists}");
    finish(client).await
}

pub async fn remove(config: &PathBuf, remote: &str) -> Result<()> {
    let mut client = connect(config).await?;
    client.delete(remote).await?;
    println!("deleted {remote}");
    finish(client).await
}

pub async fn mkdir(config: &PathBuf, remote: &str) -> Result<()> {
    let mut client = connect(config).await?;
    client.mkdir(remote).await?;
    println!("created {remote}");
    finish(client).await
}

pub async fn ping(config: &PathBuf) -> Result<()> {
    let mut client = connect(config).await?;
    client.ping().await?;
    println!("ok");
    finish(client).await
}

async fn connect(
    config: &PathBuf,
) -> Result<harbor_client::HarborClient<harbor_client::TlsTransport>> {
    let harbor = Harbor::new(crate::client_config(config)?);
    harbor.connect().await.context("connection failed")
}

async fn finish(
    mut client: harbor_client::HarborClient<harbor_client::TlsTransport>,
) -> Result<()> {
    let _ = client.disconnect().await;
    Ok(())
}
