//! Upload and download commands with a console progress bar.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use harbor_client::{Harbor, ProgressCallback, ProgressEvent};

pub async fn upload(config: &PathBuf, local: &Path, remote: &str) -> Result<()> {
    let harbor = Harbor::new(crate::client_config(config)?);
    let bar = progress_bar();

    harbor
        .upload(local, remote, Some(bar_callback(&bar)))
        .await
        .with_context(|| format!("upload of {} failed", local.display()))?;

    bar.finish_with_message("uploaded");
    println!("{} -> {}", local.display(), remote);
    Ok(())
}

pub async fn download(config: &PathBuf, remote: &str, local: &Path) -> Result<()> {
    let harbor = Harbor::new(crate::client_config(config)?);
    let bar = progress_bar();

    harbor
        .download(remote, local, Some(bar_callback(&bar)))
        .await
        .with_context(|| format!("download of {remote} failed"))?;

    bar.finish_with_message("downloaded");
    println!("{} -> {}", remote, local.display());
    Ok(())
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .expect("static template")
            .progress_chars("#>-"),
    );
    bar
}

fn bar_callback(bar: &ProgressBar) -> ProgressCallback {
    let bar = bar.clone();
    Arc::new(move |event: ProgressEvent| {
        bar.set_length(event.total_bytes);
        bar.set_position(event.bytes_done);
    })
}
