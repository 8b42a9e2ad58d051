//! # harbor
//!
//! FileHarbor command-line interface.
//!
//! ## Commands
//!
//! - `serve`: run the server
//! - `upload` / `download`: resumable transfers
//! - `ls`, `stat`, `exists`, `rm`, `mkdir`, `ping`: file management
//!
//! ## Example
//!
//! ```bash
//! # Run the server
//! harbor serve /etc/harbor/harbor.toml
//!
//! # Upload and fetch back a file
//! harbor --config client.toml upload hello.txt hello.txt
//! harbor --config client.toml download hello.txt copy.txt
//! harbor --config client.toml ls /
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

use commands::{files, serve, transfer};

/// Secure file transfer over mutually authenticated TLS.
#[derive(Parser, Debug)]
#[command(name = "harbor")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Client configuration file (ignored by `serve`)
    #[arg(long, short, global = true, default_value = "harbor-client.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the server
    Serve {
        /// Server configuration file
        config: PathBuf,
    },

    /// Upload a local file to the library
    Upload {
        /// Local file
        local: PathBuf,
        /// Destination path inside the library
        remote: String,
    },

    /// Download a file from the library
    Download {
        /// Source path inside the library
        remote: String,
        /// Local destination file
        local: PathBuf,
    },

    /// List a directory
    Ls {
        /// Directory inside the library (default: root)
        #[arg(default_value = "")]
        remote: String,

        /// Recurse into subdirectories
        #[arg(long, short)]
        recursive: bool,
    },

    /// Show size, digest, and mtime of a path
    Stat { remote: String },

    /// Check whether a path exists
    Exists { remote: String },

    /// Delete a file
    Rm { remote: String },

    /// Create a directory
    Mkdir { remote: String },

    /// Check connectivity and authentication
    Ping,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => serve::run(&config).await,
        Commands::Upload { local, remote } => {
            transfer::upload(&cli.config, &local, &remote).await
        }
        Commands::Download { remote, local } => {
            transfer::download(&cli.config, &remote, &local).await
        }
        Commands::Ls { remote, recursive } => files::list(&cli.config, &remote, recursive).await,
        Commands::Stat { remote } => files::stat(&cli.config, &remote).await,
        Commands::Exists { remote } => files::exists(&cli.config, &remote).await,
        Commands::Rm { remote } => files::remove(&cli.config, &remote).await,
        Commands::Mkdir { remote } => files::mkdir(&cli.config, &remote).await,
        Commands::Ping => files::ping(&cli.config).await,
    }
}

/// Load and validate the client configuration.
pub(crate) fn client_config(path: &PathBuf) -> Result<harbor_client::ClientConfig> {
    harbor_client::ClientConfig::from_file(path)
        .with_context(|| format!("failed to load client config {}", path.display()))
}
