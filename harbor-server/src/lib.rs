//! # harbor-server
//!
//! The FileHarbor server: a long-running service exposing a set of
//! libraries (named, path-rooted storage areas) over mutually
//! authenticated TLS. Clients upload, download, enumerate, and manage
//! files within the libraries they are authorized for; transfers are
//! chunked, integrity-verified, and resumable.
//!
//! Module map:
//!
//! - [`config`]: the validated configuration document
//! - [`tls`]: rustls acceptor with mandatory client certificates
//! - [`auth`]: certificate fingerprinting, CRL, client lookup
//! - [`library`]: the read-only library set and authorization
//! - [`resolver`]: path resolution under a library root
//! - [`registry`]: sessions, file locks, in-flight transfer state
//! - [`reaper`]: idle-session termination
//! - [`limits`]: handshake flood control and bandwidth throttling
//! - [`fsops`]: the primitive file operations
//! - [`connection`]: the per-connection state machine
//! - [`server`]: TCP/TLS accept loop and graceful shutdown

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod fsops;
pub mod library;
pub mod limits;
pub mod reaper;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod tls;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use server::HarborServer;
