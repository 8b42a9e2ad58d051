//! Transport abstraction.
//!
//! The transfer engine is written against the [`Transport`] trait so the
//! same code drives the real mTLS connection and the in-memory mock used
//! in tests. A transport moves whole frames; framing and integrity live
//! in `harbor_types::frame`.

mod mock;
mod tls;

pub use mock::MockTransport;
pub use tls::TlsTransport;

use async_trait::async_trait;
use harbor_types::Frame;

use crate::error::ClientResult;

/// A connected, frame-oriented transport.
#[async_trait]
pub trait Transport: Send {
    /// Send one frame.
    async fn send(&mut self, frame: &Frame) -> ClientResult<()>;

    /// Receive the next frame.
    async fn recv(&mut self) -> ClientResult<Frame>;

    /// Close the transport gracefully.
    async fn close(&mut self) -> ClientResult<()>;
}
