//! In-memory transport for tests.

use async_trait::async_trait;
use harbor_types::Frame;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::{ClientError, ClientResult};
use crate::transport::Transport;

/// A scripted transport: tests queue the frames the "server" will answer
/// with, and inspect what the engine sent.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    /// Frames the next `recv` calls will return, in order.
    responses: VecDeque<Frame>,
    /// Everything the engine sent.
    sent: Vec<Frame>,
    closed: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame for a future `recv`.
    pub fn push_response(&self, frame: Frame) {
        self.inner.lock().unwrap().responses.push_back(frame);
    }

    /// Frames sent so far, oldest first.
    pub fn sent(&self) -> Vec<Frame> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// Number of frames sent.
    pub fn sent_count(&self) -> usize {
        self.inner.lock().unwrap().sent.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: &Frame) -> ClientResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(ClientError::NotConnected);
        }
        inner.sent.push(frame.clone());
        Ok(())
    }

    async fn recv(&mut self) -> ClientResult<Frame> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(ClientError::NotConnected);
        }
        inner.responses.pop_front().ok_or_else(|| {
            ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "mock transport has no more responses",
            ))
        })
    }

    async fn close(&mut self) -> ClientResult<()> {
        self.inner.lock().unwrap().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_types::{Response, StatusCode};

    #[tokio::test]
    async fn scripted_responses_come_back_in_order() {
        let mock = MockTransport::new();
        mock.push_response(
            Frame::response("PING", StatusCode::Ok, &Response::Pong, Vec::new()).unwrap(),
        );

        let mut transport = mock.clone();
        let frame = Frame::request("PING", &serde_json::json!({}), Vec::new()).unwrap();
        transport.send(&frame).await.unwrap();

        let reply = transport.recv().await.unwrap();
        assert_eq!(reply.header.command, "PING");
        assert_eq!(mock.sent_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_mock_reports_eof() {
        let mut transport = MockTransport::new();
        let err = transport.recv().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn closed_mock_rejects_io() {
        let mock = MockTransport::new();
        let mut transport = mock.clone();
        transport.close().await.unwrap();
        assert!(mock.is_closed());

        let frame = Frame::request("PING", &serde_json::json!({}), Vec::new()).unwrap();
        assert!(transport.send(&frame).await.is_err());
    }
}
