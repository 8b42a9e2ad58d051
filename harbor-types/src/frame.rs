//! Wire framing for the FileHarbor protocol.
//!
//! A frame is a fixed 80-byte header, followed by a JSON payload of
//! `payload_len` bytes, followed by a binary body of `body_len` bytes.
//! The header carries a SHA-256 digest over `payload || body`; receivers
//! recompute and compare it before acting on the frame. Any mismatch is a
//! fatal protocol error for the connection.
//!
//! Header layout (big-endian, 80 bytes):
//!
//! ```text
//! +-------+---------+------+------+-----------+--------+-------+-------------+----------+--------+------+
//! | magic | version | kind | rsvd | command   | status | flags | payload_len | body_len | digest | rsvd |
//! |   4   |    2    |  1   |  1   |    24     |   2    |   2   |      4      |    4     |   32   |  4   |
//! +-------+---------+------+------+-----------+--------+-------+-------------+----------+--------+------+
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::status::StatusCode;

/// Protocol version negotiated at handshake.
pub const PROTOCOL_VERSION: u16 = 1;

/// Magic bytes identifying a FileHarbor frame.
pub const FRAME_MAGIC: &[u8; 4] = b"FHBR";

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 80;

/// Width of the NUL-padded command field.
pub const COMMAND_FIELD_LEN: usize = 24;

/// Maximum JSON payload size (64 KiB).
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;

/// Maximum binary body size (one chunk, 16 MiB).
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

/// Framing errors.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid frame magic")]
    BadMagic,

    #[error("unknown frame kind: {0}")]
    UnknownKind(u8),

    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("body too large: {len} bytes (max {max})")]
    BodyTooLarge { len: usize, max: usize },

    #[error("frame digest mismatch")]
    DigestMismatch,

    #[error("command field is not valid ASCII")]
    BadCommand,

    #[error("payload encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Message kind carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
    Data,
}

impl FrameKind {
    fn as_u8(self) -> u8 {
        match self {
            Self::Request => 0,
            Self::Response => 1,
            Self::Data => 2,
        }
    }

    fn from_u8(v: u8) -> Result<Self, FrameError> {
        match v {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            2 => Ok(Self::Data),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

/// Fixed-size frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u16,
    pub kind: FrameKind,
    pub command: String,
    pub status: u16,
    pub flags: u16,
    pub payload_len: u32,
    pub body_len: u32,
    pub digest: [u8; 32],
}

impl FrameHeader {
    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(FRAME_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_be_bytes());
        buf[6] = self.kind.as_u8();
        // buf[7] reserved
        let cmd = self.command.as_bytes();
        let n = cmd.len().min(COMMAND_FIELD_LEN);
        buf[8..8 + n].copy_from_slice(&cmd[..n]);
        buf[32..34].copy_from_slice(&self.status.to_be_bytes());
        buf[34..36].copy_from_slice(&self.flags.to_be_bytes());
        buf[36..40].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[40..44].copy_from_slice(&self.body_len.to_be_bytes());
        buf[44..76].copy_from_slice(&self.digest);
        // buf[76..80] reserved
        buf
    }

    fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self, FrameError> {
        if &buf[0..4] != FRAME_MAGIC {
            return Err(FrameError::BadMagic);
        }
        let version = u16::from_be_bytes([buf[4], buf[5]]);
        let kind = FrameKind::from_u8(buf[6])?;
        let raw_cmd = &buf[8..8 + COMMAND_FIELD_LEN];
        let end = raw_cmd.iter().position(|&b| b == 0).unwrap_or(COMMAND_FIELD_LEN);
        let command = std::str::from_utf8(&raw_cmd[..end])
            .map_err(|_| FrameError::BadCommand)?
            .to_string();
        let status = u16::from_be_bytes([buf[32], buf[33]]);
        let flags = u16::from_be_bytes([buf[34], buf[35]]);
        let payload_len = u32::from_be_bytes([buf[36], buf[37], buf[38], buf[39]]);
        let body_len = u32::from_be_bytes([buf[40], buf[41], buf[42], buf[43]]);
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&buf[44..76]);
        Ok(Self {
            version,
            kind,
            command,
            status,
            flags,
            payload_len,
            body_len,
            digest,
        })
    }
}

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
    pub body: Vec<u8>,
}

impl Frame {
    /// Build a request frame from a serializable payload.
    pub fn request<T: Serialize>(
        command: &str,
        payload: &T,
        body: Vec<u8>,
    ) -> Result<Self, FrameError> {
        Self::build(FrameKind::Request, command, StatusCode::Ok, payload, body)
    }

    /// Build a response frame.
    pub fn response<T: Serialize>(
        command: &str,
        status: StatusCode,
        payload: &T,
        body: Vec<u8>,
    ) -> Result<Self, FrameError> {
        Self::build(FrameKind::Response, command, status, payload, body)
    }

    fn build<T: Serialize>(
        kind: FrameKind,
        command: &str,
        status: StatusCode,
        payload: &T,
        body: Vec<u8>,
    ) -> Result<Self, FrameError> {
        let payload = serde_json::to_vec(payload)?;
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        if body.len() > MAX_BODY_LEN {
            return Err(FrameError::BodyTooLarge {
                len: body.len(),
                max: MAX_BODY_LEN,
            });
        }
        let digest = content_digest(&payload, &body);
        Ok(Self {
            header: FrameHeader {
                version: PROTOCOL_VERSION,
                kind,
                command: command.to_string(),
                status: status.as_u16(),
                flags: 0,
                payload_len: payload.len() as u32,
                body_len: body.len() as u32,
                digest,
            },
            payload,
            body,
        })
    }

    /// Deserialize the JSON payload into a typed value.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// The status code from the header, if it is a known code.
    pub fn status(&self) -> Option<StatusCode> {
        StatusCode::from_u16(self.header.status)
    }
}

/// SHA-256 over `payload || body`.
pub fn content_digest(payload: &[u8], body: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(body);
    hasher.finalize().into()
}

/// Write a frame to the stream and flush it.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.header.encode()).await?;
    writer.write_all(&frame.payload).await?;
    if !frame.body.is_empty() {
        writer.write_all(&frame.body).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Read and validate a frame header.
///
/// Size limits are enforced here, before any payload allocation. Callers
/// that need to apply a read timeout to the variable-length remainder
/// (but not to the idle wait for the next command) read the header and
/// the rest separately.
pub async fn read_header<R>(reader: &mut R) -> Result<FrameHeader, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut header_buf).await?;
    let header = FrameHeader::decode(&header_buf)?;

    let payload_len = header.payload_len as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge {
            len: payload_len,
            max: MAX_PAYLOAD_LEN,
        });
    }
    let body_len = header.body_len as usize;
    if body_len > MAX_BODY_LEN {
        return Err(FrameError::BodyTooLarge {
            len: body_len,
            max: MAX_BODY_LEN,
        });
    }
    Ok(header)
}

/// Read the payload and body for a previously read header and verify the
/// digest.
pub async fn read_rest<R>(reader: &mut R, header: FrameHeader) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut payload = vec![0u8; header.payload_len as usize];
    reader.read_exact(&mut payload).await?;
    let mut body = vec![0u8; header.body_len as usize];
    if !body.is_empty() {
        reader.read_exact(&mut body).await?;
    }

    if content_digest(&payload, &body) != header.digest {
        return Err(FrameError::DigestMismatch);
    }

    Ok(Frame {
        header,
        payload,
        body,
    })
}

/// Read a complete frame, verifying size limits and the digest.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let header = read_header(reader).await?;
    read_rest(reader, header).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        name: String,
        size: u64,
    }

    fn probe() -> Probe {
        Probe {
            name: "hello.txt".into(),
            size: 18,
        }
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let frame = Frame::request("PUT_START", &probe(), vec![1, 2, 3]).unwrap();
        let mut wire = Vec::new();
        write_frame(&mut wire, &frame).await.unwrap();

        let mut cursor = wire.as_slice();
        let decoded = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.parse_payload::<Probe>().unwrap(), probe());
        assert_eq!(decoded.body, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn empty_payload_and_body() {
        let frame = Frame::request("PING", &serde_json::json!({}), Vec::new()).unwrap();
        let mut wire = Vec::new();
        write_frame(&mut wire, &frame).await.unwrap();

        let mut cursor = wire.as_slice();
        let decoded = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded.header.command, "PING");
        assert!(decoded.body.is_empty());
    }

    #[tokio::test]
    async fn corrupted_body_fails_digest_check() {
        let frame = Frame::request("PUT_CHUNK", &probe(), vec![0u8; 64]).unwrap();
        let mut wire = Vec::new();
        write_frame(&mut wire, &frame).await.unwrap();

        // Flip one bit in the body region.
        let last = wire.len() - 1;
        wire[last] ^= 0x01;

        let mut cursor = wire.as_slice();
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::DigestMismatch));
    }

    #[tokio::test]
    async fn bad_magic_is_rejected() {
        let frame = Frame::request("PING", &serde_json::json!({}), Vec::new()).unwrap();
        let mut wire = Vec::new();
        write_frame(&mut wire, &frame).await.unwrap();
        wire[0] = b'X';

        let mut cursor = wire.as_slice();
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::BadMagic));
    }

    #[tokio::test]
    async fn oversize_body_is_rejected_at_build() {
        let err = Frame::request("PUT_CHUNK", &probe(), vec![0u8; MAX_BODY_LEN + 1]).unwrap_err();
        assert!(matches!(err, FrameError::BodyTooLarge { .. }));
    }

    #[tokio::test]
    async fn oversize_header_lengths_are_rejected_before_read() {
        let frame = Frame::request("PING", &serde_json::json!({}), Vec::new()).unwrap();
        let mut wire = Vec::new();
        write_frame(&mut wire, &frame).await.unwrap();
        // Claim a payload larger than the limit.
        let huge = (MAX_PAYLOAD_LEN as u32 + 1).to_be_bytes();
        wire[36..40].copy_from_slice(&huge);

        let mut cursor = wire.as_slice();
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
    }

    #[test]
    fn header_is_exactly_80_bytes() {
        let frame = Frame::response(
            "STAT",
            StatusCode::NotFound,
            &serde_json::json!({"error": "missing"}),
            Vec::new(),
        )
        .unwrap();
        assert_eq!(frame.header.encode().len(), HEADER_LEN);
        assert_eq!(frame.header.status, 404);
    }

    #[test]
    fn status_roundtrips_through_header() {
        let frame = Frame::response(
            "PUT_START",
            StatusCode::Locked,
            &serde_json::json!({}),
            Vec::new(),
        )
        .unwrap();
        assert_eq!(frame.status(), Some(StatusCode::Locked));
    }
}
