//! Wire protocol for streamed queries between clients and coordinators.
//!
//! One request per TCP connection. The caller sends a single
//! `FramedMessage<Request>`; the callee answers `Request::Query` with zero or
//! more `Response::Line` frames followed by exactly one terminal frame,
//! `Response::Done` or `Response::Error`. A line too long for one frame is
//! sent as `Response::LinePart` pieces closed by a `Response::Line`.
//!
//! The caller keeps its write side open until the stream ends. The callee
//! treats end-of-file from the caller as a disconnect and cancels the query.
//!
//! Every frame is a 4-byte big-endian length followed by a MessagePack body.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::search::Query;

/// Protocol version. Peers must agree on it.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest frame body accepted from the wire.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Largest piece of a line carried by one frame.
pub const MAX_LINE_CHUNK: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Search for a pattern; answered by a stream of lines.
    Query(Query),

    /// Liveness and identity check.
    Health,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// One matched line, or the last piece of a split one.
    Line(String),

    /// A leading piece of a line longer than [`MAX_LINE_CHUNK`].
    LinePart(String),

    /// Successful end of a query stream.
    Done { lines: u64 },

    /// Failed end of a query stream, or a rejected request.
    Error(ErrorResponse),

    /// Answer to `Request::Health`.
    Health(HealthStatus),
}

impl Response {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Response::Line(_) | Response::LinePart(_))
    }

    /// Frames carrying `line`: a single `Line`, or `LinePart` pieces of at
    /// most [`MAX_LINE_CHUNK`] bytes closed by a `Line`.
    pub fn line_frames(line: String) -> Vec<Response> {
        split_line(line, MAX_LINE_CHUNK)
    }
}

fn split_line(line: String, chunk: usize) -> Vec<Response> {
    if line.len() <= chunk {
        return vec![Response::Line(line)];
    }
    let mut frames = Vec::with_capacity(line.len() / chunk + 1);
    let mut rest = line.as_str();
    while rest.len() > chunk {
        // A char is at most 4 bytes, so `cut` stays above zero for chunk >= 4.
        let mut cut = chunk;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (head, tail) = rest.split_at(cut);
        frames.push(Response::LinePart(head.to_string()));
        rest = tail;
    }
    frames.push(Response::Line(rest.to_string()));
    frames
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// The server's [`PROTOCOL_VERSION`].
    pub version: u32,
    /// Configured peer endpoints.
    pub peers: Vec<String>,
    /// Directory searched by the local branch.
    pub log_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error category.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    Internal,
    /// The callee's local search failed.
    LocalSearch,
    /// Undecodable or unsupported request.
    InvalidInput,
    /// Too many concurrent connections.
    Overloaded,
    VersionMismatch,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Internal => "internal",
            Self::LocalSearch => "local search",
            Self::InvalidInput => "invalid input",
            Self::Overloaded => "overloaded",
            Self::VersionMismatch => "version mismatch",
        };
        f.write_str(name)
    }
}

/// Envelope around every request and response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FramedMessage<T> {
    pub version: u32,
    /// Correlates the frames of one call in logs.
    pub request_id: String,
    pub payload: T,
}

impl<T> FramedMessage<T> {
    pub fn new(request_id: impl Into<String>, payload: T) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            request_id: request_id.into(),
            payload,
        }
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("frame of {0} bytes exceeds the limit of {max} bytes", max = MAX_FRAME_LEN)]
    FrameTooLarge(usize),
}

impl TransportError {
    /// Whether the error came from the connection rather than its contents.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Encode a message to MessagePack bytes with length prefix.
pub fn encode_message<T: Serialize>(msg: &FramedMessage<T>) -> Result<Vec<u8>, TransportError> {
    let payload = rmp_serde::to_vec(msg).map_err(|e| TransportError::Encode(e.to_string()))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(payload.len()));
    }
    let len = payload.len() as u32;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a message from MessagePack bytes (without length prefix).
pub fn decode_message<T: for<'de> Deserialize<'de>>(
    data: &[u8],
) -> Result<FramedMessage<T>, TransportError> {
    rmp_serde::from_slice(data).map_err(|e| TransportError::Decode(e.to_string()))
}

/// Write one frame.
pub async fn write_frame<W, T>(writer: &mut W, msg: &FramedMessage<T>) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let encoded = encode_message(msg)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` on a clean end of stream before any header byte.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<FramedMessage<T>>, TransportError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    decode_message(&payload).map(Some)
}
