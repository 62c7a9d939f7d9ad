//! Length-prefixed framing for the BeamMP TCP protocol.
//!
//! Every message on the wire is a length-prefixed frame:
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   payload          |
//! | u32 little-endian |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length does **not** include the 4 prefix bytes themselves. A length of
//! 0 is a valid empty frame. Frames carry no type tag: by convention the first
//! payload byte is a command code (`'C'`, `'P'`, `'H'`, ...).

use std::borrow::Cow;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix in bytes.
pub const HEADER_SIZE: usize = 4;

/// Largest payload the decoder will accept (100 MiB).
pub const MAX_HEADER_SIZE: u32 = 100 * 1024 * 1024;

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The declared payload size exceeds [`MAX_HEADER_SIZE`].
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The declared payload size.
        size: u32,
        /// The enforced maximum.
        max: u32,
    },

    /// The peer closed the stream in the middle of a frame.
    #[error("stream ended after {buffered} bytes of an incomplete frame")]
    ShortRead {
        /// Bytes of the partial frame that had arrived.
        buffered: usize,
    },

    /// The peer closed the stream on a frame boundary.
    #[error("connection closed")]
    ConnectionClosed,

    /// A read deadline elapsed before a complete frame arrived.
    #[error("read timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single decoded (or to-be-encoded) protocol frame.
///
/// The header is always derived from the payload length, so the numeric
/// writers keep it consistent automatically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    payload: Vec<u8>,
}

impl Frame {
    /// Wrap raw payload bytes.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Build a frame from a command byte followed by a text body.
    pub fn command(code: u8, body: &str) -> Self {
        let mut payload = Vec::with_capacity(1 + body.len());
        payload.push(code);
        payload.extend_from_slice(body.as_bytes());
        Self { payload }
    }

    /// Value of the length prefix for this frame.
    pub fn header(&self) -> u32 {
        self.payload.len() as u32
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// A zero header with a zero-length payload.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// First payload byte, conventionally the command code.
    pub fn code(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// Everything after the command byte.
    pub fn body(&self) -> &[u8] {
        self.payload.get(1..).unwrap_or_default()
    }

    /// The body decoded as UTF-8, replacing invalid sequences.
    pub fn body_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.body())
    }

    /// The whole payload decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.payload.starts_with(prefix)
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.payload.extend_from_slice(bytes);
        self
    }

    pub fn write_str(&mut self, s: &str) -> &mut Self {
        self.write_bytes(s.as_bytes())
    }

    pub fn write_i8(&mut self, v: i8) -> &mut Self {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_i16(&mut self, v: i16) -> &mut Self {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_i64(&mut self, v: i64) -> &mut Self {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_f32(&mut self, v: f32) -> &mut Self {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_f64(&mut self, v: f64) -> &mut Self {
        self.write_bytes(&v.to_le_bytes())
    }

    fn array_at<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        self.payload
            .get(offset..offset.checked_add(N)?)
            .and_then(|s| s.try_into().ok())
    }

    pub fn read_i8(&self, offset: usize) -> Option<i8> {
        self.array_at(offset).map(i8::from_le_bytes)
    }

    pub fn read_i16(&self, offset: usize) -> Option<i16> {
        self.array_at(offset).map(i16::from_le_bytes)
    }

    pub fn read_i32(&self, offset: usize) -> Option<i32> {
        self.array_at(offset).map(i32::from_le_bytes)
    }

    pub fn read_i64(&self, offset: usize) -> Option<i64> {
        self.array_at(offset).map(i64::from_le_bytes)
    }

    pub fn read_f32(&self, offset: usize) -> Option<f32> {
        self.array_at(offset).map(f32::from_le_bytes)
    }

    pub fn read_f64(&self, offset: usize) -> Option<f64> {
        self.array_at(offset).map(f64::from_le_bytes)
    }

    /// Header followed by payload, ready for the wire.
    pub fn encode(&self) -> Vec<u8> {
        encode(&self.payload)
    }
}

impl From<&str> for Frame {
    fn from(s: &str) -> Self {
        Self::new(s.as_bytes())
    }
}

impl From<Vec<u8>> for Frame {
    fn from(payload: Vec<u8>) -> Self {
        Self::new(payload)
    }
}

/// Prepend the 4-byte little-endian length header to `payload`.
///
/// No size limit is enforced here; the limit only applies when decoding.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Write a single length-prefixed frame to the stream and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), FrameError> {
    writer.write_all(&encode(payload)).await?;
    writer.flush().await?;
    Ok(())
}

/// Buffered frame decoder over an async byte stream.
///
/// Bytes are accumulated across partial TCP reads. Every read method is
/// cancellation safe: a deadline that fires halfway through a frame leaves the
/// received bytes buffered for the next call.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Read one frame, waiting as long as it takes.
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(frame);
            }
            self.fill().await?;
        }
    }

    /// Read one frame, failing with [`FrameError::Timeout`] after `deadline`.
    pub async fn read_frame_timeout(&mut self, deadline: Duration) -> Result<Frame, FrameError> {
        tokio::time::timeout(deadline, self.read_frame())
            .await
            .map_err(|_| FrameError::Timeout)?
    }

    /// Read a single raw byte outside of any frame.
    ///
    /// The identification step sends its code as a bare byte.
    pub async fn read_byte(&mut self) -> Result<u8, FrameError> {
        while self.buf.is_empty() {
            self.fill().await?;
        }
        Ok(self.buf.get_u8())
    }

    /// [`read_byte`](Self::read_byte) with a deadline.
    pub async fn read_byte_timeout(&mut self, deadline: Duration) -> Result<u8, FrameError> {
        tokio::time::timeout(deadline, self.read_byte())
            .await
            .map_err(|_| FrameError::Timeout)?
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    async fn fill(&mut self) -> Result<(), FrameError> {
        let n = self.inner.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(if self.buf.is_empty() {
                FrameError::ConnectionClosed
            } else {
                FrameError::ShortRead {
                    buffered: self.buf.len(),
                }
            });
        }
        Ok(())
    }

    fn parse_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let size = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if size > MAX_HEADER_SIZE {
            return Err(FrameError::PayloadTooLarge {
                size,
                max: MAX_HEADER_SIZE,
            });
        }

        let total = HEADER_SIZE + size as usize;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(HEADER_SIZE);
        let payload = self.buf.split_to(size as usize);
        Ok(Some(Frame::new(payload.to_vec())))
    }
}
