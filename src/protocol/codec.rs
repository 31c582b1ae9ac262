//! Frame codec
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes of
//! `postcard`-encoded message.

use bytes::{Buf, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;

/// Length of the frame header.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest accepted frame body: a 4 MiB chunk plus room for the message envelope.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024 + 1024;

/// Reads frames from a byte stream.
///
/// Bytes are accumulated in an internal buffer, so `read_frame` is cancel safe:
/// dropping a pending call loses no data and the next call resumes where it left off.
pub struct FrameReader<R> {
    inner: R,
    buffer: BytesMut,
    max_frame_bytes: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_bytes: usize) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(8 * 1024),
            max_frame_bytes,
        }
    }

    /// Reads the next frame. Returns `Ok(None)` on a clean end of stream between frames.
    pub async fn read_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }

            if self.inner.read_buf(&mut self.buffer).await? == 0 {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(TransportError::ConnectionClosed)
                };
            }
        }
    }

    fn parse_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        if self.buffer.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&self.buffer[..FRAME_HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_frame_bytes {
            return Err(TransportError::FrameTooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }

        let total = FRAME_HEADER_LEN + len;
        if self.buffer.len() < total {
            self.buffer.reserve(total - self.buffer.len());
            return Ok(None);
        }

        self.buffer.advance(FRAME_HEADER_LEN);
        let body = self.buffer.split_to(len);
        Ok(Some(postcard::from_bytes(&body)?))
    }
}

/// Writes frames to a byte stream.
pub struct FrameWriter<W> {
    inner: W,
    max_frame_bytes: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, max_frame_bytes: usize) -> Self {
        Self {
            inner,
            max_frame_bytes,
        }
    }

    /// Encodes and writes one frame, then flushes.
    pub async fn write_frame<T: Serialize>(&mut self, frame: &T) -> Result<(), TransportError> {
        let body = postcard::to_stdvec(frame)?;
        if body.len() > self.max_frame_bytes {
            return Err(TransportError::FrameTooLarge {
                len: body.len(),
                max: self.max_frame_bytes,
            });
        }
        let len = u32::try_from(body.len()).map_err(|_| TransportError::FrameTooLarge {
            len: body.len(),
            max: self.max_frame_bytes,
        })?;

        self.inner.write_all(&len.to_be_bytes()).await?;
        self.inner.write_all(&body).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Flushes and closes the write direction.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
