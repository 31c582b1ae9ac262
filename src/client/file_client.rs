//! Module `file_client`
//!
//! One call at a time over a single connection. Every call reads frames until
//! the server's terminal status, so the connection is ready for the next call
//! when a method returns.

use std::io;

use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use log::debug;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::error::{ClientError, TransportError};
use crate::protocol::{
    ClientFrame, DEFAULT_MAX_FRAME_BYTES, DownloadFileRequest, FileInfo, FrameReader,
    FrameWriter, ListFilesRequest, ServerFrame, Status, UploadFileRequest,
};
use crate::transfer::DEFAULT_CHUNK_SIZE;

pub struct FileClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    chunk_size: usize,
}

impl FileClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await.map_err(TransportError::from)?;
        stream.set_nodelay(true).map_err(TransportError::from)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: FrameReader::new(reader, DEFAULT_MAX_FRAME_BYTES),
            writer: FrameWriter::new(writer, DEFAULT_MAX_FRAME_BYTES),
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    /// Sets the largest payload sent in one upload message.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Uploads the bytes produced by `source` as `filename` and returns the
    /// server's confirmation.
    ///
    /// If `source` fails, the call is canceled on the server and the local error
    /// is returned.
    pub async fn upload<S>(&mut self, filename: &str, source: S) -> Result<String, ClientError>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        let chunk_size = self.chunk_size;
        let mut pieces = source.flat_map(move |item| {
            let pieces: Vec<io::Result<Bytes>> = match item {
                Ok(bytes) => split(bytes, chunk_size).into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            };
            stream::iter(pieces)
        });

        let mut unnamed = Some(filename.to_string());
        let mut failure = None;
        while let Some(piece) = pieces.next().await {
            match piece {
                Ok(chunk) => {
                    let request = UploadFileRequest {
                        filename: unnamed.take().unwrap_or_default(),
                        chunk: chunk.to_vec(),
                    };
                    self.writer.write_frame(&ClientFrame::Upload(request)).await?;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            // Only a call the server has seen needs canceling
            if unnamed.is_none() {
                debug!("upload source failed, canceling: {}", e);
                self.writer.write_frame(&ClientFrame::Cancel).await?;
                let _ = self.expect_status().await;
            }
            return Err(ClientError::Io(e));
        }

        if let Some(filename) = unnamed {
            // Empty upload: the naming message carries no payload
            let request = UploadFileRequest {
                filename,
                chunk: Vec::new(),
            };
            self.writer.write_frame(&ClientFrame::Upload(request)).await?;
        }

        self.writer.write_frame(&ClientFrame::CloseSend).await?;

        let message = match self.next_frame().await? {
            ServerFrame::UploadFile(response) => response.message,
            ServerFrame::Status(status) => return Err(ClientError::Status(status)),
            other => return Err(ClientError::Protocol(other.kind())),
        };
        self.expect_ok().await?;
        Ok(message)
    }

    pub async fn upload_bytes(
        &mut self,
        filename: &str,
        data: impl Into<Bytes>,
    ) -> Result<String, ClientError> {
        let data: Bytes = data.into();
        self.upload(filename, stream::iter([Ok(data)])).await
    }

    /// Starts a download. Chunks are pulled from the returned handle.
    pub async fn begin_download(&mut self, filename: &str) -> Result<Download<'_>, ClientError> {
        let request = DownloadFileRequest {
            filename: filename.to_string(),
        };
        self.writer.write_frame(&ClientFrame::Download(request)).await?;
        Ok(Download {
            client: self,
            finished: false,
        })
    }

    /// Downloads `filename` into `out` and returns the number of bytes written.
    pub async fn download_to<W>(&mut self, filename: &str, out: &mut W) -> Result<u64, ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut download = self.begin_download(filename).await?;
        let mut total = 0u64;
        while let Some(chunk) = download.next_chunk().await? {
            out.write_all(&chunk).await.map_err(ClientError::Io)?;
            total += chunk.len() as u64;
        }
        out.flush().await.map_err(ClientError::Io)?;
        Ok(total)
    }

    pub async fn download(&mut self, filename: &str) -> Result<Vec<u8>, ClientError> {
        let mut data = Vec::new();
        self.download_to(filename, &mut data).await?;
        Ok(data)
    }

    pub async fn list_files(&mut self) -> Result<Vec<FileInfo>, ClientError> {
        self.writer
            .write_frame(&ClientFrame::ListFiles(ListFilesRequest::default()))
            .await?;

        let files = match self.next_frame().await? {
            ServerFrame::ListFiles(response) => response.files,
            ServerFrame::Status(status) => return Err(ClientError::Status(status)),
            other => return Err(ClientError::Protocol(other.kind())),
        };
        self.expect_ok().await?;
        Ok(files)
    }

    async fn next_frame(&mut self) -> Result<ServerFrame, ClientError> {
        match self.reader.read_frame().await? {
            Some(frame) => Ok(frame),
            None => Err(TransportError::ConnectionClosed.into()),
        }
    }

    async fn expect_status(&mut self) -> Result<Status, ClientError> {
        match self.next_frame().await? {
            ServerFrame::Status(status) => Ok(status),
            other => Err(ClientError::Protocol(other.kind())),
        }
    }

    async fn expect_ok(&mut self) -> Result<(), ClientError> {
        let status = self.expect_status().await?;
        if status.is_ok() {
            Ok(())
        } else {
            Err(ClientError::Status(status))
        }
    }
}

/// A download in progress.
///
/// Dropping it before the end leaves unread frames on the connection; call
/// [`Download::cancel`] to stop early.
pub struct Download<'a> {
    client: &'a mut FileClient,
    finished: bool,
}

impl Download<'_> {
    /// Next chunk, or `None` once the server reports success.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, ClientError> {
        if self.finished {
            return Ok(None);
        }
        match self.client.next_frame().await? {
            ServerFrame::DownloadChunk(response) => Ok(Some(Bytes::from(response.chunk))),
            ServerFrame::Status(status) => {
                self.finished = true;
                if status.is_ok() {
                    Ok(None)
                } else {
                    Err(ClientError::Status(status))
                }
            }
            other => {
                self.finished = true;
                Err(ClientError::Protocol(other.kind()))
            }
        }
    }

    /// Asks the server to stop, skips chunks already in flight, and returns the
    /// terminal status.
    pub async fn cancel(mut self) -> Result<Status, ClientError> {
        if self.finished {
            return Ok(Status::ok());
        }
        self.client.writer.write_frame(&ClientFrame::Cancel).await?;
        loop {
            match self.client.next_frame().await? {
                ServerFrame::DownloadChunk(_) => continue,
                ServerFrame::Status(status) => {
                    self.finished = true;
                    return Ok(status);
                }
                other => return Err(ClientError::Protocol(other.kind())),
            }
        }
    }
}

fn split(mut bytes: Bytes, chunk_size: usize) -> Vec<Bytes> {
    let mut pieces = Vec::with_capacity(bytes.len() / chunk_size + 1);
    while bytes.len() > chunk_size {
        pieces.push(bytes.split_to(chunk_size));
    }
    if !bytes.is_empty() {
        pieces.push(bytes);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_respects_chunk_size() {
        let pieces = split(Bytes::from_static(b"abcdefg"), 3);
        assert_eq!(pieces, vec![&b"abc"[..], &b"def"[..], &b"g"[..]]);
    }

    #[test]
    fn split_of_empty_is_empty() {
        assert!(split(Bytes::new(), 4).is_empty());
    }
}
