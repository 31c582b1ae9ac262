//! Module `file_ops`
//!
//! The chunked transfer pipeline. Uploads relay inbound chunks into a backend
//! through a bounded conduit; downloads pull fixed-size chunks from a backend
//! and emit each one as soon as it is read. Neither direction holds a whole
//! file in memory.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::error::{Operation, ServiceError, StorageError};
use crate::storage::{ByteStream, SizeHint, StorageBackend};
use crate::transfer::conduit::{ConduitWriter, conduit};
use crate::transfer::results::{DownloadSummary, UploadSummary};
use crate::transfer::session::{Phase, TransferSession};

/// Download chunk size: 64 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Number of upload chunks that may be queued between the network and the backend.
pub const DEFAULT_CONDUIT_CAPACITY: usize = 16;

/// Outbound side of a download.
#[async_trait]
pub trait ChunkSink: Send {
    /// Delivers one chunk to the caller.
    ///
    /// A pending send is dropped as soon as the call is canceled, possibly part
    /// way through a message. A sink that is not cancel safe must record the
    /// interruption so its owner can close the transport instead of writing
    /// anything further to it.
    async fn send_chunk(&mut self, chunk: Bytes) -> Result<(), ServiceError>;
}

/// How the producing half of an upload ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relayed {
    Completed(u64),
    ConsumerClosed(u64),
}

/// Relays an upload into `storage` under the session's filename.
///
/// `first_chunk` is the payload carried by the message that named the file; `rest`
/// yields the payload of every following message and ends on a graceful close.
/// An error from `rest`, or cancellation, fails the whole upload and the backend
/// is told the stream was aborted.
pub async fn relay_upload<S>(
    storage: &dyn StorageBackend,
    session: &mut TransferSession,
    first_chunk: Bytes,
    rest: S,
    capacity: usize,
    cancel: &CancellationToken,
) -> Result<UploadSummary, ServiceError>
where
    S: Stream<Item = Result<Bytes, ServiceError>> + Send + Unpin,
{
    let filename = session.filename().to_string();
    let (writer, source) = conduit(capacity);
    session.advance(Phase::Streaming);

    let producer = async move {
        let result = pump(&writer, first_chunk, rest, cancel).await;
        match &result {
            Ok(Relayed::Completed(_)) => writer.finish(),
            Ok(Relayed::ConsumerClosed(_)) => {}
            Err(err) => writer.fail(io::Error::other(err.to_string())),
        }
        result
    };

    let consumer = async {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ServiceError::Canceled),
            saved = storage.save(&filename, SizeHint::Unknown, source) => {
                saved.map_err(|e| ServiceError::storage(Operation::Upload, Some(filename.as_str()), e))
            }
        }
    };

    let (produced, saved) = tokio::join!(producer, consumer);

    let outcome = match (produced, saved) {
        (Err(err), _) => Err(err),
        (Ok(_), Err(err)) => Err(err),
        (Ok(Relayed::ConsumerClosed(bytes)), Ok(())) => {
            warn!(
                "{} backend finished '{}' after {} bytes without draining the upload",
                storage.kind(),
                filename,
                bytes
            );
            Err(ServiceError::storage(
                Operation::Upload,
                Some(filename.as_str()),
                StorageError::Backend("backend stopped reading before the upload ended".into()),
            ))
        }
        (Ok(Relayed::Completed(bytes)), Ok(())) => Ok(bytes),
    };

    match outcome {
        Ok(bytes) => {
            session.advance(Phase::Completing);
            session.advance(Phase::Done);
            info!("Upload relayed: {} ({} bytes)", filename, bytes);
            Ok(UploadSummary { filename, bytes })
        }
        Err(err) => {
            session.fail();
            Err(err)
        }
    }
}

/// Moves chunks from the inbound stream into the conduit until the stream ends,
/// the consumer hangs up, or something fails.
async fn pump<S>(
    writer: &ConduitWriter,
    first_chunk: Bytes,
    mut rest: S,
    cancel: &CancellationToken,
) -> Result<Relayed, ServiceError>
where
    S: Stream<Item = Result<Bytes, ServiceError>> + Send + Unpin,
{
    let mut relayed = 0u64;
    let mut pending = Some(first_chunk);

    loop {
        let chunk = match pending.take() {
            Some(chunk) => chunk,
            None => {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ServiceError::Canceled),
                    _ = writer.closed() => return Ok(Relayed::ConsumerClosed(relayed)),
                    next = rest.next() => next,
                };
                match next {
                    Some(chunk) => chunk?,
                    None => return Ok(Relayed::Completed(relayed)),
                }
            }
        };

        if chunk.is_empty() {
            continue;
        }

        let len = chunk.len() as u64;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ServiceError::Canceled),
            sent = writer.send(chunk) => {
                if sent.is_err() {
                    return Ok(Relayed::ConsumerClosed(relayed));
                }
            }
        }
        relayed += len;
        debug!("relayed {} bytes into conduit ({} total)", len, relayed);
    }
}

/// Streams `stream` to `sink` in chunks of `chunk_size` bytes (the last one may be shorter).
///
/// Cancellation interrupts a pending read or a pending send; see
/// [`ChunkSink::send_chunk`] for what that means to the sink. A failure after some chunks were already sent still fails the
/// whole download.
pub async fn relay_download<K>(
    stream: ByteStream,
    sink: &mut K,
    session: &mut TransferSession,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> Result<DownloadSummary, ServiceError>
where
    K: ChunkSink + ?Sized,
{
    session.advance(Phase::Streaming);
    let filename = session.filename().to_string();

    match send_chunks(stream, sink, &filename, chunk_size, cancel).await {
        Ok((bytes, chunks)) => {
            session.advance(Phase::Completing);
            session.advance(Phase::Done);
            info!(
                "Download relayed: {} ({} bytes in {} chunks)",
                filename, bytes, chunks
            );
            Ok(DownloadSummary {
                filename,
                bytes,
                chunks,
            })
        }
        Err(err) => {
            session.fail();
            Err(err)
        }
    }
}

async fn send_chunks<K>(
    stream: ByteStream,
    sink: &mut K,
    filename: &str,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> Result<(u64, u64), ServiceError>
where
    K: ChunkSink + ?Sized,
{
    let mut reader = StreamReader::new(stream);
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut total_bytes_sent = 0u64;
    let mut chunks = 0u64;

    loop {
        let filled = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ServiceError::Canceled),
            filled = fill_chunk(&mut reader, &mut buffer) => filled.map_err(|e| {
                ServiceError::storage(
                    Operation::Download,
                    Some(filename),
                    StorageError::io("failed to read file", e),
                )
            })?,
        };

        if filled == 0 {
            break;
        }

        let chunk = Bytes::copy_from_slice(&buffer[..filled]);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ServiceError::Canceled),
            sent = sink.send_chunk(chunk) => sent?,
        }
        total_bytes_sent += filled as u64;
        chunks += 1;

        if filled < buffer.len() {
            break;
        }
    }

    Ok((total_bytes_sent, chunks))
}

/// Reads until `buffer` is full or the reader is exhausted.
async fn fill_chunk<R>(reader: &mut R, buffer: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buffer.len() {
        let n = reader.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
