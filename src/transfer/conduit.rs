//! Module `conduit`
//!
//! A bounded, backpressured byte channel between the task that receives upload
//! chunks from the network and the backend that persists them.
//!
//! - The writer blocks once `capacity` chunks are queued, so peak memory does
//!   not grow with file size.
//! - Dropping the [`ByteSource`] closes the conduit; the writer observes it as
//!   [`ConduitClosed`] and stops pulling from the network.
//! - A writer that goes away without calling [`ConduitWriter::finish`] turns the
//!   end of the source into an error, so a backend never mistakes an aborted
//!   upload for a short file.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;

/// The consuming side hung up before the writer finished.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("byte source closed by consumer")]
pub struct ConduitClosed;

#[derive(Debug, Default)]
struct Shared {
    completed: AtomicBool,
}

/// Producer end of a conduit.
#[derive(Debug)]
pub struct ConduitWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
    shared: Arc<Shared>,
}

/// Consumer end of a conduit, handed to [`StorageBackend::save`](crate::storage::StorageBackend::save).
#[derive(Debug)]
pub struct ByteSource {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    shared: Arc<Shared>,
    done: bool,
}

/// Creates a conduit holding at most `capacity` queued chunks.
pub fn conduit(capacity: usize) -> (ConduitWriter, ByteSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let shared = Arc::new(Shared::default());
    (
        ConduitWriter {
            tx,
            shared: Arc::clone(&shared),
        },
        ByteSource {
            rx,
            shared,
            done: false,
        },
    )
}

impl ConduitWriter {
    /// Queues one chunk, waiting while the conduit is full.
    pub async fn send(&self, chunk: Bytes) -> Result<(), ConduitClosed> {
        self.tx.send(Ok(chunk)).await.map_err(|_| ConduitClosed)
    }

    /// Resolves once the consumer has dropped its end.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Marks the stream as complete; the consumer sees a clean end of input.
    pub fn finish(self) {
        self.shared.completed.store(true, Ordering::Release);
    }

    /// Terminates the stream with `err`.
    ///
    /// If the conduit is full the error cannot be queued, but the consumer still
    /// sees an aborted stream because `finish` was never called.
    pub fn fail(self, err: io::Error) {
        let _ = self.tx.try_send(Err(err));
    }
}

impl ByteSource {
    /// Builds an already-completed source from in-memory chunks.
    pub fn from_chunks<I>(chunks: I) -> ByteSource
    where
        I: IntoIterator<Item = Bytes>,
    {
        let chunks: Vec<Bytes> = chunks.into_iter().collect();
        let (writer, source) = conduit(chunks.len());
        for chunk in chunks {
            // capacity equals the number of chunks, so this never hits a full queue
            let _ = writer.tx.try_send(Ok(chunk));
        }
        writer.finish();
        source
    }

    /// Adapts the source into an `AsyncRead` for backends that copy from a reader.
    pub fn into_reader(self) -> StreamReader<ByteSource, Bytes> {
        StreamReader::new(self)
    }
}

impl Stream for ByteSource {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(err))) => {
                self.done = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                self.done = true;
                if self.shared.completed.load(Ordering::Acquire) {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "byte source aborted before the upload completed",
                    ))))
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn delivers_chunks_in_order_then_ends() {
        let (writer, mut source) = conduit(2);
        tokio::spawn(async move {
            for i in 0..5u8 {
                writer.send(Bytes::from(vec![i; 3])).await.unwrap();
            }
            writer.finish();
        });

        let mut seen = Vec::new();
        while let Some(chunk) = source.next().await {
            seen.push(chunk.unwrap()[0]);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn writer_blocks_when_full() {
        let (writer, _source) = conduit(1);
        writer.send(Bytes::from_static(b"a")).await.unwrap();

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            writer.send(Bytes::from_static(b"b")),
        )
        .await;
        assert!(blocked.is_err(), "second send should wait for the consumer");
    }

    #[tokio::test]
    async fn dropped_source_is_seen_by_writer() {
        let (writer, source) = conduit(1);
        drop(source);

        assert!(writer.is_closed());
        writer.closed().await;
        assert_eq!(
            writer.send(Bytes::from_static(b"x")).await,
            Err(ConduitClosed)
        );
    }

    #[tokio::test]
    async fn failure_is_surfaced_instead_of_truncation() {
        let (writer, mut source) = conduit(4);
        writer.send(Bytes::from_static(b"partial")).await.unwrap();
        writer.fail(io::Error::new(io::ErrorKind::ConnectionReset, "client went away"));

        assert_eq!(source.next().await.unwrap().unwrap(), Bytes::from_static(b"partial"));
        let err = source.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(source.next().await.is_none());
    }

    #[tokio::test]
    async fn writer_dropped_without_finish_is_an_error() {
        let (writer, mut source) = conduit(4);
        writer.send(Bytes::from_static(b"abc")).await.unwrap();
        drop(writer);

        assert!(source.next().await.unwrap().is_ok());
        let err = source.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn from_chunks_reads_back_as_one_buffer() {
        let source = ByteSource::from_chunks(vec![
            Bytes::from_static(b"hello "),
            Bytes::from_static(b"world"),
        ]);
        let mut out = String::new();
        source.into_reader().read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn empty_from_chunks_is_a_clean_end() {
        let mut source = ByteSource::from_chunks(Vec::new());
        assert!(source.next().await.is_none());
    }
}
