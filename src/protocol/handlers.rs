//! Connection handler
//!
//! Serves the calls of one client connection, one after another. Each call gets
//! its own cancellation token, a child of the server's shutdown token, and ends
//! with exactly one `Status` frame.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::error::handlers::status_from_error;
use crate::error::{ServiceError, TransportError};
use crate::middleware::logging::{log_call, log_call_finished};
use crate::protocol::codec::{FrameReader, FrameWriter};
use crate::protocol::messages::{
    ClientFrame, DownloadFileRequest, DownloadFileResponse, FileInfo, ListFilesResponse,
    ServerFrame, UploadFileRequest, UploadFileResponse,
};
use crate::protocol::responses::Status;
use crate::service::FileService;
use crate::transfer::ChunkSink;

/// How long a closing connection may spend delivering its last status
const CLOSING_STATUS_TIMEOUT: Duration = Duration::from_secs(1);

/// What the connection does after a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Framing is intact; wait for the next call
    Continue,
    /// The connection can no longer be trusted and must be closed
    Close,
    /// A server frame was cut off part way; close without writing anything else
    Torn,
}

/// Where the inbound half of an upload stands once the service returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inbound {
    Open,
    Closed,
    Canceled,
    Broken,
}

/// What the read half saw while a download or list call was running
enum Interrupt {
    None,
    Canceled,
    Disconnected,
    Pipelined(ClientFrame),
}

pub struct ConnectionHandler<R, W> {
    peer: SocketAddr,
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    service: Arc<FileService>,
    call_timeout: Option<Duration>,
    pending: Option<ClientFrame>,
    calls: u64,
}

impl<R, W> ConnectionHandler<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(
        peer: SocketAddr,
        reader: R,
        writer: W,
        service: Arc<FileService>,
        max_frame_bytes: usize,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            peer,
            reader: FrameReader::new(reader, max_frame_bytes),
            writer: FrameWriter::new(writer, max_frame_bytes),
            service,
            call_timeout,
            pending: None,
            calls: 0,
        }
    }

    /// Serves calls until the client disconnects, the connection breaks, or
    /// `shutdown` fires. Returns the number of calls handled.
    pub async fn serve(mut self, shutdown: CancellationToken) -> Result<u64, TransportError> {
        loop {
            let frame = match self.pending.take() {
                Some(frame) => frame,
                None => {
                    let next = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => {
                            debug!("{} closing for shutdown", self.peer);
                            break;
                        }
                        next = self.reader.read_frame::<ClientFrame>() => next?,
                    };
                    match next {
                        Some(frame) => frame,
                        None => break,
                    }
                }
            };

            let cancel = self.call_token(&shutdown);
            let disposition = self.dispatch(frame, &cancel, &shutdown).await;
            cancel.cancel();

            if disposition? != Disposition::Continue {
                break;
            }
        }

        let _ = self.writer.shutdown().await;
        Ok(self.calls)
    }

    fn call_token(&self, shutdown: &CancellationToken) -> CancellationToken {
        let token = shutdown.child_token();
        if let Some(timeout) = self.call_timeout {
            let timer = token.clone();
            let peer = self.peer;
            tokio::spawn(async move {
                tokio::select! {
                    _ = timer.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        warn!("call from {} exceeded its {:?} deadline", peer, timeout);
                        timer.cancel();
                    }
                }
            });
        }
        token
    }

    async fn dispatch(
        &mut self,
        frame: ClientFrame,
        cancel: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Result<Disposition, TransportError> {
        match frame {
            ClientFrame::Upload(request) => self.handle_upload(request, cancel, shutdown).await,
            ClientFrame::Download(request) => self.handle_download(request, cancel).await,
            ClientFrame::ListFiles(_) => self.handle_list(cancel).await,
            ClientFrame::Cancel => {
                debug!("{} sent Cancel with no call in flight", self.peer);
                Ok(Disposition::Continue)
            }
            ClientFrame::CloseSend => {
                warn!("{} sent CloseSend with no upload in flight", self.peer);
                self.writer
                    .write_frame(&ServerFrame::Status(status_from_error(
                        "Upload",
                        &ServiceError::InvalidInput("no upload in progress".into()),
                    )))
                    .await?;
                Ok(Disposition::Continue)
            }
        }
    }

    async fn handle_upload(
        &mut self,
        first: UploadFileRequest,
        cancel: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Result<Disposition, TransportError> {
        const CALL: &str = "Upload";
        self.calls += 1;
        let started = Instant::now();
        log_call(&self.peer, CALL, Some(first.filename.as_str()));

        let mut inbound = Inbound::Open;
        let result = {
            let rest = Box::pin(stream::unfold(
                (&mut self.reader, &mut inbound),
                |(reader, inbound)| async move {
                    if *inbound != Inbound::Open {
                        return None;
                    }
                    let item: Result<Bytes, ServiceError> = match reader.read_frame::<ClientFrame>().await {
                        Ok(Some(ClientFrame::Upload(request))) => Ok(Bytes::from(request.chunk)),
                        Ok(Some(ClientFrame::CloseSend)) => {
                            *inbound = Inbound::Closed;
                            return None;
                        }
                        Ok(Some(ClientFrame::Cancel)) => {
                            *inbound = Inbound::Canceled;
                            Err(ServiceError::Canceled)
                        }
                        Ok(Some(other)) => {
                            *inbound = Inbound::Broken;
                            Err(TransportError::UnexpectedFrame(other.kind()).into())
                        }
                        Ok(None) => {
                            *inbound = Inbound::Broken;
                            Err(TransportError::ConnectionClosed.into())
                        }
                        Err(err) => {
                            *inbound = Inbound::Broken;
                            Err(err.into())
                        }
                    };
                    Some((item, (reader, inbound)))
                },
            ));
            self.service
                .upload(&first.filename, Bytes::from(first.chunk), rest, cancel)
                .await
        };

        let disposition = match (&result, inbound) {
            (_, Inbound::Closed | Inbound::Canceled) => Disposition::Continue,
            (_, Inbound::Broken) => Disposition::Close,
            (Err(ServiceError::Canceled), Inbound::Open) => Disposition::Close,
            (_, Inbound::Open) => self.discard_upload(shutdown).await,
        };

        let status = match result {
            Ok(summary) => {
                let response = ServerFrame::UploadFile(UploadFileResponse {
                    message: summary.confirmation(),
                });
                self.send_payload(CALL, &response).await?
            }
            Err(err) => status_from_error(CALL, &err),
        };
        self.finish_call(CALL, status, started, disposition).await
    }

    /// Skips the rest of an upload the service stopped reading, so the next call
    /// starts on a frame boundary.
    async fn discard_upload(&mut self, shutdown: &CancellationToken) -> Disposition {
        let mut discarded = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Disposition::Close,
                next = self.reader.read_frame::<ClientFrame>() => next,
            };
            match next {
                Ok(Some(ClientFrame::Upload(request))) => {
                    discarded += request.chunk.len() as u64;
                }
                Ok(Some(ClientFrame::CloseSend | ClientFrame::Cancel)) => {
                    debug!("discarded {} upload bytes from {}", discarded, self.peer);
                    return Disposition::Continue;
                }
                Ok(Some(_)) | Ok(None) | Err(_) => return Disposition::Close,
            }
        }
    }

    async fn handle_download(
        &mut self,
        request: DownloadFileRequest,
        cancel: &CancellationToken,
    ) -> Result<Disposition, TransportError> {
        const CALL: &str = "Download";
        self.calls += 1;
        let started = Instant::now();
        log_call(&self.peer, CALL, Some(request.filename.as_str()));

        let service = Arc::clone(&self.service);
        let mut sink = FrameSink {
            writer: &mut self.writer,
            torn: false,
        };
        let download = service.download(&request.filename, &mut sink, cancel);
        let (result, interrupt) = watch_call(&mut self.reader, cancel, download).await;
        let torn = sink.torn;

        let status = match result {
            Ok(_) => Status::ok(),
            Err(err) => status_from_error(CALL, &err),
        };
        let disposition = match self.absorb(interrupt) {
            _ if torn => Disposition::Torn,
            disposition => disposition,
        };
        self.finish_call(CALL, status, started, disposition).await
    }

    async fn handle_list(&mut self, cancel: &CancellationToken) -> Result<Disposition, TransportError> {
        const CALL: &str = "ListFiles";
        self.calls += 1;
        let started = Instant::now();
        log_call(&self.peer, CALL, None);

        let service = Arc::clone(&self.service);
        let list = service.list_files(cancel);
        let (result, interrupt) = watch_call(&mut self.reader, cancel, list).await;

        let status = match result {
            Ok(files) => {
                let files = files.into_iter().map(FileInfo::from).collect();
                let response = ServerFrame::ListFiles(ListFilesResponse { files });
                self.send_payload(CALL, &response).await?
            }
            Err(err) => status_from_error(CALL, &err),
        };
        let disposition = self.absorb(interrupt);
        self.finish_call(CALL, status, started, disposition).await
    }

    fn absorb(&mut self, interrupt: Interrupt) -> Disposition {
        match interrupt {
            Interrupt::None | Interrupt::Canceled => Disposition::Continue,
            Interrupt::Disconnected => Disposition::Close,
            Interrupt::Pipelined(frame) => {
                self.pending = Some(frame);
                Disposition::Continue
            }
        }
    }

    /// Writes the response frame of a successful call and returns its status.
    ///
    /// A response that cannot be encoded or exceeds the frame limit is rejected
    /// before any byte is written, so the call still ends with an `Internal`
    /// status on an intact connection.
    async fn send_payload(&mut self, call: &str, frame: &ServerFrame) -> Result<Status, TransportError> {
        match self.writer.write_frame(frame).await {
            Ok(()) => Ok(Status::ok()),
            Err(err @ (TransportError::FrameTooLarge { .. } | TransportError::Codec(_))) => {
                Ok(status_from_error(call, &ServiceError::Transport(err)))
            }
            Err(err) => Err(err),
        }
    }

    async fn finish_call(
        &mut self,
        call: &str,
        status: Status,
        started: Instant,
        disposition: Disposition,
    ) -> Result<Disposition, TransportError> {
        log_call_finished(&self.peer, call, &status, started.elapsed());
        let frame = ServerFrame::Status(status);
        match disposition {
            Disposition::Continue => {
                self.writer.write_frame(&frame).await?;
            }
            Disposition::Close => {
                let _ = tokio::time::timeout(CLOSING_STATUS_TIMEOUT, self.writer.write_frame(&frame)).await;
            }
            Disposition::Torn => {
                warn!("{} interrupted mid-frame for {}; closing without a status", call, self.peer);
            }
        }
        Ok(disposition)
    }
}

/// Runs `call` while watching the read half for `Cancel` or a disconnect, either of
/// which cancels the call.
async fn watch_call<R, F>(
    reader: &mut FrameReader<R>,
    cancel: &CancellationToken,
    call: F,
) -> (F::Output, Interrupt)
where
    R: AsyncRead + Unpin,
    F: Future,
{
    tokio::pin!(call);
    let mut interrupt = Interrupt::None;

    loop {
        let watching = matches!(interrupt, Interrupt::None);
        tokio::select! {
            output = &mut call => return (output, interrupt),
            next = reader.read_frame::<ClientFrame>(), if watching => {
                interrupt = match next {
                    Ok(Some(ClientFrame::Cancel)) => {
                        cancel.cancel();
                        Interrupt::Canceled
                    }
                    Ok(Some(frame)) => Interrupt::Pipelined(frame),
                    Ok(None) | Err(_) => {
                        cancel.cancel();
                        Interrupt::Disconnected
                    }
                };
            }
        }
    }
}

/// Writes download chunks straight to the connection.
///
/// `torn` stays set if a write is dropped before it completes, which leaves a
/// partial frame on the wire.
struct FrameSink<'a, W> {
    writer: &'a mut FrameWriter<W>,
    torn: bool,
}

#[async_trait]
impl<W> ChunkSink for FrameSink<'_, W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send_chunk(&mut self, chunk: Bytes) -> Result<(), ServiceError> {
        self.torn = true;
        self.writer
            .write_frame(&ServerFrame::DownloadChunk(DownloadFileResponse {
                chunk: chunk.to_vec(),
            }))
            .await?;
        self.torn = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Operation;
    use crate::middleware::AdmissionLimits;
    use crate::protocol::codec::DEFAULT_MAX_FRAME_BYTES;
    use crate::protocol::messages::ListFilesRequest;
    use crate::protocol::responses::StatusCode;
    use crate::storage::LocalFilesystem;
    use tempfile::TempDir;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    struct Peer {
        reader: FrameReader<ReadHalf<DuplexStream>>,
        writer: FrameWriter<WriteHalf<DuplexStream>>,
    }

    impl Peer {
        async fn send(&mut self, frame: ClientFrame) {
            self.writer.write_frame(&frame).await.unwrap();
        }

        async fn recv(&mut self) -> ServerFrame {
            self.reader.read_frame().await.unwrap().unwrap()
        }

        async fn status(&mut self) -> Status {
            match self.recv().await {
                ServerFrame::Status(status) => status,
                other => panic!("expected status, got {:?}", other),
            }
        }
    }

    type ServeTask = tokio::task::JoinHandle<Result<u64, TransportError>>;

    struct Setup {
        max_frame_bytes: usize,
        call_timeout: Option<Duration>,
        pipe_bytes: usize,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
                call_timeout: None,
                pipe_bytes: 64 * 1024,
            }
        }
    }

    async fn connect(tmp: &TempDir) -> (Peer, ServeTask) {
        let (peer, task, _) = connect_with(tmp, Setup::default()).await;
        (peer, task)
    }

    async fn connect_with(tmp: &TempDir, setup: Setup) -> (Peer, ServeTask, Arc<FileService>) {
        let storage = LocalFilesystem::new(tmp.path()).await.unwrap();
        let service = Arc::new(FileService::new(AdmissionLimits::default(), Arc::new(storage)));
        let (client, server) = tokio::io::duplex(setup.pipe_bytes);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, client_write) = tokio::io::split(client);

        let handler = ConnectionHandler::new(
            "127.0.0.1:4000".parse().unwrap(),
            server_read,
            server_write,
            Arc::clone(&service),
            setup.max_frame_bytes,
            setup.call_timeout,
        );
        let task = tokio::spawn(handler.serve(CancellationToken::new()));
        let peer = Peer {
            reader: FrameReader::new(client_read, DEFAULT_MAX_FRAME_BYTES),
            writer: FrameWriter::new(client_write, DEFAULT_MAX_FRAME_BYTES),
        };
        (peer, task, service)
    }

    fn chunk(filename: &str, data: &[u8]) -> ClientFrame {
        ClientFrame::Upload(UploadFileRequest {
            filename: filename.into(),
            chunk: data.to_vec(),
        })
    }

    #[tokio::test]
    async fn upload_then_download_on_one_connection() {
        let tmp = TempDir::new().unwrap();
        let (mut peer, task) = connect(&tmp).await;

        peer.send(chunk("notes.txt", b"hello ")).await;
        peer.send(chunk("", b"world")).await;
        peer.send(ClientFrame::CloseSend).await;
        assert_eq!(
            peer.recv().await,
            ServerFrame::UploadFile(UploadFileResponse {
                message: "file 'notes.txt' uploaded".into()
            })
        );
        assert!(peer.status().await.is_ok());

        peer.send(ClientFrame::Download(DownloadFileRequest {
            filename: "notes.txt".into(),
        }))
        .await;
        assert_eq!(
            peer.recv().await,
            ServerFrame::DownloadChunk(DownloadFileResponse {
                chunk: b"hello world".to_vec()
            })
        );
        assert!(peer.status().await.is_ok());

        drop(peer);
        assert_eq!(task.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn rejected_upload_keeps_connection_usable() {
        let tmp = TempDir::new().unwrap();
        let (mut peer, _task) = connect(&tmp).await;

        peer.send(chunk("../escape.txt", b"data")).await;
        peer.send(chunk("", b"more data")).await;
        peer.send(ClientFrame::CloseSend).await;
        let status = peer.status().await;
        assert_eq!(status.code, StatusCode::InvalidArgument);

        peer.send(ClientFrame::ListFiles(ListFilesRequest::default())).await;
        assert_eq!(
            peer.recv().await,
            ServerFrame::ListFiles(ListFilesResponse { files: vec![] })
        );
        assert!(peer.status().await.is_ok());
    }

    #[tokio::test]
    async fn missing_file_sends_no_chunks() {
        let tmp = TempDir::new().unwrap();
        let (mut peer, _task) = connect(&tmp).await;

        peer.send(ClientFrame::Download(DownloadFileRequest {
            filename: "missing.txt".into(),
        }))
        .await;
        let status = peer.status().await;
        assert_eq!(status.code, StatusCode::NotFound);
    }

    #[tokio::test]
    async fn canceled_upload_is_reported_canceled() {
        let tmp = TempDir::new().unwrap();
        let (mut peer, _task) = connect(&tmp).await;

        peer.send(chunk("partial.txt", b"some bytes")).await;
        peer.send(ClientFrame::Cancel).await;
        assert_eq!(peer.status().await.code, StatusCode::Canceled);
        assert!(!tmp.path().join("partial.txt").exists());
    }

    #[tokio::test]
    async fn eof_mid_upload_stores_nothing() {
        let tmp = TempDir::new().unwrap();
        let (mut peer, task) = connect(&tmp).await;

        peer.send(chunk("truncated.txt", b"first half")).await;
        drop(peer);

        assert!(task.await.unwrap().is_ok());
        assert!(!tmp.path().join("truncated.txt").exists());
    }

    #[tokio::test]
    async fn stray_close_send_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let (mut peer, _task) = connect(&tmp).await;

        peer.send(ClientFrame::CloseSend).await;
        assert_eq!(peer.status().await.code, StatusCode::InvalidArgument);
    }

    #[tokio::test]
    async fn deadline_frees_download_stuck_on_a_peer_that_stopped_reading() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("big.bin"), vec![7u8; 4 * 1024 * 1024]).unwrap();
        let (mut peer, task, service) = connect_with(
            &tmp,
            Setup {
                call_timeout: Some(Duration::from_millis(200)),
                pipe_bytes: 1024,
                ..Setup::default()
            },
        )
        .await;

        peer.send(ClientFrame::Download(DownloadFileRequest {
            filename: "big.bin".into(),
        }))
        .await;

        // The peer never reads; the handler must give up on its own.
        let served = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("handler stayed blocked on a stalled write");
        assert_eq!(served.unwrap().unwrap(), 1);
        assert_eq!(service.admission().available(Operation::Download), 10);
    }

    #[tokio::test]
    async fn oversized_listing_ends_with_internal_status() {
        let tmp = TempDir::new().unwrap();
        for i in 0..50 {
            let name = format!("a-reasonably-long-file-name-{i:03}.txt");
            std::fs::write(tmp.path().join(name), b"x").unwrap();
        }
        std::fs::write(tmp.path().join("small.txt"), b"small").unwrap();
        let (mut peer, _task, _service) = connect_with(
            &tmp,
            Setup {
                max_frame_bytes: 1024,
                ..Setup::default()
            },
        )
        .await;

        peer.send(ClientFrame::ListFiles(ListFilesRequest::default())).await;
        let status = peer.status().await;
        assert_eq!(status.code, StatusCode::Internal);
        assert_eq!(status.message, "ListFiles failed");

        peer.send(ClientFrame::Download(DownloadFileRequest {
            filename: "small.txt".into(),
        }))
        .await;
        assert_eq!(
            peer.recv().await,
            ServerFrame::DownloadChunk(DownloadFileResponse {
                chunk: b"small".to_vec()
            })
        );
        assert!(peer.status().await.is_ok());
    }
}
