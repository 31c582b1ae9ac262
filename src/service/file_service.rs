//! Module `file_service`
//!
//! Every operation follows the same order: take an admission permit, validate
//! the filename once, then run the transfer against the backend. The permit
//! is held until the operation returns, on success and on every error path.

use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use log::{error, info};
use tokio_util::sync::CancellationToken;

use crate::error::{Operation, ServiceError};
use crate::middleware::{AdmissionController, AdmissionLimits};
use crate::storage::{FileMetadata, StorageBackend, validate_filename};
use crate::transfer::{
    ChunkSink, DEFAULT_CHUNK_SIZE, DEFAULT_CONDUIT_CAPACITY, DownloadSummary, TransferSession,
    UploadSummary, relay_download, relay_upload,
};

/// Tuning for the transfer pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    /// Size of each download chunk in bytes
    pub chunk_size: usize,
    /// Number of upload chunks buffered between the network and the backend
    pub conduit_capacity: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            conduit_capacity: DEFAULT_CONDUIT_CAPACITY,
        }
    }
}

pub struct FileService {
    storage: Arc<dyn StorageBackend>,
    admission: AdmissionController,
    options: TransferOptions,
}

impl FileService {
    pub fn new(limits: AdmissionLimits, storage: Arc<dyn StorageBackend>) -> Self {
        Self::with_options(limits, storage, TransferOptions::default())
    }

    pub fn with_options(
        limits: AdmissionLimits,
        storage: Arc<dyn StorageBackend>,
        options: TransferOptions,
    ) -> Self {
        let admission = AdmissionController::new(limits);
        info!(
            "File service on {} storage (upload {}, download {}, list {} concurrent; {} byte chunks)",
            storage.kind(),
            admission.limit(Operation::Upload),
            admission.limit(Operation::Download),
            admission.limit(Operation::List),
            options.chunk_size
        );
        Self {
            storage,
            admission,
            options: TransferOptions {
                chunk_size: options.chunk_size.max(1),
                conduit_capacity: options.conduit_capacity.max(1),
            },
        }
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn options(&self) -> TransferOptions {
        self.options
    }

    /// Stores an upload.
    ///
    /// `first_chunk` is the payload that arrived with the filename; `rest` yields the
    /// payload of each later message and ends when the client closes the stream.
    pub async fn upload<S>(
        &self,
        filename: &str,
        first_chunk: Bytes,
        rest: S,
        cancel: &CancellationToken,
    ) -> Result<UploadSummary, ServiceError>
    where
        S: Stream<Item = Result<Bytes, ServiceError>> + Send + Unpin,
    {
        info!("service.upload called (filename: {:?})", filename);
        let mut session = TransferSession::new(Operation::Upload, filename);

        let permit = self
            .admission
            .acquire(Operation::Upload, cancel)
            .await
            .inspect_err(|e| error!("failed to acquire upload permit: {}", e))?;

        if let Err(e) = validate_filename(filename) {
            error!("upload rejected: {}", e);
            session.fail();
            return Err(e.into());
        }

        let result = relay_upload(
            self.storage.as_ref(),
            &mut session,
            first_chunk,
            rest,
            self.options.conduit_capacity,
            cancel,
        )
        .await;
        self.admission.release(permit);

        match &result {
            Ok(summary) => info!(
                "service.upload finished: {} ({} bytes)",
                summary.filename, summary.bytes
            ),
            Err(e) => error!("upload of {:?} failed: {}", filename, e),
        }
        result
    }

    /// Streams a stored file to `sink` in fixed-size chunks.
    ///
    /// Nothing is sent when the file cannot be opened. A failure after chunks were
    /// sent is still reported as a failure of the whole download.
    pub async fn download<K>(
        &self,
        filename: &str,
        sink: &mut K,
        cancel: &CancellationToken,
    ) -> Result<DownloadSummary, ServiceError>
    where
        K: ChunkSink + ?Sized,
    {
        info!("service.download called (filename: {:?})", filename);
        let mut session = TransferSession::new(Operation::Download, filename);

        let permit = self
            .admission
            .acquire(Operation::Download, cancel)
            .await
            .inspect_err(|e| error!("failed to acquire download permit: {}", e))?;

        if let Err(e) = validate_filename(filename) {
            error!("download rejected: {}", e);
            session.fail();
            return Err(e.into());
        }

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ServiceError::Canceled),
            opened = self.storage.read(filename) => {
                opened.map_err(|e| ServiceError::storage(Operation::Download, Some(filename), e))
            }
        };
        let stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                error!("download of {:?} failed to open: {}", filename, e);
                session.fail();
                return Err(e);
            }
        };

        let result = relay_download(
            stream,
            sink,
            &mut session,
            self.options.chunk_size,
            cancel,
        )
        .await;
        self.admission.release(permit);

        match &result {
            Ok(summary) => info!(
                "service.download finished: {} ({} bytes)",
                summary.filename, summary.bytes
            ),
            Err(e) => error!("download of {:?} failed: {}", filename, e),
        }
        result
    }

    /// Lists every stored file. The backend listing is drained before returning.
    pub async fn list_files(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<FileMetadata>, ServiceError> {
        info!("service.list_files called");

        let permit = self
            .admission
            .acquire(Operation::List, cancel)
            .await
            .inspect_err(|e| error!("failed to acquire list permit: {}", e))?;

        let result = self.collect_listing(cancel).await;
        self.admission.release(permit);

        match &result {
            Ok(files) => info!("service.list_files finished (count: {})", files.len()),
            Err(e) => error!("list failed: {}", e),
        }
        result
    }

    async fn collect_listing(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<FileMetadata>, ServiceError> {
        let mut listing = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ServiceError::Canceled),
            listing = self.storage.list() => {
                listing.map_err(|e| ServiceError::storage(Operation::List, None, e))?
            }
        };

        let mut files = Vec::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ServiceError::Canceled),
                next = listing.next() => next,
            };
            match next {
                Some(Ok(meta)) => files.push(meta),
                Some(Err(e)) => return Err(ServiceError::storage(Operation::List, None, e)),
                None => break,
            }
        }
        Ok(files)
    }
}
