//! Storage backend contract
//!
//! A backend persists named byte blobs and reports their metadata. The transfer
//! pipeline only ever talks to a backend through [`StorageBackend`], so a local
//! directory and a remote object store are interchangeable.
//!
//! Backends must tolerate being called concurrently from independent operations.
//! Concurrent writers to the same name are not arbitrated: whichever write
//! finishes last wins, or the backend may interleave them.

pub mod filesystem;
pub mod results;
pub mod validation;

use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::error::StorageError;

pub use crate::transfer::ByteSource;
pub use filesystem::LocalFilesystem;
pub use results::{FileMetadata, SizeHint};
pub use validation::{base_name, validate_filename};

/// A finite, single-pass sequence of file bytes produced by a backend.
///
/// Dropping it early is safe and releases whatever the backend holds open.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'static>>;

/// A lazy, finite listing of stored files in backend-defined order.
pub type MetadataStream =
    Pin<Box<dyn Stream<Item = Result<FileMetadata, StorageError>> + Send + 'static>>;

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Persists `source` under `name`, returning once the source is fully drained.
    ///
    /// An error item yielded by `source` means the upload was aborted; the backend
    /// must fail the save and must not publish a truncated file.
    async fn save(
        &self,
        name: &str,
        size_hint: SizeHint,
        source: ByteSource,
    ) -> Result<(), StorageError>;

    /// Opens `name` for reading. A missing file is `StorageError::NotFound`.
    async fn read(&self, name: &str) -> Result<ByteStream, StorageError>;

    /// Lists every stored file.
    async fn list(&self) -> Result<MetadataStream, StorageError>;

    /// Short backend name used in logs.
    fn kind(&self) -> &'static str;
}
