//! Local filesystem backend
//!
//! Stores every file directly under a root directory. Uploads are written to a
//! temporary file in a spill directory next to the root and renamed into place
//! only once the whole byte source has been received, so a failed upload never
//! leaves a truncated file behind. The spill directory lives outside the root
//! and never shows up as a stored name.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use log::{debug, info};
use tempfile::{NamedTempFile, TempDir};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::error::StorageError;
use crate::storage::validation::base_name;
use crate::storage::{ByteSource, ByteStream, FileMetadata, MetadataStream, SizeHint, StorageBackend};

const SPILL_PREFIX: &str = ".rax-incoming-";
const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct LocalFilesystem {
    root: PathBuf,
    incoming: Arc<TempDir>,
}

impl LocalFilesystem {
    /// Opens a filesystem backend rooted at `root`, creating the directory if needed.
    ///
    /// The spill directory is created beside the root so the final rename
    /// stays on one filesystem. It is removed when the last clone is dropped.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();

        fs::create_dir_all(&root).await.map_err(|e| {
            StorageError::io(
                format!("failed to create storage directory {}", root.display()),
                e,
            )
        })?;

        let parent = fs::canonicalize(&root)
            .await
            .map_err(|e| {
                StorageError::io(
                    format!("failed to resolve storage directory {}", root.display()),
                    e,
                )
            })?
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                StorageError::Backend(format!(
                    "storage root {} has no parent directory",
                    root.display()
                ))
            })?;

        let incoming = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(SPILL_PREFIX)
                .tempdir_in(parent)
        })
        .await
        .map_err(|e| StorageError::Backend(format!("spill directory task failed: {e}")))?
        .map_err(|e| StorageError::io("failed to create spill directory", e))?;

        info!(
            "Filesystem storage root: {} (spill directory {})",
            root.display(),
            incoming.path().display()
        );
        Ok(Self {
            root,
            incoming: Arc::new(incoming),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // The final path is always rebuilt from the base component, whatever the caller validated.
    fn object_path(&self, name: &str) -> PathBuf {
        self.root.join(base_name(name))
    }

    async fn create_spill_file(&self) -> Result<(SpillFile, fs::File), StorageError> {
        let dir = self.incoming.path().to_path_buf();
        let (temp, handle) = tokio::task::spawn_blocking(move || {
            let temp = tempfile::Builder::new().prefix("upload-").tempfile_in(dir)?;
            let handle = temp.as_file().try_clone()?;
            Ok::<_, std::io::Error>((temp, handle))
        })
        .await
        .map_err(|e| StorageError::Backend(format!("temporary file task failed: {e}")))?
        .map_err(|e| StorageError::io("failed to create temporary file", e))?;

        Ok((SpillFile(Some(temp)), fs::File::from_std(handle)))
    }
}

/// Temporary upload file. Unless persisted, it is unlinked on a blocking
/// thread when dropped.
struct SpillFile(Option<NamedTempFile>);

impl SpillFile {
    fn path(&self) -> Option<&Path> {
        self.0.as_ref().map(|temp| temp.path())
    }

    /// Renames the file onto `target`. On failure the file is removed on the
    /// same blocking thread.
    async fn persist(mut self, target: PathBuf) -> Result<(), StorageError> {
        let temp = self
            .0
            .take()
            .ok_or_else(|| StorageError::Backend("temporary file already released".into()))?;

        tokio::task::spawn_blocking(move || temp.persist(target).map(drop).map_err(|e| e.error))
            .await
            .map_err(|e| StorageError::Backend(format!("rename task failed: {e}")))?
            .map_err(|e| StorageError::io("failed to move upload into place", e))
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        let Some(temp) = self.0.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || drop(temp));
            }
            Err(_) => drop(temp),
        }
    }
}

#[async_trait]
impl StorageBackend for LocalFilesystem {
    async fn save(
        &self,
        name: &str,
        size_hint: SizeHint,
        source: ByteSource,
    ) -> Result<(), StorageError> {
        let final_path = self.object_path(name);
        let (spill, mut file) = self.create_spill_file().await?;

        if let Some(path) = spill.path() {
            debug!(
                "Writing upload for {} to {}",
                final_path.display(),
                path.display()
            );
        }

        let mut reader = source.into_reader();
        let written = tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|e| StorageError::io(format!("failed to write {name}"), e))?;

        if let Some(expected) = size_hint.known() {
            if written != expected {
                return Err(StorageError::Backend(format!(
                    "upload of {name} declared {expected} bytes but received {written}"
                )));
            }
        }

        file.flush()
            .await
            .map_err(|e| StorageError::io(format!("failed to flush {name}"), e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::io(format!("failed to sync {name}"), e))?;
        drop(file);

        spill.persist(final_path.clone()).await?;

        info!(
            "Stored {} ({} bytes) at {}",
            name,
            written,
            final_path.display()
        );
        Ok(())
    }

    async fn read(&self, name: &str) -> Result<ByteStream, StorageError> {
        let path = self.object_path(name);

        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(name.to_string()));
            }
            Err(e) => return Err(StorageError::io(format!("failed to open {name}"), e)),
        };

        let metadata = file
            .metadata()
            .await
            .map_err(|e| StorageError::io(format!("failed to stat {name}"), e))?;
        if !metadata.is_file() {
            return Err(StorageError::NotFound(name.to_string()));
        }

        debug!("Opened {} ({} bytes) for reading", path.display(), metadata.len());
        Ok(Box::pin(ReaderStream::with_capacity(file, READ_BUFFER_SIZE)))
    }

    async fn list(&self) -> Result<MetadataStream, StorageError> {
        let entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| StorageError::io("failed to read storage directory", e))?;

        let listing = stream::unfold(Some(entries), |state| async move {
            let mut entries = state?;
            loop {
                match entries.next_entry().await {
                    Ok(Some(entry)) => match entry_metadata(&entry).await {
                        Ok(Some(meta)) => return Some((Ok(meta), Some(entries))),
                        Ok(None) => continue,
                        Err(e) => return Some((Err(e), Some(entries))),
                    },
                    Ok(None) => return None,
                    Err(e) => {
                        return Some((
                            Err(StorageError::io("failed to read storage directory", e)),
                            None,
                        ));
                    }
                }
            }
        });

        Ok(Box::pin(listing))
    }

    fn kind(&self) -> &'static str {
        "filesystem"
    }
}

/// Metadata for a regular file entry, or `None` for anything else.
async fn entry_metadata(entry: &fs::DirEntry) -> Result<Option<FileMetadata>, StorageError> {
    let metadata = entry
        .metadata()
        .await
        .map_err(|e| StorageError::io("failed to stat directory entry", e))?;
    if !metadata.is_file() {
        return Ok(None);
    }

    let name = entry.file_name().to_string_lossy().to_string();
    let updated_at = metadata
        .modified()
        .map_err(|e| StorageError::io(format!("no modification time for {name}"), e))?;
    let created_at = match metadata.created() {
        Ok(created) => created,
        Err(_) => {
            debug!("Creation time unavailable for {}, using modification time", name);
            updated_at
        }
    };

    Ok(Some(FileMetadata {
        name,
        created_at,
        updated_at,
    }))
}
