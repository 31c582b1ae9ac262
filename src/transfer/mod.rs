//! Transfer module
//!
//! The chunked transfer pipeline: the conduit that hands upload bytes to a
//! backend, the upload and download relays, and per-call session tracking.

pub mod conduit;
pub mod file_ops;
pub mod results;
pub mod session;

// Re-export key types and functions
pub use conduit::{ByteSource, ConduitClosed, ConduitWriter, conduit};
pub use file_ops::{
    ChunkSink, DEFAULT_CHUNK_SIZE, DEFAULT_CONDUIT_CAPACITY, relay_download, relay_upload,
};
pub use results::{DownloadSummary, UploadSummary};
pub use session::{Phase, TransferSession};
