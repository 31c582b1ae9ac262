//! Transfer result types
//!
//! Defines result structures returned by the upload and download relays.

/// Result of a completed upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub filename: String,
    pub bytes: u64,
}

impl UploadSummary {
    /// Confirmation sent back to the uploading client.
    pub fn confirmation(&self) -> String {
        format!("file '{}' uploaded", self.filename)
    }
}

/// Result of a completed download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    pub filename: String,
    pub bytes: u64,
    pub chunks: u64,
}
