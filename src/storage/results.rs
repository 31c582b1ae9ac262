//! Storage result types
//!
//! Defines the values exchanged with storage backends.

use std::time::SystemTime;

/// Metadata reported by a backend for one stored file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub name: String,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

/// Total size of an upload, when the caller knows it up front
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeHint {
    Known(u64),
    Unknown,
}

impl SizeHint {
    pub fn known(&self) -> Option<u64> {
        match self {
            SizeHint::Known(len) => Some(*len),
            SizeHint::Unknown => None,
        }
    }
}
