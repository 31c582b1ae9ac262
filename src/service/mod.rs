//! File service
//!
//! The facade consumed by the protocol layer: admission, validation and the
//! transfer pipeline composed into upload, download and list.

pub mod file_service;

pub use file_service::{FileService, TransferOptions};
