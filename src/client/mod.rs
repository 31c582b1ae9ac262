//! Protocol client
//!
//! Connects to a file service and drives upload, download and list calls.

pub mod file_client;

pub use file_client::{Download, FileClient};
