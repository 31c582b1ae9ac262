//! Server core functionality
//!
//! The TCP listener, the per-connection tasks it spawns, and graceful shutdown.

pub mod core;

pub use core::{SHUTDOWN_GRACE, Server};
