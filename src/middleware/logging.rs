//! Logging middleware
//!
//! Provides connection and call logging.

use std::net::SocketAddr;
use std::time::Duration;

use log::{info, warn};

use crate::protocol::{Status, StatusCode};

/// Log a client connection
pub fn log_connection(peer: &SocketAddr) {
    info!("Client connected: {}", peer);
}

/// Log a client disconnection
pub fn log_disconnection(peer: &SocketAddr, calls: u64) {
    info!("Client {} disconnected after {} calls", peer, calls);
}

/// Log the start of a call
pub fn log_call(peer: &SocketAddr, call: &str, filename: Option<&str>) {
    match filename {
        Some(name) => info!("{} called by {} (filename: {:?})", call, peer, name),
        None => info!("{} called by {}", call, peer),
    }
}

/// Log the terminal status of a call
pub fn log_call_finished(peer: &SocketAddr, call: &str, status: &Status, elapsed: Duration) {
    if status.code == StatusCode::Ok {
        info!("{} for {} finished in {:?}", call, peer, elapsed);
    } else {
        warn!(
            "{} for {} finished with {:?}: {} ({:?})",
            call, peer, status.code, status.message, elapsed
        );
    }
}
