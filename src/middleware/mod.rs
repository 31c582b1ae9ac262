//! Server middleware
//!
//! Provides admission control and call logging.

pub mod admission;
pub mod logging;

pub use admission::{AdmissionController, AdmissionLimits, Permit};
