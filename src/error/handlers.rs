//! Error handlers
//!
//! Maps service failures onto the status codes carried by the wire protocol.

use crate::error::types::ServiceError;
use crate::protocol::{Status, StatusCode};
use log::error;

/// Convert a service error to its wire status code
pub fn status_for(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::InvalidInput(_) => StatusCode::InvalidArgument,
        ServiceError::NotFound(_) => StatusCode::NotFound,
        ServiceError::Canceled => StatusCode::Canceled,
        ServiceError::Storage { .. } => StatusCode::Internal,
        ServiceError::Transport(_) => StatusCode::Internal,
    }
}

/// Build the terminal status sent to the client for a failed call.
///
/// Internal failures are reported with a generic message; the details stay in the server log.
pub fn status_from_error(call: &str, err: &ServiceError) -> Status {
    let code = status_for(err);
    let message = match code {
        StatusCode::Internal => {
            error!("{} failed: {}", call, err);
            format!("{call} failed")
        }
        _ => err.to_string(),
    };
    Status::new(code, message)
}
