//! Error types
//!
//! Defines domain-specific error types for each layer of the file service.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::protocol::{Status, StatusCode};

/// Filename validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("filename cannot be empty")]
    Empty,
    #[error("invalid filename (possible traversal): {0}")]
    Traversal(String),
}

/// Storage backend errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Wraps an I/O error with a short description of what was being attempted.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        StorageError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Transport (connection and framing) errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
    #[error("malformed frame: {0}")]
    Codec(#[from] postcard::Error),
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(&'static str),
    #[error("connection closed in the middle of a call")]
    ConnectionClosed,
}

/// The operation class a failure belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Upload,
    Download,
    List,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Upload => write!(f, "upload"),
            Operation::Download => write!(f, "download"),
            Operation::List => write!(f, "list"),
        }
    }
}

/// Errors surfaced by the file service facade
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("operation canceled")]
    Canceled,
    #[error("storage error on {operation}{}: {source}", filename_suffix(.filename))]
    Storage {
        operation: Operation,
        filename: Option<String>,
        #[source]
        source: StorageError,
    },
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

fn filename_suffix(filename: &Option<String>) -> String {
    match filename {
        Some(name) => format!(" of '{name}'"),
        None => String::new(),
    }
}

impl ServiceError {
    /// Wraps a backend error with the operation and file it happened on.
    ///
    /// A backend `NotFound` is lifted to the service-level `NotFound`.
    pub fn storage(operation: Operation, filename: Option<&str>, source: StorageError) -> Self {
        match source {
            StorageError::NotFound(name) => ServiceError::NotFound(name),
            source => ServiceError::Storage {
                operation,
                filename: filename.map(str::to_string),
                source,
            },
        }
    }
}

/// Errors seen by the protocol client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("server returned {0}")]
    Status(Status),
    #[error("local I/O error: {0}")]
    Io(#[source] io::Error),
    #[error("unexpected {0} frame from server")]
    Protocol(&'static str),
}

impl ClientError {
    /// The remote status code, when the server reported one.
    pub fn code(&self) -> Option<StatusCode> {
        match self {
            ClientError::Status(status) => Some(status.code),
            _ => None,
        }
    }
}

impl From<ValidationError> for ServiceError {
    fn from(error: ValidationError) -> Self {
        ServiceError::InvalidInput(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_not_found_becomes_service_not_found() {
        let err = ServiceError::storage(
            Operation::Download,
            Some("missing.txt"),
            StorageError::NotFound("missing.txt".into()),
        );
        assert!(matches!(err, ServiceError::NotFound(name) if name == "missing.txt"));
    }

    #[test]
    fn storage_error_carries_operation_context() {
        let err = ServiceError::storage(
            Operation::Upload,
            Some("a.txt"),
            StorageError::Backend("disk full".into()),
        );
        assert_eq!(
            err.to_string(),
            "storage error on upload of 'a.txt': storage backend error: disk full"
        );

        let err = ServiceError::storage(Operation::List, None, StorageError::Backend("x".into()));
        assert_eq!(err.to_string(), "storage error on list: storage backend error: x");
    }

    #[test]
    fn validation_error_is_invalid_input() {
        let err: ServiceError = ValidationError::Empty.into();
        assert!(matches!(err, ServiceError::InvalidInput(msg) if msg == "filename cannot be empty"));
    }
}
