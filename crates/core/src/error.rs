//! Error taxonomy shared by every depot crate

use std::io;

/// Errors surfaced by indexing, packing, block stores and materialization
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required parameter was empty, zero or inconsistent
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A file, index or block does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The backing medium refused access
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// An allocation could not be satisfied
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// The operation is not implemented by this store
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Size or checksum mismatch after decompression, or a malformed trailer
    #[error("data corruption: {0}")]
    DataCorruption(String),

    /// Cooperative cancellation was observed
    #[error("operation cancelled")]
    Cancelled,

    /// A content index and a version index disagree
    #[error("validation failed: {0}")]
    Validation(String),

    /// Serialized data could not be parsed
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Any other I/O failure
    #[error("io error: {0}")]
    Io(io::Error),

    /// A job panicked or was aborted by the runtime
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for the errors the cache layer treats as a local miss
    pub fn is_miss(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::PermissionDenied(_))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound(e.to_string()),
            io::ErrorKind::PermissionDenied => Error::PermissionDenied(e.to_string()),
            io::ErrorKind::OutOfMemory => Error::OutOfMemory(e.to_string()),
            io::ErrorKind::Unsupported => Error::Unsupported(e.to_string()),
            _ => Error::Io(e),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            Error::Cancelled
        } else {
            Error::Internal(format!("job panicked: {e}"))
        }
    }
}

/// Result alias used throughout depot
pub type Result<T> = std::result::Result<T, Error>;
