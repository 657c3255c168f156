//! Error types for volume access operations

use thiserror::Error;

/// Main error type for volume access operations
#[derive(Error, Debug)]
pub enum VdsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("out of bounds: {0}")]
    OutOfBounds(String),

    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("buffer too small: request needs {required} bytes, buffer holds {actual}")]
    BufferTooSmall { required: usize, actual: usize },

    #[error("invalid chunk index {index}, layer has {count} chunks")]
    InvalidChunkIndex { index: i64, count: i64 },

    #[error("page for chunk {0} is already checked out")]
    PageAlreadyCheckedOut(i64),

    #[error("page cache full: all {0} pages are checked out")]
    CacheFull(usize),

    #[error("accessor is read-only")]
    ReadOnlyAccess,

    #[error("request was canceled")]
    RequestCanceled,

    #[error("request has already completed")]
    AlreadyCompleted,

    #[error("request has already been canceled")]
    AlreadyCanceled,

    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    #[error("storage backend error: {0}")]
    Store(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Specialized Result type for volume access operations
pub type Result<T> = std::result::Result<T, VdsError>;

impl From<bincode::Error> for VdsError {
    fn from(err: bincode::Error) -> Self {
        VdsError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for VdsError {
    fn from(err: serde_json::Error) -> Self {
        VdsError::Serialization(err.to_string())
    }
}
