//! Error types for the lite-dl library.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::BatchId;

/// Errors returned by the engine's public operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The submitted batch is malformed (no files, bad URI, conflicting id).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The durable store could not be read or written.
    ///
    /// The operation that hit this error did not advance any in-memory state,
    /// so retrying the same call is safe.
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client construction or request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The engine has been shut down and no longer accepts commands.
    #[error("Download engine is not running")]
    EngineStopped,

    /// The batch is still being torn down by an earlier delete request.
    #[error("Batch {0} is being deleted")]
    BatchBeingDeleted(BatchId),
}

/// A specialized `Result` type for lite-dl operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of the size-query collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SizeQueryError {
    /// The resource could not be reached at all.
    #[error("resource unreachable: {0}")]
    Unreachable(String),

    /// The request timed out.
    #[error("size request timed out")]
    Timeout,

    /// The server answered with an error status.
    #[error("unexpected response status {0}")]
    Status(u16),

    /// The server answered but did not announce a length.
    #[error("response carries no content length")]
    MissingLength,
}

/// Failure of the transfer collaborator (or of writing what it produced).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Transient network failure; the partial file is kept and can be resumed.
    #[error("network error: {0}")]
    Network(String),

    /// The stream was interrupted before completion.
    #[error("transfer interrupted: {0}")]
    Interrupted(String),

    /// Local storage rejected the bytes.
    #[error("disk error: {0}")]
    Disk(String),

    /// The transfer cannot succeed without caller intervention.
    #[error("transfer failed: {0}")]
    Permanent(String),
}

impl TransferError {
    /// Returns true if the failure should pause the batch rather than fail it.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Interrupted(_))
    }

    /// Maps a permanent failure to the error kind reported to observers.
    #[must_use]
    pub fn kind(&self) -> DownloadErrorKind {
        match self {
            Self::Network(_) | Self::Interrupted(_) => DownloadErrorKind::NetworkError,
            Self::Disk(msg) if is_storage_full(msg) => DownloadErrorKind::StorageFull,
            Self::Disk(_) => DownloadErrorKind::InvalidDestination,
            Self::Permanent(_) => DownloadErrorKind::TransferFailed,
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        Self::Disk(e.to_string())
    }
}

fn is_storage_full(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg.contains("no space") || msg.contains("storage full") || msg.contains("disk full")
}

/// Error payload delivered to observers and persisted with a failed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownloadErrorKind {
    /// Size query for one of the files failed.
    SizeQueryFailed,
    /// The network failed in a way that is not recoverable by resuming.
    NetworkError,
    /// Local storage ran out of space.
    StorageFull,
    /// The destination could not be created or written.
    InvalidDestination,
    /// Any other permanent transfer failure.
    TransferFailed,
    /// The downloaded byte count does not match the announced size.
    SizeMismatch,
}

impl std::fmt::Display for DownloadErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SizeQueryFailed => "size query failed",
            Self::NetworkError => "network error",
            Self::StorageFull => "storage full",
            Self::InvalidDestination => "invalid destination",
            Self::TransferFailed => "transfer failed",
            Self::SizeMismatch => "size mismatch",
        };
        f.write_str(s)
    }
}
