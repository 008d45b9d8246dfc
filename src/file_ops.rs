//! Collaborators that perform the actual per-file work.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::error::{SizeQueryError, TransferError};
use crate::fs::FilePersistence;

/// Chunks of a file body, in order.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransferError>> + Send>>;

/// Determines the total size of a remote file.
#[async_trait]
pub trait FileSizeRequester: Send + Sync {
    async fn request_file_size(&self, uri: &str) -> Result<u64, SizeQueryError>;
}

/// Streams a remote file's bytes starting at `offset`.
#[async_trait]
pub trait FileDownloader: Send + Sync {
    async fn start_download(&self, uri: &str, offset: u64) -> Result<ByteStream, TransferError>;
}

/// The size-query, transfer and storage collaborators used by workers.
#[derive(Clone)]
pub struct FileOperations {
    pub size_requester: Arc<dyn FileSizeRequester>,
    pub downloader: Arc<dyn FileDownloader>,
    pub file_persistence: Arc<dyn FilePersistence>,
}

impl FileOperations {
    #[must_use]
    pub fn new(
        size_requester: Arc<dyn FileSizeRequester>,
        downloader: Arc<dyn FileDownloader>,
        file_persistence: Arc<dyn FilePersistence>,
    ) -> Self {
        Self {
            size_requester,
            downloader,
            file_persistence,
        }
    }
}
