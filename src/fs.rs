//! File persistence: where batch files live on disk.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncSeekExt;

use crate::batch::BatchId;
use crate::config::{EngineConfig, FileStorage};

/// Abstraction over the storage backend for downloaded files.
#[async_trait]
pub trait FilePersistence: Send + Sync {
    /// Root directory under which batch directories are created.
    fn root(&self) -> &Path;

    /// Destination handle of a file: `<root>/<batch id>/<relative path>`.
    fn resolve(&self, batch_id: &BatchId, relative_path: &Path) -> PathBuf {
        self.root().join(batch_id.as_str()).join(relative_path)
    }

    /// Size of the partial or complete file, 0 if it does not exist.
    async fn current_size(&self, path: &Path) -> std::io::Result<u64>;

    /// Opens the file positioned at `offset`, creating parent directories
    /// and dropping anything already written past `offset`.
    async fn open_for_append(&self, path: &Path, offset: u64) -> std::io::Result<tokio::fs::File>;

    /// Removes every file of a batch. Missing files are not an error.
    async fn delete_batch(&self, batch_id: &BatchId) -> std::io::Result<()>;

    /// Moves an existing file to `to`, returning its size.
    async fn import(&self, from: &Path, to: &Path) -> std::io::Result<u64>;
}

/// [`FilePersistence`] backed by the local file system via `tokio::fs`.
#[derive(Debug, Clone)]
pub struct LocalFilePersistence {
    root: PathBuf,
    storage: FileStorage,
}

impl LocalFilePersistence {
    /// Storage private to the engine.
    #[must_use]
    pub fn internal(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            storage: FileStorage::Internal,
        }
    }

    /// Storage in a user-visible directory.
    #[must_use]
    pub fn external(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            storage: FileStorage::External,
        }
    }

    /// Picks the backend the configuration asks for.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            root: config.storage_root(),
            storage: config.file_storage,
        }
    }

    #[must_use]
    pub const fn storage(&self) -> FileStorage {
        self.storage
    }
}

#[async_trait]
impl FilePersistence for LocalFilePersistence {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn current_size(&self, path: &Path) -> std::io::Result<u64> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e),
        }
    }

    async fn open_for_append(&self, path: &Path, offset: u64) -> std::io::Result<tokio::fs::File> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .await?;
        let len = file.metadata().await?.len();
        if len < offset {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "{} holds {len} bytes, cannot resume at {offset}",
                    path.display()
                ),
            ));
        }
        if len > offset {
            file.set_len(offset).await?;
        }
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(file)
    }

    async fn delete_batch(&self, batch_id: &BatchId) -> std::io::Result<()> {
        let dir = self.root.join(batch_id.as_str());
        match tokio::fs::remove_dir_all(&dir).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    async fn import(&self, from: &Path, to: &Path) -> std::io::Result<u64> {
        let size = tokio::fs::metadata(from).await?.len();
        if from == to {
            return Ok(size);
        }
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Rename fails across mount points; fall back to copy + remove.
        if tokio::fs::rename(from, to).await.is_err() {
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await?;
        }
        Ok(size)
    }
}
