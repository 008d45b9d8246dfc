//! Durable batch records.
//!
//! A [`PersistedBatch`] holds a batch row and all of its file rows, so every
//! write replaces both together. [`TomlDownloadsPersistence`] keeps one TOML
//! file per batch and writes it atomically (write tmp + rename).

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::batch::{BatchId, FileId};
use crate::download_batch::{DownloadBatch, DownloadFile};
use crate::error::{Error, Result};
use crate::status::{DownloadBatchStatus, FileStatus, PauseReason};

/// Stored form of one file of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedFile {
    pub id: FileId,
    pub batch_id: BatchId,
    pub uri: String,
    pub relative_path: PathBuf,
    pub total_bytes: Option<u64>,
    pub downloaded_bytes: u64,
    pub status: FileStatus,
}

/// Stored form of a batch and its files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedBatch {
    pub id: BatchId,
    pub title: String,
    pub status: DownloadBatchStatus,
    pub pause_reason: Option<PauseReason>,
    pub last_modified: DateTime<Utc>,
    pub files: Vec<PersistedFile>,
}

impl From<&DownloadBatch> for PersistedBatch {
    fn from(batch: &DownloadBatch) -> Self {
        Self {
            id: batch.id().clone(),
            title: batch.title().to_string(),
            status: batch.status(),
            pause_reason: batch.pause_reason(),
            last_modified: batch.last_modified(),
            files: batch
                .files()
                .iter()
                .map(|f| PersistedFile {
                    id: f.id.clone(),
                    batch_id: batch.id().clone(),
                    uri: f.uri.clone(),
                    relative_path: f.relative_path.clone(),
                    total_bytes: f.total_bytes,
                    downloaded_bytes: f.downloaded_bytes,
                    status: f.status,
                })
                .collect(),
        }
    }
}

impl PersistedBatch {
    /// Rebuilds the in-memory batch. A record stored with status
    /// [`DownloadBatchStatus::Deletion`] comes back marked deleted.
    #[must_use]
    pub fn into_download_batch(self) -> DownloadBatch {
        let deleted = self.status == DownloadBatchStatus::Deletion;
        let files = self
            .files
            .into_iter()
            .map(|f| DownloadFile {
                id: f.id,
                uri: f.uri,
                relative_path: f.relative_path,
                total_bytes: f.total_bytes,
                downloaded_bytes: f.total_bytes.map_or(f.downloaded_bytes, |t| {
                    f.downloaded_bytes.min(t)
                }),
                status: f.status,
            })
            .collect();
        let mut batch = DownloadBatch::from_parts(
            self.id,
            self.title,
            files,
            self.pause_reason,
            self.last_modified,
        );
        if deleted {
            batch.mark_deleted();
        }
        batch
    }
}

/// Durable store for batch records; the source of truth read at startup.
#[async_trait]
pub trait DownloadsPersistence: Send + Sync {
    /// Every stored batch.
    async fn load_all(&self) -> Result<Vec<PersistedBatch>>;

    /// Inserts or replaces a batch together with all of its files.
    async fn upsert_batch(&self, batch: &PersistedBatch) -> Result<()>;

    /// Removes a batch and its files. Removing an absent batch succeeds.
    async fn delete_batch(&self, batch_id: &BatchId) -> Result<()>;
}

/// One TOML file per batch under a directory.
#[derive(Debug, Clone)]
pub struct TomlDownloadsPersistence {
    dir: PathBuf,
}

impl TomlDownloadsPersistence {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, batch_id: &BatchId) -> PathBuf {
        self.dir.join(format!("{}.toml", batch_id.as_str()))
    }
}

fn persistence_error(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Persistence(format!("{context}: {e}"))
}

#[async_trait]
impl DownloadsPersistence for TomlDownloadsPersistence {
    async fn load_all(&self) -> Result<Vec<PersistedBatch>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(persistence_error(&self.dir.display().to_string(), e)),
        };

        let mut batches = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| persistence_error(&self.dir.display().to_string(), e))?
        {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "toml") {
                continue;
            }
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| persistence_error(&path.display().to_string(), e))?;
            match toml::from_str::<PersistedBatch>(&contents) {
                Ok(batch) => batches.push(batch),
                Err(e) => warn!("Skipping unreadable batch record {}: {e}", path.display()),
            }
        }
        batches.sort_by(|a, b| a.last_modified.cmp(&b.last_modified));
        Ok(batches)
    }

    async fn upsert_batch(&self, batch: &PersistedBatch) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| persistence_error(&self.dir.display().to_string(), e))?;

        let path = self.record_path(&batch.id);
        let tmp_path = path.with_extension("toml.tmp");
        let toml_str =
            toml::to_string(batch).map_err(|e| persistence_error(batch.id.as_str(), e))?;

        tokio::fs::write(&tmp_path, toml_str)
            .await
            .map_err(|e| persistence_error(&tmp_path.display().to_string(), e))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| persistence_error(&path.display().to_string(), e))
    }

    async fn delete_batch(&self, batch_id: &BatchId) -> Result<()> {
        let path = self.record_path(batch_id);
        match tokio::fs::remove_file(&path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                Err(persistence_error(&path.display().to_string(), e))
            }
            _ => Ok(()),
        }
    }
}

/// Volatile store, for embedding without disk state and for tests.
#[derive(Debug, Default)]
pub struct InMemoryDownloadsPersistence {
    batches: Mutex<HashMap<BatchId, PersistedBatch>>,
}

impl InMemoryDownloadsPersistence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DownloadsPersistence for InMemoryDownloadsPersistence {
    async fn load_all(&self) -> Result<Vec<PersistedBatch>> {
        let batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = batches.values().cloned().collect();
        all.sort_by(|a, b| a.last_modified.cmp(&b.last_modified));
        Ok(all)
    }

    async fn upsert_batch(&self, batch: &PersistedBatch) -> Result<()> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(batch.id.clone(), batch.clone());
        Ok(())
    }

    async fn delete_batch(&self, batch_id: &BatchId) -> Result<()> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(batch_id);
        Ok(())
    }
}
