//! Import of downloads tracked by an earlier download store.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::batch::{Batch, FileId};

/// How far a legacy download had progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationKind {
    /// Every file finished; imported as COMPLETED with sizes from disk.
    Complete,
    /// Some bytes were retained; imported and scheduled like a submission.
    Partial,
}

/// Where a legacy file currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigratedFile {
    pub file_id: FileId,
    pub original_path: PathBuf,
}

/// One legacy download, consumed once by
/// [`DownloadManager::import_migrations`](crate::DownloadManager::import_migrations).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub batch: Batch,
    pub kind: MigrationKind,
    pub files: Vec<MigratedFile>,
    /// When the legacy store last touched the download. Restored batches
    /// are ordered by this; `None` stamps the import time.
    pub last_modified: Option<DateTime<Utc>>,
}

impl Migration {
    #[must_use]
    pub const fn new(batch: Batch, kind: MigrationKind) -> Self {
        Self {
            batch,
            kind,
            files: Vec::new(),
            last_modified: None,
        }
    }

    /// Adds a legacy file to adopt as the batch file `file_id`.
    #[must_use]
    pub fn with_file(mut self, file_id: impl Into<FileId>, original_path: impl Into<PathBuf>) -> Self {
        self.files.push(MigratedFile {
            file_id: file_id.into(),
            original_path: original_path.into(),
        });
        self
    }

    #[must_use]
    pub const fn with_last_modified(mut self, at: DateTime<Utc>) -> Self {
        self.last_modified = Some(at);
        self
    }
}
