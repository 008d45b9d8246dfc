//! The per-batch state machine.
//!
//! A [`DownloadBatch`] aggregates its files' statuses into one batch status
//! and enforces the byte-accounting invariants: downloaded bytes never
//! exceed a known total, never go backwards while downloading, and never
//! change once the batch is completed or deleted.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::batch::{Batch, BatchId, FileId};
use crate::error::DownloadErrorKind;
use crate::status::{BatchSnapshot, DownloadBatchStatus, FileStatus, PauseReason, percentage};

/// One file transfer tracked by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadFile {
    pub id: FileId,
    pub uri: String,
    pub relative_path: PathBuf,
    /// `None` until a size query succeeds.
    pub total_bytes: Option<u64>,
    pub downloaded_bytes: u64,
    pub status: FileStatus,
}

impl DownloadFile {
    const fn is_pending(&self) -> bool {
        !matches!(self.status, FileStatus::Completed | FileStatus::Error(_))
    }
}

/// In-memory view of one batch, keyed by the same id as its persisted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadBatch {
    id: BatchId,
    title: String,
    files: Vec<DownloadFile>,
    deleted: bool,
    pause_reason: Option<PauseReason>,
    last_modified: DateTime<Utc>,
}

/// Derives the batch status from file statuses.
///
/// Any error wins, then all-completed, then any-downloading, then
/// all-remaining-paused; anything else is queued.
pub fn aggregate_status<I>(statuses: I) -> DownloadBatchStatus
where
    I: IntoIterator<Item = FileStatus>,
{
    let mut all_completed = true;
    let mut any_downloading = false;
    let mut any_remaining = false;
    let mut all_remaining_paused = true;

    for status in statuses {
        match status {
            FileStatus::Error(_) => return DownloadBatchStatus::Error,
            FileStatus::Completed => {}
            FileStatus::Downloading => {
                all_completed = false;
                any_downloading = true;
                any_remaining = true;
                all_remaining_paused = false;
            }
            FileStatus::Paused => {
                all_completed = false;
                any_remaining = true;
            }
            FileStatus::Queued => {
                all_completed = false;
                any_remaining = true;
                all_remaining_paused = false;
            }
        }
    }

    if all_completed {
        DownloadBatchStatus::Completed
    } else if any_downloading {
        DownloadBatchStatus::Downloading
    } else if any_remaining && all_remaining_paused {
        DownloadBatchStatus::Paused
    } else {
        DownloadBatchStatus::Queued
    }
}

impl DownloadBatch {
    /// Creates a fresh batch from a validated request, all files queued.
    #[must_use]
    pub fn from_request(batch: &Batch) -> Self {
        let files = batch
            .files()
            .iter()
            .map(|f| DownloadFile {
                id: f.id.clone(),
                uri: f.uri.clone(),
                relative_path: f.relative_path.clone(),
                total_bytes: None,
                downloaded_bytes: 0,
                status: FileStatus::Queued,
            })
            .collect();
        Self {
            id: batch.id().clone(),
            title: batch.title().to_string(),
            files,
            deleted: false,
            pause_reason: None,
            last_modified: Utc::now(),
        }
    }

    /// Rebuilds a batch from stored parts.
    #[must_use]
    pub fn from_parts(
        id: BatchId,
        title: String,
        files: Vec<DownloadFile>,
        pause_reason: Option<PauseReason>,
        last_modified: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            title,
            files,
            deleted: false,
            pause_reason,
            last_modified,
        }
    }

    #[must_use]
    pub const fn id(&self) -> &BatchId {
        &self.id
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn files(&self) -> &[DownloadFile] {
        &self.files
    }

    #[must_use]
    pub fn file(&self, file_id: &FileId) -> Option<&DownloadFile> {
        self.files.iter().find(|f| &f.id == file_id)
    }

    #[must_use]
    pub const fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    /// Reason for the current pause, if the batch is paused.
    #[must_use]
    pub fn pause_reason(&self) -> Option<PauseReason> {
        (self.status() == DownloadBatchStatus::Paused)
            .then_some(self.pause_reason)
            .flatten()
    }

    #[must_use]
    pub fn status(&self) -> DownloadBatchStatus {
        if self.deleted {
            DownloadBatchStatus::Deletion
        } else {
            aggregate_status(self.files.iter().map(|f| f.status))
        }
    }

    /// The first file error, in definition order.
    #[must_use]
    pub fn error(&self) -> Option<DownloadErrorKind> {
        self.files.iter().find_map(|f| match f.status {
            FileStatus::Error(kind) => Some(kind),
            _ => None,
        })
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Sum of downloaded bytes across files.
    #[must_use]
    pub fn bytes_downloaded(&self) -> u64 {
        self.files.iter().map(|f| f.downloaded_bytes).sum()
    }

    /// Sum of file sizes, or `None` while any size is unknown.
    #[must_use]
    pub fn bytes_total(&self) -> Option<u64> {
        self.files.iter().map(|f| f.total_bytes).sum()
    }

    /// The next file to transfer, in definition order.
    #[must_use]
    pub fn next_pending_file(&self) -> Option<&DownloadFile> {
        self.files.iter().find(|f| f.is_pending())
    }

    /// Whether the request describes exactly this batch's content.
    #[must_use]
    pub fn has_same_content(&self, request: &Batch) -> bool {
        self.title == request.title()
            && self.files.len() == request.files().len()
            && self.files.iter().zip(request.files()).all(|(mine, theirs)| {
                mine.id == theirs.id
                    && mine.uri == theirs.uri
                    && mine.relative_path == theirs.relative_path
            })
    }

    /// Marks `file_id` as the file being transferred.
    ///
    /// Returns false if the batch is paused, terminal, or the file is not
    /// pending.
    pub fn begin_file(&mut self, file_id: &FileId) -> bool {
        if self.is_terminal() || self.status() == DownloadBatchStatus::Paused {
            return false;
        }
        let Some(file) = self.file_mut(file_id) else {
            return false;
        };
        if !file.is_pending() {
            return false;
        }
        file.status = FileStatus::Downloading;
        self.pause_reason = None;
        self.touch();
        true
    }

    /// Records a successful size query.
    pub fn set_total_bytes(&mut self, file_id: &FileId, total: u64) -> bool {
        if self.is_terminal() {
            return false;
        }
        let Some(file) = self.file_mut(file_id) else {
            return false;
        };
        if file.total_bytes == Some(total) {
            return false;
        }
        file.total_bytes = Some(total);
        if file.downloaded_bytes > total {
            file.status = FileStatus::Error(DownloadErrorKind::SizeMismatch);
            self.requeue_in_flight();
        }
        self.touch();
        true
    }

    /// Applies a byte-progress report.
    ///
    /// The value only moves forward and is clamped to a known total; reports
    /// for completed or deleted batches are dropped.
    pub fn update_downloaded(&mut self, file_id: &FileId, downloaded: u64) -> bool {
        if self.is_terminal() {
            return false;
        }
        let Some(file) = self.file_mut(file_id) else {
            return false;
        };
        if !file.is_pending() {
            return false;
        }
        let bounded = file.total_bytes.map_or(downloaded, |t| downloaded.min(t));
        if bounded <= file.downloaded_bytes {
            return false;
        }
        file.downloaded_bytes = bounded;
        self.touch();
        true
    }

    /// Sets the byte count to what is actually retained on disk before a
    /// transfer (re)starts. Unlike progress reports this may move backwards.
    pub fn reconcile_downloaded(&mut self, file_id: &FileId, on_disk: u64) -> bool {
        if self.is_terminal() {
            return false;
        }
        let Some(file) = self.file_mut(file_id) else {
            return false;
        };
        if !file.is_pending() {
            return false;
        }
        let bounded = file.total_bytes.map_or(on_disk, |t| on_disk.min(t));
        if bounded == file.downloaded_bytes {
            return false;
        }
        file.downloaded_bytes = bounded;
        self.touch();
        true
    }

    /// Marks the end of a file's byte stream.
    ///
    /// The file completes if its byte count matches the known size (or the
    /// size was never known); otherwise it fails with a size mismatch.
    pub fn finish_file(&mut self, file_id: &FileId) -> bool {
        if self.is_terminal() {
            return false;
        }
        let Some(file) = self.file_mut(file_id) else {
            return false;
        };
        if !file.is_pending() {
            return false;
        }
        match file.total_bytes {
            Some(total) if total != file.downloaded_bytes => {
                file.status = FileStatus::Error(DownloadErrorKind::SizeMismatch);
                self.requeue_in_flight();
            }
            Some(_) => file.status = FileStatus::Completed,
            None => {
                file.total_bytes = Some(file.downloaded_bytes);
                file.status = FileStatus::Completed;
            }
        }
        self.touch();
        true
    }

    /// Fails one file; by aggregation the whole batch becomes ERROR.
    pub fn fail_file(&mut self, file_id: &FileId, kind: DownloadErrorKind) -> bool {
        if self.is_terminal() {
            return false;
        }
        let Some(file) = self.file_mut(file_id) else {
            return false;
        };
        if !file.is_pending() {
            return false;
        }
        file.status = FileStatus::Error(kind);
        self.requeue_in_flight();
        self.touch();
        true
    }

    /// Pauses every pending file. No effect on terminal batches.
    pub fn pause(&mut self, reason: PauseReason) -> bool {
        if self.is_terminal() {
            return false;
        }
        // A network pause never downgrades a user pause.
        let already = self.status() == DownloadBatchStatus::Paused;
        if already && (self.pause_reason == Some(reason) || reason == PauseReason::Network) {
            return false;
        }
        for file in self.files.iter_mut().filter(|f| f.is_pending()) {
            file.status = FileStatus::Paused;
        }
        self.pause_reason = Some(reason);
        self.touch();
        true
    }

    /// Puts paused files back in the queue. Failed files are queued again as
    /// well: an explicit resume is the caller's retry. Completed files and
    /// deleted batches are untouched.
    pub fn resume(&mut self) -> bool {
        if self.deleted || self.status() == DownloadBatchStatus::Completed {
            return false;
        }
        let mut changed = false;
        for file in &mut self.files {
            if matches!(file.status, FileStatus::Paused | FileStatus::Error(_)) {
                file.status = FileStatus::Queued;
                changed = true;
            }
        }
        if changed {
            self.pause_reason = None;
            self.touch();
        }
        changed
    }

    /// Demotes files that were mid-transfer when the process stopped.
    ///
    /// Returns true if the batch was DOWNLOADING and is now PAUSED.
    pub fn reconcile_after_restart(&mut self) -> bool {
        if self.status() != DownloadBatchStatus::Downloading {
            return false;
        }
        self.pause(PauseReason::Network)
    }

    /// Applies the explicit deletion command.
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        self.touch();
    }

    /// Snapshot for observers and queries.
    #[must_use]
    pub fn snapshot(&self, eta: Option<Duration>) -> BatchSnapshot {
        let status = self.status();
        if status == DownloadBatchStatus::Deletion {
            return BatchSnapshot::deleted(self.id.clone(), self.title.clone());
        }
        let bytes_total = self.bytes_total();
        let bytes_downloaded = self.bytes_downloaded();
        BatchSnapshot {
            batch_id: self.id.clone(),
            title: self.title.clone(),
            status,
            percentage: bytes_total.map(|total| percentage(bytes_downloaded, total)),
            bytes_downloaded,
            bytes_total,
            error: self.error(),
            pause_reason: self.pause_reason(),
            eta: (status == DownloadBatchStatus::Downloading).then_some(eta).flatten(),
        }
    }

    /// A failed batch has no transfer running; files that were in flight go
    /// back to the queue for the next resume.
    fn requeue_in_flight(&mut self) {
        for file in &mut self.files {
            if file.status == FileStatus::Downloading {
                file.status = FileStatus::Queued;
            }
        }
    }

    fn file_mut(&mut self, file_id: &FileId) -> Option<&mut DownloadFile> {
        self.files.iter_mut().find(|f| &f.id == file_id)
    }

    /// Advances the modification timestamp, strictly increasing even when
    /// the wall clock does not move.
    fn touch(&mut self) {
        let now = Utc::now();
        self.last_modified = if now > self.last_modified {
            now
        } else {
            self.last_modified + TimeDelta::milliseconds(1)
        };
    }
}
