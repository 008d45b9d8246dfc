//! Status values and the snapshot delivered to observers.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::BatchId;
use crate::error::DownloadErrorKind;

/// Batch-level status.
///
/// Everything except [`Deletion`](Self::Deletion) is derived from the file
/// statuses; deletion is an explicit command that overrides aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownloadBatchStatus {
    Queued,
    Downloading,
    Paused,
    Deletion,
    Error,
    Completed,
}

impl DownloadBatchStatus {
    /// Terminal statuses are never suppressed and allow no further progress.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Deletion)
    }
}

impl fmt::Display for DownloadBatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Deletion => "deleted",
            Self::Error => "error",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// File-level status, a subset of the batch statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Error(DownloadErrorKind),
}

impl FileStatus {
    #[must_use]
    pub const fn is_completed(self) -> bool {
        matches!(self, Self::Completed)
    }

    #[must_use]
    pub const fn is_error(self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Why a batch sits in [`DownloadBatchStatus::Paused`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PauseReason {
    /// The caller asked for it; only an explicit resume continues it.
    User,
    /// The allowed connection type was unavailable or the stream was
    /// interrupted; network recovery may resume it.
    Network,
}

/// Point-in-time view of a batch, as delivered to callbacks.
///
/// Snapshots taken outside the engine's execution context (queries) may
/// already be stale when read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSnapshot {
    pub batch_id: BatchId,
    pub title: String,
    pub status: DownloadBatchStatus,
    /// Integer percentage; `None` while any file size is unknown.
    pub percentage: Option<u8>,
    pub bytes_downloaded: u64,
    /// Sum of file sizes; `None` while any file size is unknown.
    pub bytes_total: Option<u64>,
    pub error: Option<DownloadErrorKind>,
    pub pause_reason: Option<PauseReason>,
    /// Best-effort remaining time; display data only.
    pub eta: Option<Duration>,
}

impl BatchSnapshot {
    /// Snapshot announcing that a batch has been removed.
    #[must_use]
    pub fn deleted(batch_id: BatchId, title: String) -> Self {
        Self {
            batch_id,
            title,
            status: DownloadBatchStatus::Deletion,
            percentage: None,
            bytes_downloaded: 0,
            bytes_total: None,
            error: None,
            pause_reason: None,
            eta: None,
        }
    }

    /// Percentage used for comparisons, counting "unknown" as zero.
    #[must_use]
    pub fn percentage_or_zero(&self) -> u8 {
        self.percentage.unwrap_or(0)
    }
}

/// Integer percentage of `downloaded` over `total`, clamped to 0..=100.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn percentage(downloaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = u128::from(downloaded.min(total)) * 100 / u128::from(total);
    pct as u8
}
