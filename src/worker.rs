//! Per-batch transfer worker.
//!
//! A worker first queries every size the batch does not know yet, so the
//! batch has a total before any byte moves. It then walks the pending files
//! in order with a resumable transfer from the bytes already on disk.
//! It never touches batch state itself. Every observation goes back to the
//! downloader as a [`WorkerReport`], and the downloader decides what it means.

use std::path::PathBuf;

use futures::StreamExt;
use log::{debug, warn};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchId, FileId};
use crate::connection::ConnectionChecker;
use crate::downloader::Command;
use crate::error::{DownloadErrorKind, TransferError};
use crate::file_ops::FileOperations;

/// A file the worker should transfer.
#[derive(Debug, Clone)]
pub struct PlannedFile {
    pub id: FileId,
    pub uri: String,
    /// Resolved destination handle.
    pub path: PathBuf,
    pub total_bytes: Option<u64>,
}

/// What a worker observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The transfer of a file is starting at `on_disk` bytes.
    FileStarted { file_id: FileId, on_disk: u64 },
    SizeKnown { file_id: FileId, total: u64 },
    Progress { file_id: FileId, downloaded: u64 },
    FileFinished { file_id: FileId },
    FileFailed {
        file_id: FileId,
        kind: DownloadErrorKind,
    },
    /// Connectivity was lost or the stream broke; partial bytes are kept.
    Interrupted { reason: String },
    /// Always the last event of a run.
    Exited,
}

/// A [`WorkerEvent`] tagged with the run that produced it.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub batch_id: BatchId,
    pub run_id: u64,
    pub event: WorkerEvent,
}

/// Everything a worker run needs.
pub struct WorkerContext {
    pub batch_id: BatchId,
    pub run_id: u64,
    pub files: Vec<PlannedFile>,
    pub ops: FileOperations,
    pub checker: ConnectionChecker,
    pub token: CancellationToken,
    pub events: mpsc::UnboundedSender<Command>,
}

enum Outcome {
    Continue,
    Stop,
}

impl WorkerContext {
    fn report(&self, event: WorkerEvent) {
        let _ = self.events.send(Command::Worker(WorkerReport {
            batch_id: self.batch_id.clone(),
            run_id: self.run_id,
            event,
        }));
    }

    fn interrupted(&self, reason: impl Into<String>) -> Outcome {
        let reason = reason.into();
        debug!("Batch {} interrupted: {reason}", self.batch_id);
        self.report(WorkerEvent::Interrupted { reason });
        Outcome::Stop
    }

    fn failed(&self, file_id: &FileId, kind: DownloadErrorKind) -> Outcome {
        self.report(WorkerEvent::FileFailed {
            file_id: file_id.clone(),
            kind,
        });
        Outcome::Stop
    }

    /// A transfer error becomes a pause when it is transient or when the
    /// allowed connection went away, a failure otherwise.
    fn transfer_failed(&self, file_id: &FileId, error: &TransferError) -> Outcome {
        if error.is_transient() || !self.checker.is_allowed_connection_available() {
            self.interrupted(error.to_string())
        } else {
            warn!("Transfer of {file_id} in batch {} failed: {error}", self.batch_id);
            self.failed(file_id, error.kind())
        }
    }
}

/// Runs one worker to completion. Sends [`WorkerEvent::Exited`] last, even
/// when cancelled.
pub async fn run(mut ctx: WorkerContext) {
    debug!(
        "Worker {} started for batch {} ({} files)",
        ctx.run_id,
        ctx.batch_id,
        ctx.files.len()
    );
    let mut files = std::mem::take(&mut ctx.files);
    if matches!(query_sizes(&ctx, &mut files).await, Outcome::Continue) {
        for file in &files {
            if ctx.token.is_cancelled() {
                break;
            }
            if matches!(transfer_file(&ctx, file).await, Outcome::Stop) {
                break;
            }
        }
    }
    debug!("Worker {} for batch {} exiting", ctx.run_id, ctx.batch_id);
    ctx.report(WorkerEvent::Exited);
}

/// Fills in every unknown size, in file order. A failed query stops the run.
async fn query_sizes(ctx: &WorkerContext, files: &mut [PlannedFile]) -> Outcome {
    for file in files.iter_mut().filter(|f| f.total_bytes.is_none()) {
        if !ctx.checker.is_allowed_connection_available() {
            return ctx.interrupted("allowed connection unavailable");
        }
        let query = tokio::select! {
            () = ctx.token.cancelled() => return Outcome::Stop,
            result = ctx.ops.size_requester.request_file_size(&file.uri) => result,
        };
        match query {
            Ok(total) => {
                ctx.report(WorkerEvent::SizeKnown {
                    file_id: file.id.clone(),
                    total,
                });
                file.total_bytes = Some(total);
            }
            Err(_) if !ctx.checker.is_allowed_connection_available() => {
                return ctx.interrupted("allowed connection lost during size query");
            }
            Err(e) => {
                warn!("Size query for {} failed: {e}", file.uri);
                return ctx.failed(&file.id, DownloadErrorKind::SizeQueryFailed);
            }
        }
    }
    Outcome::Continue
}

async fn transfer_file(ctx: &WorkerContext, file: &PlannedFile) -> Outcome {
    if !ctx.checker.is_allowed_connection_available() {
        return ctx.interrupted("allowed connection unavailable");
    }
    let Some(total) = file.total_bytes else {
        return ctx.failed(&file.id, DownloadErrorKind::SizeQueryFailed);
    };

    let fs = &ctx.ops.file_persistence;
    let on_disk = match fs.current_size(&file.path).await {
        Ok(size) => size,
        Err(e) => return ctx.transfer_failed(&file.id, &TransferError::from(e)),
    };
    // More bytes than the file has means the partial file is not ours.
    let offset = if on_disk > total { 0 } else { on_disk };
    ctx.report(WorkerEvent::FileStarted {
        file_id: file.id.clone(),
        on_disk: offset,
    });

    let mut out = match fs.open_for_append(&file.path, offset).await {
        Ok(out) => out,
        Err(e) => return ctx.transfer_failed(&file.id, &TransferError::from(e)),
    };
    if offset == total {
        ctx.report(WorkerEvent::FileFinished {
            file_id: file.id.clone(),
        });
        return Outcome::Continue;
    }

    let started = tokio::select! {
        () = ctx.token.cancelled() => return Outcome::Stop,
        result = ctx.ops.downloader.start_download(&file.uri, offset) => result,
    };
    let mut stream = match started {
        Ok(stream) => stream,
        Err(e) => return ctx.transfer_failed(&file.id, &e),
    };

    let mut connectivity = ctx.checker.subscribe();
    let mut watching = true;
    let mut downloaded = offset;

    loop {
        tokio::select! {
            biased;
            () = ctx.token.cancelled() => {
                let _ = out.flush().await;
                return Outcome::Stop;
            }
            changed = connectivity.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                } else if !ctx.checker.is_allowed_connection_available() {
                    let _ = out.flush().await;
                    return ctx.interrupted("allowed connection lost");
                }
            }
            chunk = stream.next() => match chunk {
                None => break,
                Some(Ok(bytes)) => {
                    if !ctx.checker.is_allowed_connection_available() {
                        let _ = out.flush().await;
                        return ctx.interrupted("allowed connection lost");
                    }
                    let len = bytes.len() as u64;
                    if downloaded + len > total {
                        warn!(
                            "{} sent more than the announced {total} bytes",
                            file.uri
                        );
                        let _ = out.flush().await;
                        return ctx.failed(&file.id, DownloadErrorKind::SizeMismatch);
                    }
                    if let Err(e) = out.write_all(&bytes).await {
                        return ctx.transfer_failed(&file.id, &TransferError::from(e));
                    }
                    downloaded += len;
                    ctx.report(WorkerEvent::Progress {
                        file_id: file.id.clone(),
                        downloaded,
                    });
                }
                Some(Err(e)) => {
                    let _ = out.flush().await;
                    return ctx.transfer_failed(&file.id, &e);
                }
            },
        }
    }

    if let Err(e) = out.flush().await {
        return ctx.transfer_failed(&file.id, &TransferError::from(e));
    }
    if let Err(e) = out.sync_all().await {
        return ctx.transfer_failed(&file.id, &TransferError::from(e));
    }
    ctx.report(WorkerEvent::FileFinished {
        file_id: file.id.clone(),
    });
    Outcome::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use bytes::Bytes;
    use tempfile::TempDir;

    use crate::config::ConnectionType;
    use crate::connection::{ManualConnectivity, NetworkState};
    use crate::error::SizeQueryError;
    use crate::file_ops::{ByteStream, FileDownloader, FileSizeRequester};
    use crate::fs::{FilePersistence, LocalFilePersistence};

    struct Remote {
        files: HashMap<String, Vec<u8>>,
    }

    #[async_trait]
    impl FileSizeRequester for Remote {
        async fn request_file_size(&self, uri: &str) -> Result<u64, SizeQueryError> {
            self.files
                .get(uri)
                .map(|b| b.len() as u64)
                .ok_or(SizeQueryError::Status(404))
        }
    }

    #[async_trait]
    impl FileDownloader for Remote {
        async fn start_download(&self, uri: &str, offset: u64) -> Result<ByteStream, TransferError> {
            let body = self
                .files
                .get(uri)
                .ok_or_else(|| TransferError::Permanent("404".into()))?;
            let rest = body[usize::try_from(offset).unwrap()..].to_vec();
            let chunks: Vec<Result<Bytes, TransferError>> = rest
                .chunks(4)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    struct Harness {
        dir: TempDir,
        fs: Arc<LocalFilePersistence>,
        remote: Arc<Remote>,
        connectivity: ManualConnectivity,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let fs = Arc::new(LocalFilePersistence::internal(dir.path()));
            let mut files = HashMap::new();
            files.insert("mem://a".to_string(), b"abcdefghij".to_vec());
            files.insert("mem://b".to_string(), b"0123456789abcdef".to_vec());
            Self {
                dir,
                fs,
                remote: Arc::new(Remote { files }),
                connectivity: ManualConnectivity::default(),
            }
        }

        fn planned(&self, id: &str, uri: &str, total: Option<u64>) -> PlannedFile {
            PlannedFile {
                id: FileId::from(id),
                uri: uri.to_string(),
                path: self.fs.resolve(&BatchId::from("w"), std::path::Path::new(id)),
                total_bytes: total,
            }
        }

        async fn run(&self, files: Vec<PlannedFile>) -> Vec<WorkerEvent> {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let ctx = WorkerContext {
                batch_id: BatchId::from("w"),
                run_id: 7,
                files,
                ops: FileOperations::new(self.remote.clone(), self.remote.clone(), self.fs.clone()),
                checker: ConnectionChecker::new(
                    Arc::new(self.connectivity.clone()),
                    ConnectionType::All,
                ),
                token: CancellationToken::new(),
                events: tx,
            };
            run(ctx).await;
            let mut events = Vec::new();
            while let Ok(Command::Worker(report)) = rx.try_recv() {
                assert_eq!(report.run_id, 7);
                events.push(report.event);
            }
            events
        }
    }

    #[tokio::test]
    async fn transfers_files_in_order() {
        let h = Harness::new();
        let events = h
            .run(vec![
                h.planned("0", "mem://a", None),
                h.planned("1", "mem://b", Some(16)),
            ])
            .await;

        assert_eq!(
            events.first(),
            Some(&WorkerEvent::SizeKnown {
                file_id: FileId::from("0"),
                total: 10
            })
        );
        let finished: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::FileFinished { file_id } => Some(file_id.as_str().to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(finished, vec!["0", "1"]);
        assert_eq!(events.last(), Some(&WorkerEvent::Exited));
        assert_eq!(
            std::fs::read(h.dir.path().join("w").join("1")).unwrap(),
            b"0123456789abcdef"
        );
    }

    #[tokio::test]
    async fn resumes_from_bytes_on_disk() {
        let h = Harness::new();
        let path = h.dir.path().join("w").join("0");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"abcd").unwrap();

        let events = h.run(vec![h.planned("0", "mem://a", Some(10))]).await;
        assert_eq!(
            events[0],
            WorkerEvent::FileStarted {
                file_id: FileId::from("0"),
                on_disk: 4
            }
        );
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdefghij");
    }

    #[tokio::test]
    async fn size_query_failure_stops_the_run() {
        let h = Harness::new();
        let events = h
            .run(vec![
                h.planned("0", "mem://missing", None),
                h.planned("1", "mem://a", None),
            ])
            .await;
        assert_eq!(
            events,
            vec![
                WorkerEvent::FileFailed {
                    file_id: FileId::from("0"),
                    kind: DownloadErrorKind::SizeQueryFailed
                },
                WorkerEvent::Exited
            ]
        );
    }

    #[tokio::test]
    async fn every_size_is_known_before_the_first_byte() {
        let h = Harness::new();
        let events = h
            .run(vec![
                h.planned("0", "mem://a", None),
                h.planned("1", "mem://b", None),
            ])
            .await;

        assert_eq!(
            events[..3],
            [
                WorkerEvent::SizeKnown {
                    file_id: FileId::from("0"),
                    total: 10
                },
                WorkerEvent::SizeKnown {
                    file_id: FileId::from("1"),
                    total: 16
                },
                WorkerEvent::FileStarted {
                    file_id: FileId::from("0"),
                    on_disk: 0
                },
            ]
        );
    }

    #[tokio::test]
    async fn later_size_failure_transfers_nothing() {
        let h = Harness::new();
        let events = h
            .run(vec![
                h.planned("0", "mem://a", None),
                h.planned("1", "mem://missing", None),
            ])
            .await;

        assert_eq!(
            events,
            vec![
                WorkerEvent::SizeKnown {
                    file_id: FileId::from("0"),
                    total: 10
                },
                WorkerEvent::FileFailed {
                    file_id: FileId::from("1"),
                    kind: DownloadErrorKind::SizeQueryFailed
                },
                WorkerEvent::Exited
            ]
        );
        assert!(!h.dir.path().join("w").join("0").exists());
    }

    #[tokio::test]
    async fn offline_start_is_an_interruption() {
        let h = Harness::new();
        h.connectivity.set(NetworkState::OFFLINE);
        let events = h.run(vec![h.planned("0", "mem://a", Some(10))]).await;
        assert!(matches!(events[0], WorkerEvent::Interrupted { .. }));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn oversized_body_is_a_size_mismatch() {
        let h = Harness::new();
        let events = h.run(vec![h.planned("0", "mem://b", Some(8))]).await;
        assert!(events.contains(&WorkerEvent::FileFailed {
            file_id: FileId::from("0"),
            kind: DownloadErrorKind::SizeMismatch
        }));
    }

    #[tokio::test]
    async fn complete_file_on_disk_is_not_downloaded_again() {
        let h = Harness::new();
        let path = h.dir.path().join("w").join("0");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"abcdefghij").unwrap();

        let events = h.run(vec![h.planned("0", "mem://a", Some(10))]).await;
        assert_eq!(
            events,
            vec![
                WorkerEvent::FileStarted {
                    file_id: FileId::from("0"),
                    on_disk: 10
                },
                WorkerEvent::FileFinished {
                    file_id: FileId::from("0")
                },
                WorkerEvent::Exited
            ]
        );
    }
}
